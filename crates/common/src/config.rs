//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Global application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root directory under which per-session export workspaces are created.
    pub temp_root: PathBuf,

    /// External encoder settings.
    pub encoder: EncoderConfig,

    /// Font families available to text overlays.
    pub fonts: FontConfig,

    /// Default export parameters.
    pub export: ExportDefaults,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Where to find the external encoder tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// ffmpeg binary name or absolute path.
    pub ffmpeg_path: PathBuf,

    /// ffprobe binary name or absolute path.
    pub ffprobe_path: PathBuf,

    /// Extra arguments appended before the output path (e.g. `-threads 4`).
    pub extra_args: Vec<String>,
}

/// Font catalog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FontConfig {
    /// Family used when a requested family or variant is not installed.
    pub default_family: String,

    /// Known families and their font files.
    pub families: Vec<FontFamilyConfig>,
}

/// One font family with its variant files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FontFamilyConfig {
    pub family: String,
    pub files: Vec<FontFileConfig>,
}

/// A concrete font file for a weight/style variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FontFileConfig {
    /// CSS-style numeric weight (400 regular, 700 bold).
    #[serde(default = "default_weight")]
    pub weight: u16,

    /// Whether this file is the italic variant.
    #[serde(default)]
    pub italic: bool,

    pub path: PathBuf,
}

fn default_weight() -> u16 {
    400
}

/// Default export parameters used by front-ends when the caller omits them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportDefaults {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Quality preset name (draft, standard, high, lossless).
    pub quality: String,
    /// Container name (mp4, webm, mov).
    pub format: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "splice_export=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            temp_root: std::env::temp_dir(),
            encoder: EncoderConfig::default(),
            fonts: FontConfig::default(),
            export: ExportDefaults::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            extra_args: vec![],
        }
    }
}

impl Default for FontConfig {
    fn default() -> Self {
        Self {
            default_family: "DejaVu Sans".to_string(),
            families: vec![FontFamilyConfig {
                family: "DejaVu Sans".to_string(),
                files: vec![
                    FontFileConfig {
                        weight: 400,
                        italic: false,
                        path: PathBuf::from("/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf"),
                    },
                    FontFileConfig {
                        weight: 700,
                        italic: false,
                        path: PathBuf::from(
                            "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
                        ),
                    },
                    FontFileConfig {
                        weight: 400,
                        italic: true,
                        path: PathBuf::from(
                            "/usr/share/fonts/truetype/dejavu/DejaVuSans-Oblique.ttf",
                        ),
                    },
                    FontFileConfig {
                        weight: 700,
                        italic: true,
                        path: PathBuf::from(
                            "/usr/share/fonts/truetype/dejavu/DejaVuSans-BoldOblique.ttf",
                        ),
                    },
                ],
            }],
        }
    }
}

impl Default for ExportDefaults {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            quality: "standard".to_string(),
            format: "mp4".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        Self::load_from(&config_file_path())
    }

    /// Load config from an explicit path, falling back to defaults.
    pub fn load_from(config_path: &std::path::Path) -> Self {
        if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let config_path = config_file_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(config_path, json)
    }
}

/// Standard config file location.
pub fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("splice").join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: AppConfig =
            serde_json::from_str(r#"{ "encoder": { "ffmpeg_path": "/opt/ffmpeg/bin/ffmpeg" } }"#)
                .unwrap();
        assert_eq!(
            parsed.encoder.ffmpeg_path,
            PathBuf::from("/opt/ffmpeg/bin/ffmpeg")
        );
        assert_eq!(parsed.encoder.ffprobe_path, PathBuf::from("ffprobe"));
        assert_eq!(parsed.export.fps, 30);
        assert_eq!(parsed.fonts.default_family, "DejaVu Sans");
    }

    #[test]
    fn test_font_file_weight_defaults_to_regular() {
        let parsed: FontFileConfig = serde_json::from_str(r#"{ "path": "/f.ttf" }"#).unwrap();
        assert_eq!(parsed.weight, 400);
        assert!(!parsed.italic);
    }

    #[test]
    fn test_load_from_invalid_file_falls_back() {
        let path = std::env::temp_dir().join("splice_test_invalid_config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let config = AppConfig::load_from(&path);
        assert_eq!(config.export.width, 1920);
        std::fs::remove_file(&path).ok();
    }
}
