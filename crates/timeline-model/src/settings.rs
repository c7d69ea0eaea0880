//! Export settings, fixed for the lifetime of an export session.

use serde::{Deserialize, Serialize};

use crate::timeline::ModelError;

/// Encoding quality preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Draft,
    #[default]
    Standard,
    High,
    Lossless,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Draft => "draft",
            Quality::Standard => "standard",
            Quality::High => "high",
            Quality::Lossless => "lossless",
        }
    }

    /// Constant rate factor for x264-family encoders.
    pub fn crf(self) -> u8 {
        match self {
            Quality::Draft => 28,
            Quality::Standard => 23,
            Quality::High => 18,
            Quality::Lossless => 0,
        }
    }

    /// Encoder speed preset paired with [`Quality::crf`].
    pub fn preset(self) -> &'static str {
        match self {
            Quality::Draft => "veryfast",
            Quality::Standard => "medium",
            Quality::High => "slow",
            Quality::Lossless => "veryslow",
        }
    }
}

impl std::str::FromStr for Quality {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "draft" => Ok(Quality::Draft),
            "standard" => Ok(Quality::Standard),
            "high" => Ok(Quality::High),
            "lossless" => Ok(Quality::Lossless),
            other => Err(ModelError::InvalidSettings {
                message: format!("unknown quality '{other}'"),
            }),
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Mp4,
    Webm,
    Mov,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Webm => "webm",
            OutputFormat::Mov => "mov",
        }
    }

    /// Video encoder used when re-encoding into this container.
    pub fn video_encoder(self) -> &'static str {
        match self {
            OutputFormat::Mp4 | OutputFormat::Mov => "libx264",
            OutputFormat::Webm => "libvpx-vp9",
        }
    }

    pub fn audio_encoder(self) -> &'static str {
        match self {
            OutputFormat::Mp4 | OutputFormat::Mov => "aac",
            OutputFormat::Webm => "libopus",
        }
    }

    /// Whether the container can carry a stream-copied video codec.
    ///
    /// `codec` is the probe-reported codec name (e.g. `h264`).
    pub fn accepts_video_codec(self, codec: &str) -> bool {
        match self {
            OutputFormat::Mp4 => matches!(codec, "h264" | "hevc" | "av1" | "mpeg4"),
            OutputFormat::Mov => {
                matches!(codec, "h264" | "hevc" | "prores" | "mpeg4" | "mjpeg")
            }
            OutputFormat::Webm => matches!(codec, "vp8" | "vp9" | "av1"),
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mp4" => Ok(OutputFormat::Mp4),
            "webm" => Ok(OutputFormat::Webm),
            "mov" => Ok(OutputFormat::Mov),
            other => Err(ModelError::InvalidSettings {
                message: format!("unknown output format '{other}'"),
            }),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Output parameters for one export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    #[serde(default)]
    pub quality: Quality,
    #[serde(default)]
    pub output_format: OutputFormat,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            quality: Quality::Standard,
            output_format: OutputFormat::Mp4,
        }
    }
}

impl ExportSettings {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            ..Default::default()
        }
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_format(mut self, output_format: OutputFormat) -> Self {
        self.output_format = output_format;
        self
    }

    /// Non-zero even dimensions and a frame rate in `1..=240`.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.width == 0 || self.height == 0 {
            return Err(ModelError::InvalidSettings {
                message: format!("dimensions {}x{} must be non-zero", self.width, self.height),
            });
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(ModelError::InvalidSettings {
                message: format!("dimensions {}x{} must be even", self.width, self.height),
            });
        }
        if !(1..=240).contains(&self.fps) {
            return Err(ModelError::InvalidSettings {
                message: format!("fps {} outside 1..=240", self.fps),
            });
        }
        Ok(())
    }

    pub fn extension(&self) -> &'static str {
        self.output_format.extension()
    }
}
