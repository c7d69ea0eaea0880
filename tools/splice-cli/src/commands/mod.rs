pub mod check;
pub mod compile;
pub mod export;
pub mod info;
pub mod validate;

use std::path::Path;

use clap::Args;
use splice_common::config::ExportDefaults;
use splice_timeline::{ExportSettings, OutputFormat, Quality, Timeline};

/// Output settings; unset values come from the config's export defaults.
#[derive(Debug, Clone, Default, Args)]
pub struct SettingsArgs {
    /// Output width
    #[arg(long)]
    pub width: Option<u32>,

    /// Output height
    #[arg(long)]
    pub height: Option<u32>,

    /// Output frame rate
    #[arg(long)]
    pub fps: Option<u32>,

    /// Quality preset: draft, standard, high, lossless
    #[arg(long)]
    pub quality: Option<String>,

    /// Container: mp4, webm, mov
    #[arg(long)]
    pub format: Option<String>,
}

impl SettingsArgs {
    pub fn resolve(&self, defaults: &ExportDefaults) -> anyhow::Result<ExportSettings> {
        let quality: Quality = self
            .quality
            .as_deref()
            .unwrap_or(&defaults.quality)
            .parse()?;
        let format: OutputFormat = self
            .format
            .as_deref()
            .unwrap_or(&defaults.format)
            .parse()?;
        let settings = ExportSettings::new(
            self.width.unwrap_or(defaults.width),
            self.height.unwrap_or(defaults.height),
            self.fps.unwrap_or(defaults.fps),
        )
        .with_quality(quality)
        .with_format(format);
        settings.validate()?;
        Ok(settings)
    }
}

pub fn load_timeline(path: &Path) -> anyhow::Result<Timeline> {
    Timeline::load(path).map_err(|e| anyhow::anyhow!("Failed to load timeline: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_fall_back_to_config_defaults() {
        let args = SettingsArgs {
            width: Some(1280),
            height: Some(720),
            ..Default::default()
        };
        let settings = args.resolve(&ExportDefaults::default()).unwrap();
        assert_eq!((settings.width, settings.height, settings.fps), (1280, 720, 30));
        assert_eq!(settings.quality, Quality::Standard);
        assert_eq!(settings.output_format, OutputFormat::Mp4);
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let args = SettingsArgs {
            width: Some(1279),
            ..Default::default()
        };
        assert!(args.resolve(&ExportDefaults::default()).is_err());

        let args = SettingsArgs {
            format: Some("avi".to_string()),
            ..Default::default()
        };
        assert!(args.resolve(&ExportDefaults::default()).is_err());
    }
}
