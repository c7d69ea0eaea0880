//! Host environment capabilities, detected once and passed to the policy.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use splice_common::config::EncoderConfig;

/// Encoders the export path may ask for.
const KNOWN_ENCODERS: &[&str] = &["libx264", "libvpx-vp9", "aac", "libopus"];

/// What the host can do. Populated once by [`EnvironmentCapabilities::detect`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentCapabilities {
    /// ffmpeg binary, when found.
    pub ffmpeg: Option<PathBuf>,

    /// ffprobe binary, when found.
    pub ffprobe: Option<PathBuf>,

    /// Whether ffmpeg was built with the `drawtext` filter (libfreetype).
    pub drawtext: bool,

    /// Subset of [`KNOWN_ENCODERS`] compiled into ffmpeg.
    pub encoders: BTreeSet<String>,
}

impl EnvironmentCapabilities {
    /// Probe the configured encoder binaries.
    pub fn detect(config: &EncoderConfig) -> Self {
        let ffmpeg = locate_binary(&config.ffmpeg_path);
        let ffprobe = locate_binary(&config.ffprobe_path);

        let (drawtext, encoders) = match &ffmpeg {
            Some(path) => (
                list_contains(path, "-filters", "drawtext"),
                KNOWN_ENCODERS
                    .iter()
                    .filter(|name| list_contains(path, "-encoders", name))
                    .map(|name| name.to_string())
                    .collect(),
            ),
            None => (false, BTreeSet::new()),
        };

        let caps = Self {
            ffmpeg,
            ffprobe,
            drawtext,
            encoders,
        };
        tracing::info!(
            ffmpeg = ?caps.ffmpeg,
            ffprobe = ?caps.ffprobe,
            drawtext = caps.drawtext,
            encoders = ?caps.encoders,
            "Detected environment capabilities"
        );
        caps
    }

    /// No external tools at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// A fully featured environment using the given ffmpeg path.
    pub fn with_encoder(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: Some(ffmpeg.into()),
            ffprobe: None,
            drawtext: true,
            encoders: KNOWN_ENCODERS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Whether a native encoder binary is present.
    pub fn has_encoder(&self) -> bool {
        self.ffmpeg.is_some()
    }

    pub fn has_video_encoder(&self, name: &str) -> bool {
        self.encoders.contains(name)
    }
}

/// Resolve a binary name or path to something runnable.
pub(crate) fn locate_binary(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() > 1 {
        return binary.is_file().then(|| binary.to_path_buf());
    }
    command_exists(&binary.to_string_lossy()).then(|| binary.to_path_buf())
}

fn command_exists(binary: &str) -> bool {
    Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {binary} >/dev/null 2>&1"))
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn list_contains(ffmpeg: &Path, flag: &str, name: &str) -> bool {
    let output = match Command::new(ffmpeg).args(["-hide_banner", flag]).output() {
        Ok(output) if output.status.success() => output,
        _ => return false,
    };
    listing_has_entry(&String::from_utf8_lossy(&output.stdout), name)
}

/// ffmpeg listings put the entry name in the second whitespace column.
fn listing_has_entry(listing: &str, name: &str) -> bool {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|entry| entry == name)
}
