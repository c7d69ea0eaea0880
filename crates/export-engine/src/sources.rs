//! Source resolution: turning opaque `SourceRef` handles into probed files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use splice_common::error::{SpliceError, SpliceResult};
use splice_timeline::{SourceRef, Timeline};

use crate::backend::CancelFlag;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp", "gif"];
const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "aac", "m4a", "flac", "ogg", "opus"];

/// What a source file contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Video,
    Audio,
    Image,
}

/// First video stream of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoStreamInfo {
    /// Probe codec name, e.g. `h264`.
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub fps: Option<f64>,
}

/// A source reference resolved to a readable file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub reference: SourceRef,
    pub path: PathBuf,
    pub kind: SourceKind,
    pub duration_secs: Option<f64>,
    pub video: Option<VideoStreamInfo>,
    pub has_audio: bool,
}

impl ResolvedSource {
    /// A video source with known stream parameters.
    pub fn video(
        reference: impl Into<String>,
        path: impl Into<PathBuf>,
        codec: &str,
        width: u32,
        height: u32,
        duration_secs: f64,
    ) -> Self {
        Self {
            reference: SourceRef::new(reference),
            path: path.into(),
            kind: SourceKind::Video,
            duration_secs: Some(duration_secs),
            video: Some(VideoStreamInfo {
                codec: codec.to_string(),
                width,
                height,
                fps: None,
            }),
            has_audio: true,
        }
    }

    pub fn audio(reference: impl Into<String>, path: impl Into<PathBuf>, duration_secs: f64) -> Self {
        Self {
            reference: SourceRef::new(reference),
            path: path.into(),
            kind: SourceKind::Audio,
            duration_secs: Some(duration_secs),
            video: None,
            has_audio: true,
        }
    }
}

/// Sources used by one export, keyed by reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceTable {
    entries: BTreeMap<SourceRef, ResolvedSource>,
}

impl SourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: ResolvedSource) {
        self.entries.insert(source.reference.clone(), source);
    }

    /// Look up a source that must have been resolved during preparation.
    pub fn get(&self, reference: &SourceRef) -> SpliceResult<&ResolvedSource> {
        self.entries
            .get(reference)
            .ok_or_else(|| SpliceError::resource(format!("Unresolved source: {reference}")))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedSource> {
        self.entries.values()
    }
}

impl FromIterator<ResolvedSource> for SourceTable {
    fn from_iter<T: IntoIterator<Item = ResolvedSource>>(iter: T) -> Self {
        let mut table = SourceTable::new();
        for source in iter {
            table.insert(source);
        }
        table
    }
}

/// Resolves source references to probed files.
pub trait SourceResolver: Send + Sync {
    fn resolve(&self, reference: &SourceRef) -> SpliceResult<ResolvedSource>;
}

/// Resolve every source referenced by a non-hidden element.
///
/// A missing source fails the whole export.
pub fn resolve_all(
    timeline: &Timeline,
    resolver: &dyn SourceResolver,
    cancel: &CancelFlag,
) -> SpliceResult<SourceTable> {
    let mut table = SourceTable::new();
    for active in timeline.elements().filter(|a| !a.element.hidden) {
        for reference in active.element.payload.sources() {
            if table.entries.contains_key(reference) {
                continue;
            }
            cancel.check()?;
            let resolved = resolver.resolve(reference)?;
            tracing::debug!(
                source = %reference,
                path = %resolved.path.display(),
                kind = ?resolved.kind,
                "Resolved source"
            );
            table.insert(resolved);
        }
    }
    Ok(table)
}

/// Resolves references as file paths, probing media with ffprobe.
#[derive(Debug, Clone, Default)]
pub struct FsSourceResolver {
    base_dir: Option<PathBuf>,
    ffprobe: Option<PathBuf>,
}

impl FsSourceResolver {
    /// Relative references are joined onto `base_dir` when set.
    pub fn new(base_dir: Option<PathBuf>, ffprobe: Option<PathBuf>) -> Self {
        Self { base_dir, ffprobe }
    }

    fn path_for(&self, reference: &SourceRef) -> PathBuf {
        let path = PathBuf::from(reference.as_str());
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }
}

impl SourceResolver for FsSourceResolver {
    fn resolve(&self, reference: &SourceRef) -> SpliceResult<ResolvedSource> {
        let path = self.path_for(reference);
        if !path.is_file() {
            return Err(SpliceError::FileNotFound { path });
        }

        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            let (width, height) = image::image_dimensions(&path).map_err(|e| {
                SpliceError::resource(format!("Failed to read image {}: {e}", path.display()))
            })?;
            return Ok(ResolvedSource {
                reference: reference.clone(),
                path,
                kind: SourceKind::Image,
                duration_secs: None,
                video: Some(VideoStreamInfo {
                    codec: extension,
                    width,
                    height,
                    fps: None,
                }),
                has_audio: false,
            });
        }

        match &self.ffprobe {
            Some(ffprobe) => probe_source(ffprobe, reference, &path),
            None => {
                tracing::warn!(
                    source = %reference,
                    "ffprobe unavailable; source stream parameters unknown"
                );
                let audio_only = AUDIO_EXTENSIONS.contains(&extension.as_str());
                Ok(ResolvedSource {
                    reference: reference.clone(),
                    path,
                    kind: if audio_only {
                        SourceKind::Audio
                    } else {
                        SourceKind::Video
                    },
                    duration_secs: None,
                    video: None,
                    has_audio: audio_only,
                })
            }
        }
    }
}

fn probe_source(ffprobe: &Path, reference: &SourceRef, path: &Path) -> SpliceResult<ResolvedSource> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .map_err(|e| SpliceError::resource(format!("Failed to start ffprobe: {e}")))?;

    if !output.status.success() {
        return Err(SpliceError::resource(format!(
            "ffprobe could not read {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    parse_probe_json(reference, path, &String::from_utf8_lossy(&output.stdout))
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Interpret `ffprobe -print_format json -show_format -show_streams` output.
pub(crate) fn parse_probe_json(
    reference: &SourceRef,
    path: &Path,
    json: &str,
) -> SpliceResult<ResolvedSource> {
    let probe: ProbeOutput = serde_json::from_str(json)?;

    let video_stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let has_audio = probe
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let video = video_stream.and_then(|s| {
        Some(VideoStreamInfo {
            codec: s.codec_name.clone()?,
            width: s.width.filter(|w| *w > 0)?,
            height: s.height.filter(|h| *h > 0)?,
            fps: s.r_frame_rate.as_deref().and_then(parse_rate),
        })
    });

    let duration_secs = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or_else(|| video_stream.and_then(|s| s.duration.as_deref()))
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0);

    let kind = match (&video, has_audio) {
        (Some(_), _) => SourceKind::Video,
        (None, true) => SourceKind::Audio,
        (None, false) => {
            return Err(SpliceError::resource(format!(
                "{} has no decodable audio or video stream",
                path.display()
            )))
        }
    };

    Ok(ResolvedSource {
        reference: reference.clone(),
        path: path.to_path_buf(),
        kind,
        duration_secs,
        video,
        has_audio,
    })
}

fn parse_rate(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/')?;
    let num = num.parse::<f64>().ok()?;
    let den = den.parse::<f64>().ok()?;
    (den > 0.0 && num > 0.0).then(|| num / den)
}

#[cfg(test)]
mod tests {
    use super::*;
    use splice_timeline::{AudioPayload, Element, ElementPayload, Track, TrackKind};

    const PROBE: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080, "r_frame_rate": "30000/1001"},
            {"codec_type": "audio", "codec_name": "aac"}
        ],
        "format": {"duration": "12.500000"}
    }"#;

    #[test]
    fn test_parse_probe_json_video_with_audio() {
        let source =
            parse_probe_json(&SourceRef::new("clip"), Path::new("/m/clip.mp4"), PROBE).unwrap();
        assert_eq!(source.kind, SourceKind::Video);
        assert!(source.has_audio);
        assert_eq!(source.duration_secs, Some(12.5));
        let video = source.video.unwrap();
        assert_eq!(video.codec, "h264");
        assert_eq!((video.width, video.height), (1920, 1080));
        assert!((video.fps.unwrap() - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_parse_probe_json_audio_only() {
        let json = r#"{"streams": [{"codec_type": "audio", "codec_name": "mp3"}], "format": {"duration": "3.0"}}"#;
        let source =
            parse_probe_json(&SourceRef::new("a"), Path::new("/m/a.mp3"), json).unwrap();
        assert_eq!(source.kind, SourceKind::Audio);
        assert!(source.video.is_none());
    }

    #[test]
    fn test_parse_probe_json_without_streams_fails() {
        let json = r#"{"streams": [], "format": {}}"#;
        assert!(parse_probe_json(&SourceRef::new("x"), Path::new("/x"), json).is_err());
    }

    #[test]
    fn test_missing_file_is_file_not_found() {
        let resolver = FsSourceResolver::new(Some(PathBuf::from("/nonexistent-splice")), None);
        let err = resolver.resolve(&SourceRef::new("missing.mp4")).unwrap_err();
        assert!(matches!(err, SpliceError::FileNotFound { .. }));
    }

    struct CountingResolver(std::sync::Mutex<usize>);

    impl SourceResolver for CountingResolver {
        fn resolve(&self, reference: &SourceRef) -> SpliceResult<ResolvedSource> {
            *self.0.lock().unwrap() += 1;
            Ok(ResolvedSource::audio(reference.as_str(), "/a.wav", 1.0))
        }
    }

    #[test]
    fn test_resolve_all_deduplicates_and_skips_hidden() {
        let mut timeline = Timeline::new();
        timeline
            .add_track(Track::new("a1", TrackKind::Audio, "Audio"))
            .unwrap();
        let audio = |id: &str, source: &str| {
            Element::new(
                id,
                0.0,
                1.0,
                ElementPayload::Audio(AudioPayload {
                    source: SourceRef::new(source),
                    volume: 1.0,
                    muted: false,
                }),
            )
        };
        timeline.add_element("a1", audio("one", "music.wav")).unwrap();
        timeline.add_element("a1", audio("two", "music.wav")).unwrap();
        timeline
            .add_element("a1", audio("three", "unused.wav").hidden())
            .unwrap();

        let resolver = CountingResolver(std::sync::Mutex::new(0));
        let table = resolve_all(&timeline, &resolver, &CancelFlag::new()).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(*resolver.0.lock().unwrap(), 1);
    }
}
