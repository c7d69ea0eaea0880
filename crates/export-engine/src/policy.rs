//! Engine selection policy.
//!
//! Rules, first match wins:
//! 1. An explicit override is honoured or rejected with a configuration
//!    conflict; it never silently falls back.
//! 2. No encoder binary: compositing.
//! 3. Live programmatic components: compositing.
//! 4. Content the per-stream filter list cannot express: compositing.
//! 5. Plain copy-compatible media: native direct copy.
//! 6. Everything else: native filtered.

use serde::{Deserialize, Serialize};
use splice_common::error::{SpliceError, SpliceResult};
use splice_timeline::{
    BlendMode, ElementPayload, ExportSettings, RenderMode, Timeline, TrackKind,
};

use crate::capabilities::EnvironmentCapabilities;
use crate::filter::escape_filter_text;
use crate::sources::{SourceKind, SourceTable};

/// Tolerance for contiguity checks between clip windows, in seconds.
const CONTIGUITY_EPSILON: f64 = 1e-3;

/// Export engine variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    NativeDirectCopy,
    NativeFiltered,
    Compositing,
}

impl Engine {
    pub fn as_str(self) -> &'static str {
        match self {
            Engine::NativeDirectCopy => "native_direct_copy",
            Engine::NativeFiltered => "native_filtered",
            Engine::Compositing => "compositing",
        }
    }

    pub fn is_native(self) -> bool {
        matches!(self, Engine::NativeDirectCopy | Engine::NativeFiltered)
    }

    /// Documented throughput relative to realtime.
    pub fn estimated_speed(self) -> f64 {
        match self {
            Engine::NativeDirectCopy => 50.0,
            Engine::NativeFiltered => 2.0,
            Engine::Compositing => 0.15,
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Engine {
    type Err = SpliceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "native_direct_copy" | "direct_copy" | "copy" => Ok(Engine::NativeDirectCopy),
            "native_filtered" | "filtered" | "native" => Ok(Engine::NativeFiltered),
            "compositing" | "composite" => Ok(Engine::Compositing),
            other => Err(SpliceError::validation(format!("unknown engine '{other}'"))),
        }
    }
}

/// The engine chosen for a session, with its rationale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineDecision {
    pub engine: Engine,
    pub reason: String,
    /// Speed factor relative to realtime.
    pub estimated_performance: f64,
}

impl EngineDecision {
    fn new(engine: Engine, reason: impl Into<String>) -> Self {
        Self {
            engine,
            reason: reason.into(),
            estimated_performance: engine.estimated_speed(),
        }
    }
}

/// Facts about a snapshot that drive selection.
#[derive(Debug, Default)]
struct ContentProfile {
    live_components: Vec<String>,
    /// Why the per-stream filter list cannot express the content.
    native_blockers: Vec<String>,
    /// Why stream copy is not possible.
    copy_blockers: Vec<String>,
}

/// Choose the engine for a snapshot.
pub fn select(
    timeline: &Timeline,
    settings: &ExportSettings,
    sources: &SourceTable,
    capabilities: &EnvironmentCapabilities,
    explicit_override: Option<Engine>,
) -> SpliceResult<EngineDecision> {
    let profile = analyze(timeline, settings, sources, capabilities);

    let decision = match explicit_override {
        Some(engine) => check_override(engine, &profile, capabilities)?,
        None => automatic(&profile, capabilities),
    };

    tracing::info!(
        engine = decision.engine.as_str(),
        reason = %decision.reason,
        overridden = explicit_override.is_some(),
        "Engine selected"
    );
    Ok(decision)
}

fn check_override(
    engine: Engine,
    profile: &ContentProfile,
    capabilities: &EnvironmentCapabilities,
) -> SpliceResult<EngineDecision> {
    if !capabilities.has_encoder() {
        return Err(SpliceError::conflict(format!(
            "{engine} requested but no encoder binary is available"
        )));
    }
    if engine.is_native() {
        if !profile.live_components.is_empty() {
            return Err(SpliceError::conflict(format!(
                "{engine} cannot render live components: {}",
                profile.live_components.join(", ")
            )));
        }
        if let Some(blocker) = profile.native_blockers.first() {
            return Err(SpliceError::conflict(format!("{engine} cannot render: {blocker}")));
        }
    }
    if engine == Engine::NativeDirectCopy {
        if let Some(blocker) = profile.copy_blockers.first() {
            return Err(SpliceError::conflict(format!("{engine} not possible: {blocker}")));
        }
    }
    Ok(EngineDecision::new(engine, "explicit override"))
}

fn automatic(profile: &ContentProfile, capabilities: &EnvironmentCapabilities) -> EngineDecision {
    if !capabilities.has_encoder() {
        return EngineDecision::new(Engine::Compositing, "no native encoder binary available");
    }
    if !profile.live_components.is_empty() {
        return EngineDecision::new(
            Engine::Compositing,
            format!(
                "live components require per-frame rendering: {}",
                profile.live_components.join(", ")
            ),
        );
    }
    if !profile.native_blockers.is_empty() {
        return EngineDecision::new(Engine::Compositing, profile.native_blockers.join("; "));
    }
    if profile.copy_blockers.is_empty() {
        return EngineDecision::new(
            Engine::NativeDirectCopy,
            "copy-compatible media without overlays or effects",
        );
    }
    EngineDecision::new(Engine::NativeFiltered, profile.copy_blockers.join("; "))
}

/// Reject an explicit override the content alone rules out.
///
/// Runs before sources are resolved, so a session is never created for a
/// request that can only end in a configuration conflict. Checks that need
/// resolved stream parameters happen later in [`select`].
pub fn precheck_override(
    timeline: &Timeline,
    capabilities: &EnvironmentCapabilities,
    engine: Engine,
) -> SpliceResult<()> {
    let profile = analyze_content(timeline, capabilities);
    check_override(engine, &profile, capabilities).map(|_| ())
}

fn analyze(
    timeline: &Timeline,
    settings: &ExportSettings,
    sources: &SourceTable,
    capabilities: &EnvironmentCapabilities,
) -> ContentProfile {
    let mut profile = analyze_content(timeline, capabilities);
    check_source_kinds(timeline, sources, &mut profile);
    check_copy_sources(timeline, settings, sources, &mut profile);
    profile
}

/// Everything that can be decided from the snapshot without sources.
fn analyze_content(timeline: &Timeline, capabilities: &EnvironmentCapabilities) -> ContentProfile {
    let mut profile = ContentProfile::default();
    let mut media_tracks = Vec::new();
    let mut media_windows = Vec::new();
    let mut has_text = false;

    for active in timeline.elements().filter(|a| !a.element.hidden) {
        let element = active.element;
        if element.blend_mode != BlendMode::Normal {
            profile.native_blockers.push(format!(
                "{} uses blend mode {:?}",
                element.id, element.blend_mode
            ));
        }
        match &element.payload {
            ElementPayload::Media(media) => {
                if !media_tracks.contains(&active.track_index) {
                    media_tracks.push(active.track_index);
                }
                media_windows.push(element.visible_window());
                if element.opacity < 1.0 {
                    profile
                        .native_blockers
                        .push(format!("{} is translucent", element.id));
                }
                if media.effects.as_ref().is_some_and(|fx| !fx.is_empty()) {
                    profile
                        .copy_blockers
                        .push(format!("{} has per-element effects", element.id));
                }
                if media.muted || (media.volume - 1.0).abs() > f64::EPSILON {
                    profile
                        .copy_blockers
                        .push(format!("{} has adjusted audio", element.id));
                }
            }
            ElementPayload::Audio(_) => {
                profile
                    .copy_blockers
                    .push(format!("{} is a separate audio element", element.id));
            }
            ElementPayload::Text(text) | ElementPayload::Caption(text) => {
                if escape_filter_text(&text.content).is_empty() {
                    continue;
                }
                profile
                    .copy_blockers
                    .push(format!("{} is a text overlay", element.id));
                has_text = true;
                if text.rotation_degrees % 360.0 != 0.0 {
                    profile
                        .native_blockers
                        .push(format!("{} is rotated text", element.id));
                }
            }
            ElementPayload::Effect(params) => {
                if !params.is_empty() {
                    profile
                        .copy_blockers
                        .push(format!("{} is an effect", element.id));
                }
            }
            ElementPayload::Sticker(_) => {
                profile
                    .native_blockers
                    .push(format!("{} is a sticker", element.id));
            }
            ElementPayload::Component(component) => match component.render_mode {
                RenderMode::Live => profile.live_components.push(element.id.clone()),
                RenderMode::Prerendered => profile
                    .native_blockers
                    .push(format!("{} is a prerendered component", element.id)),
            },
        }
    }

    if has_text && !capabilities.drawtext {
        profile
            .native_blockers
            .push("encoder lacks the drawtext filter".to_string());
    }

    let duration = timeline.compute_duration();
    if media_tracks.is_empty() {
        if duration > 0.0 {
            profile
                .native_blockers
                .push("no media layer to draw onto".to_string());
        }
    } else if media_tracks.len() > 1 {
        profile
            .native_blockers
            .push("multiple visual media layers".to_string());
    } else {
        media_windows.sort_by(|a, b| a.start.total_cmp(&b.start));
        let mut cursor = 0.0;
        for window in &media_windows {
            if (window.start - cursor).abs() > CONTIGUITY_EPSILON {
                profile.native_blockers.push(if window.start > cursor {
                    format!("media gap at {cursor:.3}s")
                } else {
                    format!("media overlap at {:.3}s", window.start)
                });
                break;
            }
            cursor = window.end;
        }
        if cursor + CONTIGUITY_EPSILON < duration {
            profile
                .native_blockers
                .push(format!("media ends at {cursor:.3}s before timeline end"));
        }
    }

    profile
}

fn check_source_kinds(timeline: &Timeline, sources: &SourceTable, profile: &mut ContentProfile) {
    for active in timeline.elements().filter(|a| !a.element.hidden) {
        let ElementPayload::Media(media) = &active.element.payload else {
            continue;
        };
        let id = &active.element.id;
        match sources.get(&media.source) {
            Ok(source) if source.kind == SourceKind::Audio => profile
                .native_blockers
                .push(format!("{id} has no video stream")),
            Ok(source) if source.kind == SourceKind::Image => profile
                .native_blockers
                .push(format!("{id} is a still image")),
            Ok(_) => {}
            Err(_) => profile
                .native_blockers
                .push(format!("{id} source is unresolved")),
        }
    }
}

fn check_copy_sources(
    timeline: &Timeline,
    settings: &ExportSettings,
    sources: &SourceTable,
    profile: &mut ContentProfile,
) {
    let media_sources = timeline
        .elements()
        .filter(|a| !a.element.hidden && a.track_kind == TrackKind::Media)
        .filter_map(|a| match &a.element.payload {
            ElementPayload::Media(media) => sources.get(&media.source).ok(),
            _ => None,
        });

    let mut codec: Option<&str> = None;
    for source in media_sources {
        let Some(video) = &source.video else {
            profile
                .copy_blockers
                .push(format!("{} stream parameters unknown", source.reference));
            continue;
        };
        if (video.width, video.height) != (settings.width, settings.height) {
            profile.copy_blockers.push(format!(
                "{} is {}x{}, output is {}x{}",
                source.reference, video.width, video.height, settings.width, settings.height
            ));
        }
        if !settings.output_format.accepts_video_codec(&video.codec) {
            profile.copy_blockers.push(format!(
                "{} container cannot carry {}",
                settings.output_format, video.codec
            ));
        }
        match codec {
            None => codec = Some(&video.codec),
            Some(first) if first != video.codec => {
                profile
                    .copy_blockers
                    .push(format!("mixed codecs {first} and {}", video.codec));
            }
            Some(_) => {}
        }
    }
}
