//! Timeline elements and their kind-specific payloads.
//!
//! An element is a single timed item on a track. The common timing fields are
//! shared by every kind; everything else lives in a closed [`ElementPayload`]
//! variant so that renderers match on it exhaustively.

use serde::{Deserialize, Serialize};

use crate::track::TrackKind;

/// Opaque handle to a media source, resolved outside the model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRef(pub String);

impl SourceRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single timed item on a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    /// Unique element identifier (unique across the whole timeline).
    pub id: String,

    /// Timeline position of the untrimmed element start, in seconds.
    pub start_time: f64,

    /// Untrimmed element length, in seconds.
    pub duration: f64,

    /// Seconds cut from the head of the element.
    #[serde(default)]
    pub trim_start: f64,

    /// Seconds cut from the tail of the element.
    #[serde(default)]
    pub trim_end: f64,

    /// Opacity in `[0.0, 1.0]`.
    #[serde(default = "default_opacity")]
    pub opacity: f64,

    /// Hidden elements are kept on the timeline but never rendered.
    #[serde(default)]
    pub hidden: bool,

    /// How the element composites onto the layers beneath it.
    #[serde(default)]
    pub blend_mode: BlendMode,

    /// Kind-specific data.
    pub payload: ElementPayload,
}

fn default_opacity() -> f64 {
    1.0
}

fn default_volume() -> f64 {
    1.0
}

/// Half-open interval `[start, end)` during which an element is visible.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisibleWindow {
    pub start: f64,
    pub end: f64,
}

impl VisibleWindow {
    pub fn length(&self) -> f64 {
        self.end - self.start
    }

    pub fn contains(&self, time_secs: f64) -> bool {
        time_secs >= self.start && time_secs < self.end
    }
}

/// Kind-specific element payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementPayload {
    Media(MediaPayload),
    Audio(AudioPayload),
    Text(TextPayload),
    Caption(TextPayload),
    Sticker(StickerPayload),
    Effect(EffectParams),
    Component(ComponentPayload),
}

/// Video clip payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub source: SourceRef,

    /// Per-element color/blur adjustments.
    #[serde(default)]
    pub effects: Option<EffectParams>,

    /// Linear gain for the clip's embedded audio.
    #[serde(default = "default_volume")]
    pub volume: f64,

    #[serde(default)]
    pub muted: bool,
}

/// Audio clip payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioPayload {
    pub source: SourceRef,

    #[serde(default = "default_volume")]
    pub volume: f64,

    #[serde(default)]
    pub muted: bool,
}

/// Text and caption payload.
///
/// `x`/`y` are canvas pixels relative to the canvas center (`0, 0` is the
/// middle of the frame, positive `y` points down).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPayload {
    pub content: String,
    pub font_family: String,
    pub font_size_px: f64,
    pub color: String,
    #[serde(default)]
    pub background_color: Option<String>,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub rotation_degrees: f64,
    #[serde(default)]
    pub text_align: TextAlign,
    #[serde(default)]
    pub font_weight: Option<FontWeight>,
    #[serde(default)]
    pub font_style: Option<FontStyle>,
}

/// Horizontal anchor of a text block relative to its `x` position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextAlign {
    Left,
    #[default]
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontWeight {
    #[default]
    Normal,
    Bold,
}

impl FontWeight {
    /// CSS numeric weight.
    pub fn value(self) -> u16 {
        match self {
            FontWeight::Normal => 400,
            FontWeight::Bold => 700,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontStyle {
    #[default]
    Normal,
    Italic,
}

/// Image overlay payload. Position is center-relative like text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StickerPayload {
    pub source: SourceRef,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub rotation_degrees: f64,
}

/// Color and blur adjustments. Unset fields leave the image untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectParams {
    /// Additive brightness in `[-1.0, 1.0]`.
    pub brightness: Option<f64>,
    /// Contrast multiplier in `[0.0, 4.0]`.
    pub contrast: Option<f64>,
    /// Saturation multiplier in `[0.0, 3.0]`.
    pub saturation: Option<f64>,
    /// Hue rotation in degrees.
    pub hue: Option<f64>,
    /// Gaussian blur sigma in pixels.
    pub blur: Option<f64>,
    pub grayscale: bool,
    pub invert: bool,
}

impl EffectParams {
    /// True when no adjustment is requested.
    pub fn is_empty(&self) -> bool {
        self.brightness.is_none()
            && self.contrast.is_none()
            && self.saturation.is_none()
            && self.hue.is_none()
            && self.blur.is_none()
            && !self.grayscale
            && !self.invert
    }

    fn validate(&self) -> Result<(), String> {
        check_range("brightness", self.brightness, -1.0, 1.0)?;
        check_range("contrast", self.contrast, 0.0, 4.0)?;
        check_range("saturation", self.saturation, 0.0, 3.0)?;
        check_range("hue", self.hue, -360.0, 360.0)?;
        check_range("blur", self.blur, 0.0, 100.0)?;
        Ok(())
    }
}

fn check_range(name: &str, value: Option<f64>, min: f64, max: f64) -> Result<(), String> {
    match value {
        Some(v) if !v.is_finite() || v < min || v > max => {
            Err(format!("{name} {v} outside [{min}, {max}]"))
        }
        _ => Ok(()),
    }
}

/// Externally authored animated component placed on the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentPayload {
    pub component_id: String,

    /// Opaque props forwarded to the component's render function.
    #[serde(default)]
    pub props: serde_json::Map<String, serde_json::Value>,

    pub render_mode: RenderMode,

    /// Rendered asset for `prerendered` components.
    #[serde(default)]
    pub prerendered_source: Option<SourceRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// Rendered per frame by invoking the component.
    Live,
    /// Rendered ahead of time into `prerendered_source`.
    Prerendered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Add,
}

impl ElementPayload {
    /// The only track kind that may hold this payload.
    pub fn track_kind(&self) -> TrackKind {
        match self {
            ElementPayload::Media(_) => TrackKind::Media,
            ElementPayload::Audio(_) => TrackKind::Audio,
            ElementPayload::Text(_) => TrackKind::Text,
            ElementPayload::Caption(_) => TrackKind::Caption,
            ElementPayload::Sticker(_) => TrackKind::Sticker,
            ElementPayload::Effect(_) => TrackKind::Effect,
            ElementPayload::Component(_) => TrackKind::ProgrammaticComponent,
        }
    }

    /// Text payload for text and caption elements.
    pub fn text(&self) -> Option<&TextPayload> {
        match self {
            ElementPayload::Text(text) | ElementPayload::Caption(text) => Some(text),
            _ => None,
        }
    }

    /// Source handles referenced by this payload.
    pub fn sources(&self) -> Vec<&SourceRef> {
        match self {
            ElementPayload::Media(media) => vec![&media.source],
            ElementPayload::Audio(audio) => vec![&audio.source],
            ElementPayload::Sticker(sticker) => vec![&sticker.source],
            ElementPayload::Component(component) => {
                component.prerendered_source.iter().collect()
            }
            ElementPayload::Text(_) | ElementPayload::Caption(_) | ElementPayload::Effect(_) => {
                vec![]
            }
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            ElementPayload::Media(media) => {
                check_source(&media.source)?;
                check_volume(media.volume)?;
                if let Some(effects) = &media.effects {
                    effects.validate()?;
                }
                Ok(())
            }
            ElementPayload::Audio(audio) => {
                check_source(&audio.source)?;
                check_volume(audio.volume)
            }
            ElementPayload::Text(text) | ElementPayload::Caption(text) => {
                if !(text.font_size_px.is_finite() && text.font_size_px > 0.0) {
                    return Err(format!("font size {} must be positive", text.font_size_px));
                }
                if text.font_family.trim().is_empty() {
                    return Err("font family must not be empty".to_string());
                }
                if !(text.x.is_finite() && text.y.is_finite() && text.rotation_degrees.is_finite())
                {
                    return Err("text position and rotation must be finite".to_string());
                }
                Ok(())
            }
            ElementPayload::Sticker(sticker) => {
                check_source(&sticker.source)?;
                if !(sticker.width > 0.0 && sticker.height > 0.0) {
                    return Err(format!(
                        "sticker size {}x{} must be positive",
                        sticker.width, sticker.height
                    ));
                }
                Ok(())
            }
            ElementPayload::Effect(params) => params.validate(),
            ElementPayload::Component(component) => {
                if component.component_id.trim().is_empty() {
                    return Err("component id must not be empty".to_string());
                }
                if component.render_mode == RenderMode::Prerendered {
                    match &component.prerendered_source {
                        Some(source) => check_source(source)?,
                        None => {
                            return Err(
                                "prerendered component requires a prerendered source".to_string()
                            )
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

fn check_source(source: &SourceRef) -> Result<(), String> {
    if source.0.trim().is_empty() {
        return Err("source reference must not be empty".to_string());
    }
    Ok(())
}

fn check_volume(volume: f64) -> Result<(), String> {
    if !(volume.is_finite() && volume >= 0.0) {
        return Err(format!("volume {volume} must be non-negative"));
    }
    Ok(())
}

impl Element {
    /// Create an element with default opacity and no trim.
    pub fn new(
        id: impl Into<String>,
        start_time: f64,
        duration: f64,
        payload: ElementPayload,
    ) -> Self {
        Self {
            id: id.into(),
            start_time,
            duration,
            trim_start: 0.0,
            trim_end: 0.0,
            opacity: 1.0,
            hidden: false,
            blend_mode: BlendMode::Normal,
            payload,
        }
    }

    pub fn with_trim(mut self, trim_start: f64, trim_end: f64) -> Self {
        self.trim_start = trim_start;
        self.trim_end = trim_end;
        self
    }

    pub fn with_opacity(mut self, opacity: f64) -> Self {
        self.opacity = opacity;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Interval during which the element is on screen.
    pub fn visible_window(&self) -> VisibleWindow {
        VisibleWindow {
            start: self.start_time + self.trim_start,
            end: self.start_time + self.duration - self.trim_end,
        }
    }

    /// Timeline end of the untrimmed element.
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }

    /// Check the timing invariants and the payload.
    ///
    /// Returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("element id must not be empty".to_string());
        }
        if !(self.start_time.is_finite() && self.start_time >= 0.0) {
            return Err(format!("start time {} must be >= 0", self.start_time));
        }
        if !(self.duration.is_finite() && self.duration > 0.0) {
            return Err(format!("duration {} must be > 0", self.duration));
        }
        if !(self.trim_start.is_finite() && self.trim_start >= 0.0) {
            return Err(format!("trim start {} must be >= 0", self.trim_start));
        }
        if !(self.trim_end.is_finite() && self.trim_end >= 0.0) {
            return Err(format!("trim end {} must be >= 0", self.trim_end));
        }
        if self.trim_start + self.trim_end >= self.duration {
            return Err(format!(
                "trim start {} + trim end {} must be less than duration {}",
                self.trim_start, self.trim_end, self.duration
            ));
        }
        if !(0.0..=1.0).contains(&self.opacity) {
            return Err(format!("opacity {} outside [0, 1]", self.opacity));
        }
        if self.visible_window().length() <= 0.0 {
            return Err("visible window is empty".to_string());
        }
        self.payload.validate()
    }
}
