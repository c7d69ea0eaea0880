//! Filter chain compiler.
//!
//! Turns the text, caption, and effect content of a snapshot into an ordered
//! list of backend-agnostic stages, and renders that list as a per-stream
//! ffmpeg filter string. Compilation is a pure function of its inputs: the
//! same snapshot always yields a byte-identical filter string.

use std::cmp::Ordering;
use std::path::Path;

use serde::Serialize;
use splice_timeline::{
    EffectParams, Element, ElementPayload, ExportSettings, TextAlign, TextPayload, Timeline,
    TrackKind, VisibleWindow,
};

use crate::fonts::{FontCatalog, ResolvedFont};

/// Output canvas size used for coordinate translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
}

impl From<&ExportSettings> for Canvas {
    fn from(settings: &ExportSettings) -> Self {
        Self {
            width: settings.width,
            height: settings.height,
        }
    }
}

/// Escape a text value for a drawtext `text=` option.
///
/// Every character outside the escape set passes through unchanged; line
/// breaks (CRLF, CR, LF) become the two characters `\n`.
pub fn escape_filter_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 8);
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            ':' => escaped.push_str("\\:"),
            '[' => escaped.push_str("\\["),
            ']' => escaped.push_str("\\]"),
            ',' => escaped.push_str("\\,"),
            ';' => escaped.push_str("\\;"),
            '\'' => escaped.push_str("\\'"),
            '%' => escaped.push_str("\\%"),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                escaped.push_str("\\n");
            }
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Escape an option list for embedding in a filtergraph description.
///
/// The graph parser strips one level of backslashes and quotes before the
/// filter sees its options, so values escaped for the option parser need a
/// second level here.
pub fn escape_filter_graph(options: &str) -> String {
    let mut escaped = String::with_capacity(options.len() + 16);
    for ch in options.chars() {
        if matches!(ch, '\\' | '\'' | '[' | ']' | ',' | ';') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Turn `\n` pairs of an escaped text value into line feeds, which drawtext
/// breaks lines on. Other escapes are kept for the option parser.
fn drawtext_text_value(escaped: &str) -> String {
    let mut value = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            value.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => value.push('\n'),
            Some(next) => {
                value.push('\\');
                value.push(next);
            }
            None => value.push('\\'),
        }
    }
    value
}

/// Escape a file path used as a filter option value.
pub fn escape_filter_path(path: &Path) -> String {
    let normalized = path.to_string_lossy().replace('\\', "/");
    let mut escaped = String::with_capacity(normalized.len() + 12);
    for ch in normalized.chars() {
        match ch {
            ':' => escaped.push_str("\\:"),
            '\'' => escaped.push_str("\\'"),
            ',' => escaped.push_str("\\,"),
            ';' => escaped.push_str("\\;"),
            '[' => escaped.push_str("\\["),
            ']' => escaped.push_str("\\]"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// An sRGB color with alpha, parsed from `#rgb`, `#rrggbb` or `#rrggbbaa`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FilterColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    /// Alpha in `[0.0, 1.0]`.
    pub alpha: f64,
}

impl FilterColor {
    pub const WHITE: FilterColor = FilterColor {
        r: 255,
        g: 255,
        b: 255,
        alpha: 1.0,
    };

    pub fn parse(value: &str) -> Option<Self> {
        let hex = value.trim().strip_prefix('#')?;
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let channel = |s: &str| u8::from_str_radix(s, 16).ok();
        match hex.len() {
            3 => {
                let expand = |i: usize| channel(&hex[i..i + 1].repeat(2));
                Some(Self {
                    r: expand(0)?,
                    g: expand(1)?,
                    b: expand(2)?,
                    alpha: 1.0,
                })
            }
            6 | 8 => Some(Self {
                r: channel(&hex[0..2])?,
                g: channel(&hex[2..4])?,
                b: channel(&hex[4..6])?,
                alpha: if hex.len() == 8 {
                    f64::from(channel(&hex[6..8])?) / 255.0
                } else {
                    1.0
                },
            }),
            _ => None,
        }
    }

    /// Same color with alpha scaled by `opacity`.
    pub fn with_opacity(self, opacity: f64) -> Self {
        Self {
            alpha: (self.alpha * opacity).clamp(0.0, 1.0),
            ..self
        }
    }

    /// `0xRRGGBB`, with an `@alpha` suffix unless fully opaque.
    pub fn to_ffmpeg(&self) -> String {
        let rgb = format!("0x{:02X}{:02X}{:02X}", self.r, self.g, self.b);
        if self.alpha >= 1.0 {
            rgb
        } else {
            format!("{rgb}@{}", fmt_num(self.alpha))
        }
    }

    pub fn to_rgba(&self) -> [u8; 4] {
        [self.r, self.g, self.b, (self.alpha * 255.0).round() as u8]
    }
}

/// Where an effect applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectScope {
    /// Effect-track element: the whole composed frame beneath text.
    Frame,
    /// Per-element effect of a media clip, over the clip's window.
    Clip,
}

/// Color/blur adjustment over a time window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectStage {
    pub element_id: String,
    pub track_index: usize,
    pub window: VisibleWindow,
    pub scope: EffectScope,
    pub params: EffectParams,
}

/// A text or caption drawn over a time window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextOverlayStage {
    pub element_id: String,
    pub track_index: usize,
    pub window: VisibleWindow,

    /// Escaped text value.
    pub text: String,

    pub font_family: String,
    pub font_path: Option<std::path::PathBuf>,
    pub font_size_px: f64,

    /// Text color with the element opacity folded into alpha.
    pub color: FilterColor,
    pub background: Option<FilterColor>,

    /// Horizontal position expression (top-left convention).
    pub x: String,
    /// Vertical position expression (top-left convention).
    pub y: String,

    pub rotation_radians: f64,
    pub caption: bool,
}

/// One compiled filter stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum FilterStage {
    Effect(EffectStage),
    TextOverlay(TextOverlayStage),
}

impl FilterStage {
    pub fn element_id(&self) -> &str {
        match self {
            FilterStage::Effect(stage) => &stage.element_id,
            FilterStage::TextOverlay(stage) => &stage.element_id,
        }
    }

    pub fn window(&self) -> VisibleWindow {
        match self {
            FilterStage::Effect(stage) => stage.window,
            FilterStage::TextOverlay(stage) => stage.window,
        }
    }

    /// Render as ffmpeg filters (may expand to several comma-joined filters).
    pub fn to_filter_string(&self) -> String {
        match self {
            FilterStage::Effect(stage) => effect_filters(stage),
            FilterStage::TextOverlay(stage) => drawtext_filter(stage),
        }
    }
}

/// Ordered stages plus non-fatal compilation warnings.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterChain {
    stages: Vec<FilterStage>,
    warnings: Vec<String>,
}

impl FilterChain {
    pub fn stages(&self) -> &[FilterStage] {
        &self.stages
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn text_stages(&self) -> impl Iterator<Item = &TextOverlayStage> {
        self.stages.iter().filter_map(|stage| match stage {
            FilterStage::TextOverlay(text) => Some(text),
            FilterStage::Effect(_) => None,
        })
    }

    pub fn effect_stages(&self) -> impl Iterator<Item = &EffectStage> {
        self.stages.iter().filter_map(|stage| match stage {
            FilterStage::Effect(effect) => Some(effect),
            FilterStage::TextOverlay(_) => None,
        })
    }

    /// Comma-joined filter list, effects first. Empty for an empty chain.
    pub fn to_filter_string(&self) -> String {
        self.stages
            .iter()
            .map(FilterStage::to_filter_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn warn(&mut self, warning: String) {
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }
}

struct Candidate<'a> {
    track_index: usize,
    element: &'a Element,
    kind: CandidateKind<'a>,
}

enum CandidateKind<'a> {
    Effect(&'a EffectParams, EffectScope),
    Text(&'a TextPayload, bool),
}

/// Compile the visual filter content of a timeline.
pub fn compile(timeline: &Timeline, canvas: Canvas, fonts: &FontCatalog) -> FilterChain {
    let mut candidates: Vec<Candidate<'_>> = timeline
        .elements()
        .filter(|active| !active.element.hidden)
        .filter_map(|active| {
            let kind = match (&active.element.payload, active.track_kind) {
                (ElementPayload::Effect(params), TrackKind::Effect) => {
                    CandidateKind::Effect(params, EffectScope::Frame)
                }
                (ElementPayload::Media(media), TrackKind::Media) => {
                    CandidateKind::Effect(media.effects.as_ref()?, EffectScope::Clip)
                }
                (ElementPayload::Text(text), TrackKind::Text) => CandidateKind::Text(text, false),
                (ElementPayload::Caption(text), TrackKind::Caption) => {
                    CandidateKind::Text(text, true)
                }
                _ => return None,
            };
            Some(Candidate {
                track_index: active.track_index,
                element: active.element,
                kind,
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        a.track_index
            .cmp(&b.track_index)
            .then_with(|| {
                a.element
                    .start_time
                    .partial_cmp(&b.element.start_time)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.element.id.cmp(&b.element.id))
    });

    let mut chain = FilterChain::default();
    let mut texts = Vec::new();

    for candidate in &candidates {
        let window = candidate.element.visible_window();
        match candidate.kind {
            CandidateKind::Effect(params, scope) => {
                if params.is_empty() {
                    continue;
                }
                chain.stages.push(FilterStage::Effect(EffectStage {
                    element_id: candidate.element.id.clone(),
                    track_index: candidate.track_index,
                    window,
                    scope,
                    params: params.clone(),
                }));
            }
            CandidateKind::Text(text, caption) => {
                let escaped = escape_filter_text(&text.content);
                if escaped.is_empty() {
                    continue;
                }
                let font = fonts.resolve_text(text);
                if let Some(warning) = &font.warning {
                    chain.warn(format!("{}: {warning}", candidate.element.id));
                }
                let stage = text_stage(
                    candidate,
                    text,
                    caption,
                    escaped,
                    font,
                    canvas,
                    &mut chain,
                );
                texts.push(FilterStage::TextOverlay(stage));
            }
        }
    }

    chain.stages.extend(texts);
    chain
}

fn text_stage(
    candidate: &Candidate<'_>,
    text: &TextPayload,
    caption: bool,
    escaped: String,
    font: ResolvedFont,
    canvas: Canvas,
    chain: &mut FilterChain,
) -> TextOverlayStage {
    let id = &candidate.element.id;
    let color = FilterColor::parse(&text.color).unwrap_or_else(|| {
        chain.warn(format!("{id}: invalid color '{}'; using white", text.color));
        FilterColor::WHITE
    });
    let background = text.background_color.as_deref().and_then(|value| {
        let parsed = FilterColor::parse(value);
        if parsed.is_none() {
            chain.warn(format!("{id}: invalid background color '{value}'; box omitted"));
        }
        parsed
    });

    let (x, y) = text_position(text, canvas);

    TextOverlayStage {
        element_id: id.clone(),
        track_index: candidate.track_index,
        window: candidate.element.visible_window(),
        text: escaped,
        font_family: font.family,
        font_path: font.path,
        font_size_px: text.font_size_px,
        color: color.with_opacity(candidate.element.opacity),
        background: background.map(|bg| bg.with_opacity(candidate.element.opacity)),
        x,
        y,
        rotation_radians: text.rotation_degrees.to_radians(),
        caption,
    }
}

/// Translate center-relative coordinates into top-left drawtext expressions.
fn text_position(text: &TextPayload, canvas: Canvas) -> (String, String) {
    let anchor_x = fmt_num(f64::from(canvas.width) / 2.0 + text.x);
    let anchor_y = fmt_num(f64::from(canvas.height) / 2.0 + text.y);
    let x = match text.text_align {
        TextAlign::Left => anchor_x,
        TextAlign::Center => format!("{anchor_x}-text_w/2"),
        TextAlign::Right => format!("{anchor_x}-text_w"),
    };
    (x, format!("{anchor_y}-text_h/2"))
}

fn enable_expr(window: VisibleWindow) -> String {
    format!(
        "enable='gte(t,{})*lt(t,{})'",
        fmt_num(window.start),
        fmt_num(window.end)
    )
}

fn effect_filters(stage: &EffectStage) -> String {
    let enable = enable_expr(stage.window);
    let params = &stage.params;
    let mut filters = Vec::new();

    let eq: Vec<String> = [
        ("brightness", params.brightness),
        ("contrast", params.contrast),
        ("saturation", params.saturation),
    ]
    .iter()
    .filter_map(|(name, value)| value.map(|v| format!("{name}={}", fmt_num(v))))
    .collect();
    if !eq.is_empty() {
        filters.push(format!("eq={}:{enable}", eq.join(":")));
    }
    if let Some(hue) = params.hue {
        filters.push(format!("hue=h={}:{enable}", fmt_num(hue)));
    }
    if params.grayscale {
        filters.push(format!("hue=s=0:{enable}"));
    }
    if let Some(sigma) = params.blur {
        filters.push(format!("gblur=sigma={}:{enable}", fmt_num(sigma)));
    }
    if params.invert {
        filters.push(format!("negate={enable}"));
    }
    filters.join(",")
}

fn drawtext_filter(stage: &TextOverlayStage) -> String {
    let mut options = Vec::with_capacity(9);
    match &stage.font_path {
        Some(path) => options.push(format!("fontfile={}", escape_filter_path(path))),
        None => options.push(format!("font={}", escape_filter_text(&stage.font_family))),
    }
    options.push(format!("text={}", drawtext_text_value(&stage.text)));
    options.push("expansion=none".to_string());
    options.push(format!("fontsize={}", fmt_num(stage.font_size_px)));
    options.push(format!("fontcolor={}", stage.color.to_ffmpeg()));
    options.push(format!("x={}", stage.x));
    options.push(format!("y={}", stage.y));
    if let Some(background) = &stage.background {
        options.push("box=1".to_string());
        options.push(format!("boxcolor={}", background.to_ffmpeg()));
        options.push(format!(
            "boxborderw={}",
            (stage.font_size_px * 0.25).round().max(1.0)
        ));
    }
    options.push(enable_expr(stage.window));
    format!("drawtext={}", escape_filter_graph(&options.join(":")))
}

/// Shortest fixed-precision rendering of a number (up to 6 decimals).
pub(crate) fn fmt_num(value: f64) -> String {
    let mut s = format!("{value:.6}");
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    if s == "-0" {
        s = "0".to_string();
    }
    s
}
