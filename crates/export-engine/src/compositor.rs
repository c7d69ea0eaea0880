//! Software frame compositor.
//!
//! Draws one output frame at a time onto an opaque RGBA surface. Layers are
//! drawn bottom-up in track order: media frames, stickers, text and captions,
//! components. Effect-track elements adjust everything already drawn beneath
//! them. Rasterized text and sticker layers are cached per element, since a
//! snapshot never changes while it is being rendered.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ab_glyph::{FontVec, PxScale};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use imageproc::rect::Rect;
use splice_common::error::{SpliceError, SpliceResult};
use splice_timeline::{
    ActiveElement, BlendMode, ComponentPayload, EffectParams, Element, ElementPayload,
    RenderMode, StickerPayload, TextAlign, TextPayload, Timeline,
};

use crate::component::ComponentRenderer;
use crate::filter::{Canvas, FilterColor};
use crate::fonts::FontCatalog;
use crate::sources::{ResolvedSource, SourceKind, SourceTable};

/// Surface color beneath the bottom layer.
const BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// A decoded frame request.
#[derive(Debug, Clone, Copy)]
pub struct FrameRequest<'a> {
    pub element_id: &'a str,
    pub source: &'a ResolvedSource,
    /// Position inside the source file, in seconds.
    pub source_time_secs: f64,
    pub width: u32,
    pub height: u32,
}

/// Supplies decoded video frames to the compositor.
pub trait MediaFrameSource: Send {
    /// Frame at `request.source_time_secs`, fitted to `width` x `height`.
    fn frame(&mut self, request: &FrameRequest<'_>) -> SpliceResult<RgbaImage>;

    /// Release decoders for elements no longer on screen.
    fn retain(&mut self, _active_element_ids: &[&str]) {}
}

/// A rasterized layer and its top-left position on the canvas.
#[derive(Debug, Clone)]
struct PreparedLayer {
    image: Arc<RgbaImage>,
    left: i64,
    top: i64,
}

/// Frame-by-frame renderer for the compositing engine.
pub struct FrameCompositor {
    canvas: Canvas,
    sources: SourceTable,
    fonts: FontCatalog,
    frames: Box<dyn MediaFrameSource>,
    components: Option<Arc<dyn ComponentRenderer>>,
    font_faces: HashMap<PathBuf, Arc<FontVec>>,
    images: HashMap<PathBuf, Arc<RgbaImage>>,
    layers: HashMap<String, Option<PreparedLayer>>,
    warnings: Vec<String>,
}

impl FrameCompositor {
    pub fn new(
        canvas: Canvas,
        sources: SourceTable,
        fonts: FontCatalog,
        frames: Box<dyn MediaFrameSource>,
    ) -> Self {
        Self {
            canvas,
            sources,
            fonts,
            frames,
            components: None,
            font_faces: HashMap::new(),
            images: HashMap::new(),
            layers: HashMap::new(),
            warnings: vec![],
        }
    }

    /// Renderer used for live components.
    pub fn with_component_renderer(mut self, renderer: Arc<dyn ComponentRenderer>) -> Self {
        self.components = Some(renderer);
        self
    }

    /// Non-fatal problems met so far (missing fonts, bad colors).
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Render the frame shown at `time_secs`.
    pub fn compose(&mut self, timeline: &Timeline, time_secs: f64) -> SpliceResult<RgbaImage> {
        let mut surface = RgbaImage::from_pixel(self.canvas.width, self.canvas.height, BACKGROUND);

        let mut active = timeline.active_elements_at(time_secs);
        active.sort_by(|a, b| {
            a.track_index
                .cmp(&b.track_index)
                .then(a.element.start_time.total_cmp(&b.element.start_time))
                .then(a.element.id.cmp(&b.element.id))
        });

        for item in &active {
            self.draw_element(&mut surface, item, time_secs)?;
        }

        let ids: Vec<&str> = active.iter().map(|a| a.element.id.as_str()).collect();
        self.frames.retain(&ids);
        Ok(surface)
    }

    fn draw_element(
        &mut self,
        surface: &mut RgbaImage,
        active: &ActiveElement<'_>,
        time_secs: f64,
    ) -> SpliceResult<()> {
        let element = active.element;
        match &element.payload {
            ElementPayload::Audio(_) => Ok(()),
            ElementPayload::Media(media) => {
                let source = self.sources.get(&media.source)?.clone();
                let mut layer = self.media_layer(element, &source, time_secs)?;
                if let Some(effects) = media.effects.as_ref().filter(|e| !e.is_empty()) {
                    apply_effects(&mut layer, effects);
                }
                blend_onto(surface, &layer, 0, 0, element.opacity, element.blend_mode);
                Ok(())
            }
            ElementPayload::Effect(params) => {
                if params.is_empty() {
                    return Ok(());
                }
                let mut adjusted = surface.clone();
                apply_effects(&mut adjusted, params);
                blend_onto(surface, &adjusted, 0, 0, element.opacity, element.blend_mode);
                Ok(())
            }
            ElementPayload::Text(text) | ElementPayload::Caption(text) => {
                if let Some(layer) = self.text_layer(element, text)? {
                    blend_onto(
                        surface,
                        &layer.image,
                        layer.left,
                        layer.top,
                        element.opacity,
                        element.blend_mode,
                    );
                }
                Ok(())
            }
            ElementPayload::Sticker(sticker) => {
                if let Some(layer) = self.sticker_layer(element, sticker)? {
                    blend_onto(
                        surface,
                        &layer.image,
                        layer.left,
                        layer.top,
                        element.opacity,
                        element.blend_mode,
                    );
                }
                Ok(())
            }
            ElementPayload::Component(component) => {
                let layer = self.component_layer(element, component, time_secs)?;
                blend_onto(surface, &layer, 0, 0, element.opacity, element.blend_mode);
                Ok(())
            }
        }
    }

    fn media_layer(
        &mut self,
        element: &Element,
        source: &ResolvedSource,
        time_secs: f64,
    ) -> SpliceResult<RgbaImage> {
        if source.kind == SourceKind::Image {
            let image = self.load_image(&source.path)?;
            return Ok(fit_to_canvas(&image, self.canvas));
        }
        self.frames.frame(&FrameRequest {
            element_id: &element.id,
            source,
            source_time_secs: (time_secs - element.start_time).max(0.0),
            width: self.canvas.width,
            height: self.canvas.height,
        })
    }

    fn component_layer(
        &mut self,
        element: &Element,
        component: &ComponentPayload,
        time_secs: f64,
    ) -> SpliceResult<RgbaImage> {
        match component.render_mode {
            RenderMode::Live => {
                let renderer = self.components.as_ref().ok_or_else(|| {
                    SpliceError::resource(format!(
                        "no component renderer available for live component {}",
                        element.id
                    ))
                })?;
                let local_time = time_secs - element.visible_window().start;
                let frame = renderer.render_frame(
                    component,
                    local_time,
                    self.canvas.width,
                    self.canvas.height,
                )?;
                if frame.dimensions() == (self.canvas.width, self.canvas.height) {
                    Ok(frame)
                } else {
                    Ok(fit_to_canvas(&frame, self.canvas))
                }
            }
            RenderMode::Prerendered => {
                let reference = component.prerendered_source.as_ref().ok_or_else(|| {
                    SpliceError::validation(format!(
                        "prerendered component {} has no rendered source",
                        element.id
                    ))
                })?;
                let source = self.sources.get(reference)?.clone();
                self.media_layer(element, &source, time_secs)
            }
        }
    }

    fn text_layer(
        &mut self,
        element: &Element,
        text: &TextPayload,
    ) -> SpliceResult<Option<PreparedLayer>> {
        if let Some(cached) = self.layers.get(&element.id) {
            return Ok(cached.clone());
        }

        if text.content.is_empty() {
            self.layers.insert(element.id.clone(), None);
            return Ok(None);
        }

        let resolved = self.fonts.resolve_text(text);
        if let Some(warning) = resolved.warning {
            self.warn(format!("{}: {warning}", element.id));
        }
        let Some(font_path) = resolved.path else {
            return Err(SpliceError::resource(format!(
                "{}: no font file for '{}' to draw text with; configure a font family",
                element.id, resolved.family
            )));
        };
        let font = self.load_font(&font_path)?;

        let color = FilterColor::parse(&text.color).unwrap_or_else(|| {
            self.warn(format!("{}: invalid color '{}'; using white", element.id, text.color));
            FilterColor::WHITE
        });
        let background = text.background_color.as_deref().and_then(|value| {
            let parsed = FilterColor::parse(value);
            if parsed.is_none() {
                self.warn(format!(
                    "{}: invalid background color '{value}'; box omitted",
                    element.id
                ));
            }
            parsed
        });

        let block = rasterize_text(text, &font, color, background);
        let anchor_x = f64::from(self.canvas.width) / 2.0 + text.x;
        let anchor_y = f64::from(self.canvas.height) / 2.0 + text.y;
        let width = f64::from(block.image.width()) - 2.0 * block.padding;
        let left = match text.text_align {
            TextAlign::Left => anchor_x,
            TextAlign::Center => anchor_x - width / 2.0,
            TextAlign::Right => anchor_x - width,
        } - block.padding;
        let top = anchor_y - f64::from(block.image.height()) / 2.0;

        let layer = place_rotated(block.image, left, top, text.rotation_degrees);
        self.layers.insert(element.id.clone(), Some(layer.clone()));
        Ok(Some(layer))
    }

    fn sticker_layer(
        &mut self,
        element: &Element,
        sticker: &StickerPayload,
    ) -> SpliceResult<Option<PreparedLayer>> {
        if let Some(cached) = self.layers.get(&element.id) {
            return Ok(cached.clone());
        }

        let path = self.sources.get(&sticker.source)?.path.clone();
        let image = self.load_image(&path)?;
        let width = sticker.width.round().max(1.0) as u32;
        let height = sticker.height.round().max(1.0) as u32;
        let resized = imageops::resize(image.as_ref(), width, height, FilterType::Triangle);

        let left = f64::from(self.canvas.width) / 2.0 + sticker.x - f64::from(width) / 2.0;
        let top = f64::from(self.canvas.height) / 2.0 + sticker.y - f64::from(height) / 2.0;
        let layer = place_rotated(resized, left, top, sticker.rotation_degrees);
        self.layers.insert(element.id.clone(), Some(layer.clone()));
        Ok(Some(layer))
    }

    fn load_font(&mut self, path: &Path) -> SpliceResult<Arc<FontVec>> {
        if let Some(font) = self.font_faces.get(path) {
            return Ok(Arc::clone(font));
        }
        let data = std::fs::read(path).map_err(|e| {
            SpliceError::resource(format!("failed to read font {}: {e}", path.display()))
        })?;
        let font = FontVec::try_from_vec(data).map_err(|e| {
            SpliceError::resource(format!("invalid font {}: {e}", path.display()))
        })?;
        let font = Arc::new(font);
        tracing::debug!(path = %path.display(), "Loaded font");
        self.font_faces.insert(path.to_path_buf(), Arc::clone(&font));
        Ok(font)
    }

    fn load_image(&mut self, path: &Path) -> SpliceResult<Arc<RgbaImage>> {
        if let Some(image) = self.images.get(path) {
            return Ok(Arc::clone(image));
        }
        let image = image::open(path)
            .map_err(|e| {
                SpliceError::resource(format!("failed to decode image {}: {e}", path.display()))
            })?
            .to_rgba8();
        let image = Arc::new(image);
        self.images.insert(path.to_path_buf(), Arc::clone(&image));
        Ok(image)
    }

    fn warn(&mut self, warning: String) {
        if !self.warnings.contains(&warning) {
            tracing::warn!("{warning}");
            self.warnings.push(warning);
        }
    }
}

struct TextBlock {
    image: RgbaImage,
    padding: f64,
}

/// Split text into lines. CR and CRLF break lines like LF, as on the drawtext
/// path.
fn text_lines(content: &str) -> Vec<String> {
    content
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .split('\n')
        .map(str::to_string)
        .collect()
}

/// Rasterize a text block (one or more lines) onto a transparent layer.
fn rasterize_text(
    text: &TextPayload,
    font: &FontVec,
    color: FilterColor,
    background: Option<FilterColor>,
) -> TextBlock {
    let scale = PxScale::from(text.font_size_px as f32);
    let lines = text_lines(&text.content);
    let line_height = text.font_size_px.ceil().max(1.0) as u32;
    let widths: Vec<u32> = lines
        .iter()
        .map(|line| text_size(scale, font, line).0)
        .collect();
    let block_width = widths.iter().copied().max().unwrap_or(0).max(1);
    let block_height = (line_height * lines.len().max(1) as u32).max(1);

    let padding = if background.is_some() {
        (text.font_size_px * 0.25).round().max(1.0)
    } else {
        0.0
    };
    let pad = padding as u32;
    let [r, g, b, a] = color.to_rgba();

    // Transparent pixels carry the text color so glyph edges keep their hue.
    let fill = match background {
        Some(bg) => Rgba(bg.to_rgba()),
        None => Rgba([r, g, b, 0]),
    };
    let mut image = RgbaImage::from_pixel(block_width + 2 * pad, block_height + 2 * pad, fill);
    if let Some(bg) = background {
        let (image_width, image_height) = image.dimensions();
        draw_filled_rect_mut(
            &mut image,
            Rect::at(0, 0).of_size(image_width, image_height),
            Rgba(bg.to_rgba()),
        );
    }

    for (index, (line, width)) in lines.iter().zip(&widths).enumerate() {
        let x = match text.text_align {
            TextAlign::Left => 0,
            TextAlign::Center => (block_width - width) / 2,
            TextAlign::Right => block_width - width,
        };
        let y = index as u32 * line_height;
        draw_text_mut(
            &mut image,
            Rgba([r, g, b, a]),
            (x + pad) as i32,
            (y + pad) as i32,
            scale,
            font,
            line,
        );
    }

    TextBlock { image, padding }
}

/// Position a layer, rotating it clockwise about its center when needed.
fn place_rotated(image: RgbaImage, left: f64, top: f64, rotation_degrees: f64) -> PreparedLayer {
    if rotation_degrees.abs() < f64::EPSILON {
        return PreparedLayer {
            image: Arc::new(image),
            left: left.round() as i64,
            top: top.round() as i64,
        };
    }

    let (w, h) = image.dimensions();
    let side = f64::from(w).hypot(f64::from(h)).ceil() as u32;
    let mut square = RgbaImage::from_pixel(side, side, Rgba([0, 0, 0, 0]));
    let offset_x = i64::from((side - w) / 2);
    let offset_y = i64::from((side - h) / 2);
    imageops::replace(&mut square, &image, offset_x, offset_y);
    let rotated = rotate_about_center(
        &square,
        rotation_degrees.to_radians() as f32,
        Interpolation::Bilinear,
        Rgba([0, 0, 0, 0]),
    );

    PreparedLayer {
        image: Arc::new(rotated),
        left: left.round() as i64 - offset_x,
        top: top.round() as i64 - offset_y,
    }
}

/// Scale `image` to fit the canvas, centered on black.
fn fit_to_canvas(image: &RgbaImage, canvas: Canvas) -> RgbaImage {
    let (w, h) = image.dimensions();
    let mut out = RgbaImage::from_pixel(canvas.width, canvas.height, BACKGROUND);
    if w == 0 || h == 0 {
        return out;
    }
    let scale = (f64::from(canvas.width) / f64::from(w)).min(f64::from(canvas.height) / f64::from(h));
    let fit_w = ((f64::from(w) * scale).round() as u32).clamp(1, canvas.width);
    let fit_h = ((f64::from(h) * scale).round() as u32).clamp(1, canvas.height);
    let resized = imageops::resize(image, fit_w, fit_h, FilterType::Triangle);
    imageops::overlay(
        &mut out,
        &resized,
        i64::from((canvas.width - fit_w) / 2),
        i64::from((canvas.height - fit_h) / 2),
    );
    out
}

/// Apply color and blur adjustments in place, in the same order as the
/// native filter chain.
pub fn apply_effects(image: &mut RgbaImage, params: &EffectParams) {
    let brightness = params.brightness.unwrap_or(0.0);
    let contrast = params.contrast.unwrap_or(1.0);
    let saturation = params.saturation.unwrap_or(1.0);
    if params.brightness.is_some() || params.contrast.is_some() || params.saturation.is_some() {
        for pixel in image.pixels_mut() {
            let mut rgb = [0.0f64; 3];
            for (c, value) in rgb.iter_mut().enumerate() {
                let v = f64::from(pixel[c]) / 255.0;
                *value = (v - 0.5) * contrast + 0.5 + brightness;
            }
            let luma = 0.299 * rgb[0] + 0.587 * rgb[1] + 0.114 * rgb[2];
            for (c, value) in rgb.iter().enumerate() {
                let v = luma + (value - luma) * saturation;
                pixel[c] = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
            }
        }
    }
    if let Some(hue) = params.hue {
        *image = imageops::huerotate(&*image, hue.round() as i32);
    }
    if params.grayscale {
        for pixel in image.pixels_mut() {
            let luma = 0.299 * f64::from(pixel[0])
                + 0.587 * f64::from(pixel[1])
                + 0.114 * f64::from(pixel[2]);
            let v = luma.round().clamp(0.0, 255.0) as u8;
            pixel[0] = v;
            pixel[1] = v;
            pixel[2] = v;
        }
    }
    if let Some(sigma) = params.blur.filter(|s| *s > 0.0) {
        *image = imageops::blur(&*image, sigma as f32);
    }
    if params.invert {
        imageops::invert(image);
    }
}

/// Composite `layer` onto an opaque `surface` at `(left, top)`.
pub fn blend_onto(
    surface: &mut RgbaImage,
    layer: &RgbaImage,
    left: i64,
    top: i64,
    opacity: f64,
    mode: BlendMode,
) {
    let opacity = opacity.clamp(0.0, 1.0);
    if opacity <= 0.0 {
        return;
    }
    let (sw, sh) = (i64::from(surface.width()), i64::from(surface.height()));
    let (lw, lh) = (i64::from(layer.width()), i64::from(layer.height()));

    let x0 = left.max(0);
    let y0 = top.max(0);
    let x1 = (left + lw).min(sw);
    let y1 = (top + lh).min(sh);

    for y in y0..y1 {
        for x in x0..x1 {
            let src = layer.get_pixel((x - left) as u32, (y - top) as u32);
            let alpha = f64::from(src[3]) / 255.0 * opacity;
            if alpha <= 0.0 {
                continue;
            }
            let dst = surface.get_pixel_mut(x as u32, y as u32);
            for c in 0..3 {
                let s = f64::from(src[c]) / 255.0;
                let d = f64::from(dst[c]) / 255.0;
                let blended = match mode {
                    BlendMode::Normal => s,
                    BlendMode::Multiply => s * d,
                    BlendMode::Screen => 1.0 - (1.0 - s) * (1.0 - d),
                    BlendMode::Add => (s + d).min(1.0),
                };
                let out = d * (1.0 - alpha) + blended * alpha;
                dst[c] = (out.clamp(0.0, 1.0) * 255.0).round() as u8;
            }
            dst[3] = 255;
        }
    }
}
