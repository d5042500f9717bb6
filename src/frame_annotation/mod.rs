//! FrameAnnotation - Audit Overlay Rendering
//!
//! ## Responsibilities
//!
//! - Draw the motion status badge, score and threshold onto a frame copy
//! - Blend the motion mask (HOT colormap) over frames that had motion
//! - Print the analysis keywords, confidence and provider label
//!
//! Rendering never fails loudly: undecodable input yields `None` so that
//! annotation problems cannot block frame persistence.

use ab_glyph::{FontArc, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;
use std::time::{Duration, Instant};

/// Rendering slower than this is logged
const RENDER_BUDGET: Duration = Duration::from_millis(100);
const JPEG_QUALITY: u8 = 85;
const KEYWORDS_MAX_CHARS: usize = 100;
const LEFT_MARGIN: i32 = 20;
const LABEL_PADDING: i32 = 10;
/// Pixel height of a font scale of 1.0
const BASE_FONT_PX: f32 = 40.0;
const STATUS_FONT_SCALE: f32 = 0.65;

const STATUS_MOTION: Rgb<u8> = Rgb([0, 255, 0]);
const STATUS_NO_MOTION: Rgb<u8> = Rgb([255, 0, 0]);
const STATUS_UNKNOWN: Rgb<u8> = Rgb([128, 128, 128]);
const KEYWORDS_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const LABEL_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);

/// Fallback font locations, first hit wins
const FONT_CANDIDATES: [&str; 4] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/local/share/fonts/DejaVuSans.ttf",
];

/// Motion decision shown in the badge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionStatus {
    Motion,
    NoMotion,
    Unknown,
}

impl MotionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            MotionStatus::Motion => "[MOTION]",
            MotionStatus::NoMotion => "[NO MOTION]",
            MotionStatus::Unknown => "[UNKNOWN]",
        }
    }

    fn color(&self) -> Rgb<u8> {
        match self {
            MotionStatus::Motion => STATUS_MOTION,
            MotionStatus::NoMotion => STATUS_NO_MOTION,
            MotionStatus::Unknown => STATUS_UNKNOWN,
        }
    }
}

/// Overlay colours and sizes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnotationStyle {
    pub text_color: Rgb<u8>,
    /// Mask blend factor (0-1)
    pub mask_alpha: f32,
    pub font_scale: f32,
}

impl Default for AnnotationStyle {
    fn default() -> Self {
        Self {
            text_color: Rgb([255, 255, 255]),
            mask_alpha: 0.3,
            font_scale: 0.6,
        }
    }
}

/// Everything drawn onto one frame
#[derive(Debug, Clone, Copy)]
pub struct AnnotationInput<'a> {
    pub motion_score: Option<f32>,
    pub motion_threshold: Option<f32>,
    pub motion_mask: Option<&'a GrayImage>,
    pub motion_status: MotionStatus,
    pub keywords: &'a [String],
    /// 0-1
    pub confidence: Option<f32>,
    pub provider: Option<&'a str>,
    pub model: Option<&'a str>,
}

impl Default for AnnotationInput<'_> {
    fn default() -> Self {
        Self {
            motion_score: None,
            motion_threshold: None,
            motion_mask: None,
            motion_status: MotionStatus::Unknown,
            keywords: &[],
            confidence: None,
            provider: None,
            model: None,
        }
    }
}

/// Parse an `"r,g,b"` colour
pub fn parse_rgb(value: &str) -> Option<Rgb<u8>> {
    let parts: Vec<u8> = value
        .split(',')
        .map(|part| part.trim().parse::<u8>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    match parts.as_slice() {
        [r, g, b] => Some(Rgb([*r, *g, *b])),
        _ => None,
    }
}

/// Load the overlay font from `path`, or the first system DejaVuSans found
pub fn load_font(path: Option<&Path>) -> Option<FontArc> {
    let candidates = path
        .into_iter()
        .map(Path::to_path_buf)
        .chain(FONT_CANDIDATES.iter().map(|p| Path::new(p).to_path_buf()));

    for candidate in candidates {
        let Ok(bytes) = std::fs::read(&candidate) else {
            continue;
        };
        match FontArc::try_from_vec(bytes) {
            Ok(font) => {
                tracing::debug!(path = %candidate.display(), "Annotation font loaded");
                return Some(font);
            }
            Err(e) => {
                tracing::warn!(path = %candidate.display(), error = %e, "Invalid font file");
            }
        }
    }

    tracing::warn!("No annotation font found, overlays will omit text");
    None
}

/// Replace accented characters with ASCII equivalents
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            'ã' | 'á' | 'à' | 'â' | 'ä' | 'ª' => out.push('a'),
            'é' | 'ê' | 'è' | 'ë' => out.push('e'),
            'í' | 'î' | 'ì' | 'ï' => out.push('i'),
            'ó' | 'õ' | 'ô' | 'ò' | 'ö' | 'º' => out.push('o'),
            'ú' | 'û' | 'ù' | 'ü' => out.push('u'),
            'ç' => out.push('c'),
            'ñ' => out.push('n'),
            'Á' | 'À' | 'Â' | 'Ä' | 'Ã' => out.push('A'),
            'É' | 'Ê' | 'È' | 'Ë' => out.push('E'),
            'Í' | 'Î' | 'Ì' | 'Ï' => out.push('I'),
            'Ó' | 'Õ' | 'Ô' | 'Ò' | 'Ö' => out.push('O'),
            'Ú' | 'Û' | 'Ù' | 'Ü' => out.push('U'),
            'Ç' => out.push('C'),
            'Ñ' => out.push('N'),
            '¿' => out.push('?'),
            '¡' => out.push('!'),
            '°' => out.push_str(" deg"),
            other => out.push(other),
        }
    }
    out
}

fn keywords_line(keywords: &[String]) -> String {
    let joined = normalize_text(&keywords.join(", "));
    if joined.chars().count() > KEYWORDS_MAX_CHARS {
        let truncated: String = joined.chars().take(KEYWORDS_MAX_CHARS).collect();
        format!("Keywords: {}...", truncated)
    } else {
        format!("Keywords: {}", joined)
    }
}

fn provider_line(provider: &str, model: &str) -> String {
    let mut chars = provider.chars();
    let title = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    };
    let model_short = model.split('-').next().unwrap_or(model).to_uppercase();
    normalize_text(&format!("Provider: {} ({})", title, model_short))
}

/// OpenCV-style HOT colormap: black, red, yellow, white
fn hot_colormap(value: u8) -> Rgb<u8> {
    let x = value as f32 / 255.0;
    let channel = |offset: f32| ((3.0 * x - offset).clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([channel(0.0), channel(1.0), channel(2.0)])
}

/// Overlay renderer. Stateless per call.
pub struct FrameAnnotator {
    style: AnnotationStyle,
    font: Option<FontArc>,
}

impl FrameAnnotator {
    pub fn new(style: AnnotationStyle, font: Option<FontArc>) -> Self {
        Self { style, font }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Render the overlay onto a copy of `jpeg`.
    ///
    /// Returns `None` when the input cannot be decoded or the result cannot
    /// be encoded.
    pub fn render(&self, jpeg: &[u8], input: &AnnotationInput<'_>) -> Option<Vec<u8>> {
        let mut frame = match image::load_from_memory(jpeg) {
            Ok(decoded) => decoded.to_rgb8(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to decode frame for annotation");
                return None;
            }
        };

        let start = Instant::now();
        self.draw_motion(&mut frame, input);
        self.draw_analysis(&mut frame, input);

        let mut buf = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY);
        if let Err(e) = encoder.encode_image(&frame) {
            tracing::error!(error = %e, "Failed to encode annotated frame");
            return None;
        }

        let elapsed = start.elapsed();
        if elapsed > RENDER_BUDGET {
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                width = frame.width(),
                height = frame.height(),
                "Annotation exceeded render budget"
            );
        }
        Some(buf)
    }

    fn draw_motion(&self, frame: &mut RgbImage, input: &AnnotationInput<'_>) {
        let mut baseline = 60;

        if self.font.is_some() {
            self.draw_label(
                frame,
                input.motion_status.label(),
                baseline,
                input.motion_status.color(),
                STATUS_FONT_SCALE,
            );
        } else {
            draw_filled_rect_mut(
                frame,
                Rect::at(LEFT_MARGIN, baseline - 20).of_size(20, 20),
                input.motion_status.color(),
            );
        }
        baseline += 32;

        if let (Some(score), Some(threshold)) = (input.motion_score, input.motion_threshold) {
            let text = format!("Score: {:.1}%  Threshold: {:.1}%", score, threshold);
            self.draw_label(frame, &text, baseline, self.style.text_color, self.style.font_scale);
        }

        if input.motion_status == MotionStatus::Motion {
            if let Some(mask) = input.motion_mask {
                self.blend_mask(frame, mask);
            }
        }
    }

    fn draw_analysis(&self, frame: &mut RgbImage, input: &AnnotationInput<'_>) {
        let mut baseline = 130;
        let scale = self.style.font_scale;

        if !input.keywords.is_empty() {
            self.draw_label(frame, &keywords_line(input.keywords), baseline, KEYWORDS_COLOR, scale);
            baseline += 32;
        }

        if let Some(confidence) = input.confidence {
            let text = format!("Confidence: {:.0}%", confidence * 100.0);
            self.draw_label(frame, &text, baseline, self.style.text_color, scale);
            baseline += 28;
        }

        if let (Some(provider), Some(model)) = (input.provider, input.model) {
            self.draw_label(frame, &provider_line(provider, model), baseline, self.style.text_color, scale);
        }
    }

    /// Text on a black box. `baseline` is the text baseline.
    fn draw_label(&self, frame: &mut RgbImage, text: &str, baseline: i32, color: Rgb<u8>, font_scale: f32) {
        let Some(font) = &self.font else {
            return;
        };
        let text = normalize_text(text);
        let scale = PxScale::from(BASE_FONT_PX * font_scale);
        let (text_width, text_height) = text_size(scale, font, &text);
        let top = baseline - text_height as i32;

        let x1 = (LEFT_MARGIN - LABEL_PADDING).max(0);
        let y1 = (top - LABEL_PADDING).max(0);
        let x2 = (LEFT_MARGIN + text_width as i32 + LABEL_PADDING).min(frame.width() as i32);
        let y2 = (baseline + LABEL_PADDING).min(frame.height() as i32);
        if x2 > x1 && y2 > y1 {
            draw_filled_rect_mut(
                frame,
                Rect::at(x1, y1).of_size((x2 - x1) as u32, (y2 - y1) as u32),
                LABEL_BACKGROUND,
            );
        }

        draw_text_mut(frame, color, LEFT_MARGIN, top, scale, font, &text);
    }

    fn blend_mask(&self, frame: &mut RgbImage, mask: &GrayImage) {
        let resized;
        let mask = if mask.dimensions() == frame.dimensions() {
            mask
        } else {
            resized = imageops::resize(mask, frame.width(), frame.height(), FilterType::Triangle);
            &resized
        };

        let alpha = self.style.mask_alpha.clamp(0.0, 1.0);
        for (pixel, m) in frame.pixels_mut().zip(mask.pixels()) {
            let value = m[0];
            if value <= 1 {
                continue;
            }
            let hot = hot_colormap(value);
            for channel in 0..3 {
                let blended = pixel[channel] as f32 * (1.0 - alpha) + hot[channel] as f32 * alpha;
                pixel[channel] = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}
