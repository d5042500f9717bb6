//! Adaptive per-pixel background model
//!
//! Single Gaussian per pixel (running mean + variance) updated online.
//! Each applied frame produces a classification mask using the usual
//! foreground-mask encoding: 255 foreground, 127 shadow, 0 background.

use image::{GrayImage, Luma};

pub const FOREGROUND: u8 = 255;
pub const SHADOW: u8 = 127;
pub const BACKGROUND: u8 = 0;

/// Variance assigned to freshly seeded pixels
const VAR_INIT: f32 = 15.0;
const VAR_MIN: f32 = 4.0;
const VAR_MAX: f32 = 75.0;
/// Darkest ratio to the background mean still considered a shadow
const SHADOW_TAU: f32 = 0.5;

pub struct BackgroundModel {
    history: u32,
    var_threshold: f32,
    width: u32,
    height: u32,
    mean: Vec<f32>,
    var: Vec<f32>,
    frames_seen: u32,
}

impl BackgroundModel {
    pub fn new(history: u32, var_threshold: f32) -> Self {
        Self {
            history: history.max(1),
            var_threshold,
            width: 0,
            height: 0,
            mean: Vec::new(),
            var: Vec::new(),
            frames_seen: 0,
        }
    }

    pub fn is_seeded(&self) -> bool {
        self.frames_seen > 0
    }

    pub fn frames_seen(&self) -> u32 {
        self.frames_seen
    }

    /// Classify `frame` against the model, then fold it into the model.
    ///
    /// The first frame (or a frame whose dimensions differ from the model)
    /// seeds the model and is reported as entirely foreground.
    pub fn apply(&mut self, frame: &GrayImage) -> GrayImage {
        let (width, height) = frame.dimensions();

        if !self.is_seeded() || width != self.width || height != self.height {
            self.seed(frame);
            return GrayImage::from_pixel(width, height, Luma([FOREGROUND]));
        }

        self.frames_seen = self.frames_seen.saturating_add(1);
        let alpha = 1.0 / (self.frames_seen.saturating_mul(2).min(self.history)) as f32;

        let mut mask = GrayImage::new(width, height);
        for ((value, mean), (var, out)) in frame
            .as_raw()
            .iter()
            .zip(self.mean.iter_mut())
            .zip(self.var.iter_mut().zip(mask.iter_mut()))
        {
            let value = *value as f32;
            let diff = value - *mean;
            let dist2 = diff * diff;

            *out = if dist2 <= self.var_threshold * *var {
                BACKGROUND
            } else if is_shadow(value, *mean) {
                SHADOW
            } else {
                FOREGROUND
            };

            *mean += alpha * diff;
            *var = (*var + alpha * (dist2 - *var)).clamp(VAR_MIN, VAR_MAX);
        }

        mask
    }

    fn seed(&mut self, frame: &GrayImage) {
        let (width, height) = frame.dimensions();
        self.width = width;
        self.height = height;
        self.mean = frame.as_raw().iter().map(|v| *v as f32).collect();
        self.var = vec![VAR_INIT; self.mean.len()];
        self.frames_seen = 1;
    }
}

/// A pixel darker than the background but within the shadow ratio
fn is_shadow(value: f32, mean: f32) -> bool {
    if mean <= 1.0 {
        return false;
    }
    let ratio = value / mean;
    (SHADOW_TAU..1.0).contains(&ratio)
}
