//! MotionDetector - Hybrid Motion Scoring
//!
//! ## Responsibilities
//!
//! - Turn a raw frame into a motion score (0-100) and a send/drop decision
//! - Combine a frame-difference estimator with a background-subtraction estimator
//! - Keep the last combined motion mask for overlay rendering
//! - Optionally dump every scoring stage to a debug directory
//!
//! One detector belongs to exactly one source connection. Its previous frame
//! and background model are never shared and are discarded on `reset()`.

mod background;
mod debug;
mod presets;

pub use background::BackgroundModel;
pub use debug::DebugDump;
pub use presets::{MotionParams, Sensitivity};

use crate::error::{Error, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use std::path::PathBuf;

/// Working resolution for scoring
pub const PROCESS_WIDTH: u32 = 320;
pub const PROCESS_HEIGHT: u32 = 240;

/// Binarized mask value
const MASK_ON: u8 = 255;

/// Outcome of scoring one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionResult {
    /// Combined motion score (0-100)
    pub score: f32,
    /// `score >= threshold`
    pub has_motion: bool,
    /// Frame-difference estimator (0-100)
    pub pixel_diff_score: f32,
    /// Background-subtraction estimator (0-100)
    pub background_score: f32,
}

/// Hybrid motion detector
pub struct MotionDetector {
    threshold: f32,
    sensitivity: Sensitivity,
    params: MotionParams,
    previous_frame: Option<GrayImage>,
    background: BackgroundModel,
    last_mask: Option<GrayImage>,
    frame_count: u64,
    debug: Option<DebugDump>,
}

impl MotionDetector {
    /// Create a detector with raw parameters (`Custom` sensitivity)
    pub fn new(threshold: f32, params: MotionParams) -> Result<Self> {
        Self::build(threshold, Sensitivity::Custom, params)
    }

    /// Create a detector from a sensitivity preset.
    ///
    /// `custom` is only consulted for [`Sensitivity::Custom`].
    pub fn from_sensitivity(
        sensitivity: Sensitivity,
        threshold: f32,
        custom: Option<MotionParams>,
    ) -> Result<Self> {
        Self::build(threshold, sensitivity, MotionParams::resolve(sensitivity, custom))
    }

    fn build(threshold: f32, sensitivity: Sensitivity, params: MotionParams) -> Result<Self> {
        validate_threshold(threshold)?;
        params.validate()?;

        Ok(Self {
            threshold,
            sensitivity,
            params,
            previous_frame: None,
            background: BackgroundModel::new(params.bg_history, params.bg_var_threshold),
            last_mask: None,
            frame_count: 0,
            debug: None,
        })
    }

    /// Dump scoring stages under `dir`. Stays off when the directory
    /// cannot be created.
    pub fn enable_debug(&mut self, dir: impl Into<PathBuf>) -> bool {
        self.debug = DebugDump::open(dir);
        self.debug.is_some()
    }

    pub fn debug_dir(&self) -> Option<&std::path::Path> {
        self.debug.as_ref().map(DebugDump::dir)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn sensitivity(&self) -> Sensitivity {
        self.sensitivity
    }

    pub fn params(&self) -> &MotionParams {
        &self.params
    }

    /// Number of frames scored since creation or the last reset
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Combined mask (diff ∪ foreground) of the last scored frame, at
    /// [`PROCESS_WIDTH`]x[`PROCESS_HEIGHT`]. `None` until a baseline exists.
    pub fn last_mask(&self) -> Option<&GrayImage> {
        self.last_mask.as_ref()
    }

    /// Update the decision threshold. Out-of-range values are rejected and
    /// the previous threshold is kept.
    pub fn update_threshold(&mut self, threshold: f32) -> Result<()> {
        validate_threshold(threshold)?;
        self.threshold = threshold;
        tracing::debug!(threshold = threshold, "Motion threshold updated");
        Ok(())
    }

    /// Discard the previous frame and recreate the background model
    pub fn reset(&mut self) {
        self.previous_frame = None;
        self.last_mask = None;
        self.frame_count = 0;
        self.background = BackgroundModel::new(self.params.bg_history, self.params.bg_var_threshold);
        tracing::debug!("Motion detector reset");
    }

    /// Score a frame.
    ///
    /// The first frame after creation or reset always reports motion and
    /// seeds both estimators. Fails only for an empty frame.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<MotionResult> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(Error::Validation("Invalid frame: empty".to_string()));
        }

        self.frame_count += 1;
        let processed = preprocess(frame, self.params.blur_kernel);
        let fg_mask = self.background.apply(&processed);
        if let Some(debug) = &self.debug {
            debug.save(self.frame_count, "01_preprocessed", &processed);
            debug.save(self.frame_count, "04_bg_sub_raw", &fg_mask);
        }

        let previous = match self.previous_frame.replace(processed) {
            Some(previous) => previous,
            None => {
                self.last_mask = None;
                tracing::debug!(threshold = self.threshold, "First frame scored, baseline seeded");
                return Ok(MotionResult {
                    score: 100.0,
                    has_motion: true,
                    pixel_diff_score: 100.0,
                    background_score: 100.0,
                });
            }
        };
        let current = self
            .previous_frame
            .as_ref()
            .ok_or_else(|| Error::Internal("previous frame missing after replace".to_string()))?;

        let diff_mask = difference_mask(&previous, current, self.params.pixel_threshold);
        if let Some(debug) = &self.debug {
            debug.save(self.frame_count, "02_pixel_diff", &abs_difference(&previous, current));
            debug.save(self.frame_count, "03_pixel_thresh", &diff_mask);
            debug.save(self.frame_count, "05_bg_sub_thresh", &foreground_only(&fg_mask));
        }
        let total = (current.width() * current.height()) as f32;

        let changed = count_on(&diff_mask) as f32;
        let pixel_diff_score = (changed / total * 100.0 * self.params.pixel_scale).min(100.0);

        // Shadow pixels (127) are excluded: only full foreground counts
        let foreground = fg_mask.pixels().filter(|p| p[0] == background::FOREGROUND).count() as f32;
        let background_score = (foreground / total * 100.0 * self.params.background_scale).min(100.0);

        let score = (pixel_diff_score * self.params.pixel_diff_weight
            + background_score * self.params.background_weight)
            .clamp(0.0, 100.0);
        let has_motion = score >= self.threshold;

        self.last_mask = Some(union_mask(&diff_mask, &fg_mask));

        if self.debug.is_some() {
            tracing::debug!(
                frame = self.frame_count,
                score = score,
                blur_kernel = self.params.blur_kernel,
                pixel_threshold = self.params.pixel_threshold,
                pixel_scale = self.params.pixel_scale,
                background_scale = self.params.background_scale,
                pixel_diff_weight = self.params.pixel_diff_weight,
                background_weight = self.params.background_weight,
                "Motion scoring parameters"
            );
        }

        tracing::debug!(
            score = score,
            threshold = self.threshold,
            pixel_diff = pixel_diff_score,
            bg_sub = background_score,
            has_motion = has_motion,
            "Motion detection"
        );

        Ok(MotionResult {
            score,
            has_motion,
            pixel_diff_score,
            background_score,
        })
    }
}

fn validate_threshold(threshold: f32) -> Result<()> {
    if !(0.0..=100.0).contains(&threshold) {
        return Err(Error::Validation(format!(
            "Threshold must be between 0 and 100, got {}",
            threshold
        )));
    }
    Ok(())
}

/// Luma, downsample, blur
fn preprocess(frame: &RgbImage, blur_kernel: u32) -> GrayImage {
    let gray = imageops::grayscale(frame);
    let resized = if gray.dimensions() == (PROCESS_WIDTH, PROCESS_HEIGHT) {
        gray
    } else {
        imageops::resize(&gray, PROCESS_WIDTH, PROCESS_HEIGHT, FilterType::Triangle)
    };

    if blur_kernel <= 1 {
        return resized;
    }
    imageproc::filter::gaussian_blur_f32(&resized, kernel_sigma(blur_kernel))
}

/// Sigma an OpenCV-style Gaussian derives from an odd kernel size
fn kernel_sigma(kernel: u32) -> f32 {
    0.3 * ((kernel as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

fn difference_mask(previous: &GrayImage, current: &GrayImage, pixel_threshold: u8) -> GrayImage {
    let mut mask = GrayImage::new(current.width(), current.height());
    for ((a, b), out) in previous
        .as_raw()
        .iter()
        .zip(current.as_raw().iter())
        .zip(mask.iter_mut())
    {
        if a.abs_diff(*b) > pixel_threshold {
            *out = MASK_ON;
        }
    }
    mask
}

fn abs_difference(previous: &GrayImage, current: &GrayImage) -> GrayImage {
    GrayImage::from_fn(current.width(), current.height(), |x, y| {
        Luma([previous.get_pixel(x, y)[0].abs_diff(current.get_pixel(x, y)[0])])
    })
}

/// Foreground only, shadows dropped
fn foreground_only(fg_mask: &GrayImage) -> GrayImage {
    GrayImage::from_fn(fg_mask.width(), fg_mask.height(), |x, y| {
        let on = fg_mask.get_pixel(x, y)[0] == background::FOREGROUND;
        Luma([if on { MASK_ON } else { 0 }])
    })
}

fn union_mask(diff: &GrayImage, foreground: &GrayImage) -> GrayImage {
    GrayImage::from_fn(diff.width(), diff.height(), |x, y| {
        let on = diff.get_pixel(x, y)[0] == MASK_ON
            || foreground.get_pixel(x, y)[0] == background::FOREGROUND;
        Luma([if on { MASK_ON } else { 0 }])
    })
}

fn count_on(mask: &GrayImage) -> usize {
    mask.as_raw().iter().filter(|v| **v == MASK_ON).count()
}
