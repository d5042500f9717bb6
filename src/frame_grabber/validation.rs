//! Decoded frame sanity checks

use image::RgbImage;

pub const MIN_FRAME_WIDTH: u32 = 160;
pub const MIN_FRAME_HEIGHT: u32 = 120;

/// Why a frame was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRejection {
    Empty,
    /// Every pixel identical, usually a corrupt decode
    Uniform,
    TooSmall,
}

impl FrameRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameRejection::Empty => "empty frame",
            FrameRejection::Uniform => "uniform color frame",
            FrameRejection::TooSmall => "frame below minimum resolution",
        }
    }
}

/// Validate a decoded frame before scoring. `None` is a missing frame.
pub fn validate_frame(frame: Option<&RgbImage>) -> Result<(), FrameRejection> {
    let frame = frame.ok_or(FrameRejection::Empty)?;
    if frame.width() == 0 || frame.height() == 0 || frame.as_raw().is_empty() {
        return Err(FrameRejection::Empty);
    }

    let first = frame.get_pixel(0, 0);
    if frame.pixels().all(|p| p == first) {
        return Err(FrameRejection::Uniform);
    }

    if frame.width() < MIN_FRAME_WIDTH || frame.height() < MIN_FRAME_HEIGHT {
        return Err(FrameRejection::TooSmall);
    }

    Ok(())
}
