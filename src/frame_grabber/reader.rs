//! Frame decode boundary
//!
//! A `FrameBackend` opens a `FrameReader` for a source. Readers are blocking
//! and are only ever driven from `spawn_blocking`.

use super::types::SourceConfig;
use crate::error::Result;
use image::RgbImage;

/// Result of one grab
#[derive(Debug, Clone)]
pub enum GrabOutcome {
    /// Decoded frame
    Frame(RgbImage),
    /// Recoverable bitstream glitch (missing picture, corrupt slice, ...)
    DecoderError(String),
    /// Generic read failure
    Failed(String),
    /// File source exhausted
    EndOfStream,
}

/// An open source handle
pub trait FrameReader: Send {
    /// Grab the next frame
    fn read_frame(&mut self) -> GrabOutcome;

    /// Frames read so far
    fn position(&self) -> u64;

    /// Total frames for file sources, when the container reports it
    fn total_frames(&self) -> Option<u64>;

    /// Release the underlying handle. Further reads fail.
    fn release(&mut self);
}

/// Opens readers for sources
pub trait FrameBackend: Send + Sync {
    fn open(&self, config: &SourceConfig) -> Result<Box<dyn FrameReader>>;
}
