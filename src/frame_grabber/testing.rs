//! Scripted frame backend for capture tests

use super::reader::{FrameBackend, FrameReader, GrabOutcome};
use super::types::SourceConfig;
use crate::error::{Error, Result};
use image::{Rgb, RgbImage};
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Deterministic noise frame, 320x240
pub fn textured(seed: u64) -> RgbImage {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    RgbImage::from_fn(320, 240, |_, _| Rgb([rng.gen(), rng.gen(), rng.gen()]))
}

/// Replays a fixed script, then repeats one outcome forever
pub struct ScriptedBackend {
    opens: AtomicUsize,
    releases: Arc<AtomicUsize>,
    max_opens: usize,
    read_delay: Duration,
    script: Arc<Mutex<VecDeque<GrabOutcome>>>,
    repeat: GrabOutcome,
}

impl ScriptedBackend {
    pub fn new(script: Vec<GrabOutcome>, repeat: GrabOutcome) -> Self {
        Self {
            opens: AtomicUsize::new(0),
            releases: Arc::new(AtomicUsize::new(0)),
            max_opens: usize::MAX,
            read_delay: Duration::ZERO,
            script: Arc::new(Mutex::new(script.into())),
            repeat,
        }
    }

    /// Opens beyond `max_opens` fail with a capture error
    pub fn with_max_opens(mut self, max_opens: usize) -> Self {
        self.max_opens = max_opens;
        self
    }

    /// Every read blocks this long before returning
    pub fn with_read_delay(mut self, read_delay: Duration) -> Self {
        self.read_delay = read_delay;
        self
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

struct ScriptedReader {
    script: Arc<Mutex<VecDeque<GrabOutcome>>>,
    repeat: GrabOutcome,
    position: u64,
    read_delay: Duration,
    releases: Arc<AtomicUsize>,
}

impl FrameReader for ScriptedReader {
    fn read_frame(&mut self) -> GrabOutcome {
        if !self.read_delay.is_zero() {
            std::thread::sleep(self.read_delay);
        }
        let next = self.script.lock().unwrap().pop_front();
        let outcome = next.unwrap_or_else(|| self.repeat.clone());
        if matches!(outcome, GrabOutcome::Frame(_)) {
            self.position += 1;
        }
        outcome
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn total_frames(&self) -> Option<u64> {
        None
    }

    fn release(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

impl FrameBackend for ScriptedBackend {
    fn open(&self, _config: &SourceConfig) -> Result<Box<dyn FrameReader>> {
        let count = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if count > self.max_opens {
            return Err(Error::Capture("connection refused".to_string()));
        }
        Ok(Box::new(ScriptedReader {
            script: self.script.clone(),
            repeat: self.repeat.clone(),
            position: 0,
            read_delay: self.read_delay,
            releases: self.releases.clone(),
        }))
    }
}
