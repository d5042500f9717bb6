//! FrameGrabber - Per-Source Capture Connection
//!
//! ## Responsibilities
//!
//! - Own one source's decode handle and lifecycle state machine
//! - Run the capture loop: grab, validate, score, deliver
//! - Recover from consecutive grab failures with bounded reconnects
//! - Hot-swap the source config under a connection-scoped lock
//! - Bound every grab by a wall-clock deadline
//!
//! ## State machine
//!
//! `Disconnected -> Connecting -> Connected -> Capturing`, plus `Error`
//! which only an explicit `connect()`/`start()` leaves.

pub mod ffmpeg;
pub mod reader;
pub mod types;
pub mod validation;

#[cfg(test)]
pub(crate) mod testing;

pub use ffmpeg::{FfmpegBackend, FfmpegSettings};
pub use reader::{FrameBackend, FrameReader, GrabOutcome};
pub use types::{
    PlaybackProgress, SourceConfig, SourceId, SourceKind, SourceState, SourceStatus,
    StatusSnapshot,
};

use crate::error::{Error, Result};
use crate::frame_queue::{FrameItem, MotionSnapshot};
use crate::motion_detector::MotionDetector;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use validation::validate_frame;

/// Receives accepted frames
pub type FrameCallback = Arc<dyn Fn(FrameItem) + Send + Sync>;

/// Frames captured before the detection-rate check kicks in
const DETECTION_RATE_MIN_FRAMES: u64 = 100;

/// Capture loop tuning shared by all sources
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Consecutive failed grabs before reconnecting
    pub max_consecutive_errors: u32,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    /// Loop sleep between ticks
    pub tick: Duration,
    /// Pause after an unexpected loop fault
    pub error_backoff: Duration,
    pub jpeg_quality: u8,
    /// Wall-clock limit for one grab, however the reader behaves
    pub grab_timeout: Duration,
    /// Per-source motion stage dumps land under `<dir>/<source_id>`
    pub motion_debug_dir: Option<PathBuf>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 10,
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(2),
            tick: Duration::from_millis(100),
            error_backoff: Duration::from_secs(5),
            jpeg_quality: 85,
            grab_timeout: Duration::from_secs(30),
            motion_debug_dir: None,
        }
    }
}

/// Config and detector, always swapped together
struct CapturePipeline {
    config: SourceConfig,
    detector: Option<MotionDetector>,
}

fn build_detector(config: &SourceConfig, debug_dir: Option<&Path>) -> Result<Option<MotionDetector>> {
    if !config.motion_enabled {
        return Ok(None);
    }
    let mut detector =
        MotionDetector::from_sensitivity(config.sensitivity, config.motion_threshold, config.custom_motion)?;
    if let Some(dir) = debug_dir {
        detector.enable_debug(dir.join(config.id.to_string()));
    }
    Ok(Some(detector))
}

/// Decode handle plus bookkeeping for the grab in flight
#[derive(Default)]
struct ReaderSlot {
    reader: Option<Box<dyn FrameReader>>,
    /// Bumped on every swap. A grab hands its reader back only to the
    /// generation it took it from.
    generation: u64,
    /// Reader is out for a grab
    busy: bool,
}

type SharedSlot = Arc<StdMutex<ReaderSlot>>;

fn lock_slot(slot: &StdMutex<ReaderSlot>) -> StdMutexGuard<'_, ReaderSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

enum SlotRead {
    Read(GrabOutcome, u64),
    /// Another grab still holds the reader
    Busy,
    Empty,
}

/// Take the reader out, read one frame and hand it back. A reader whose
/// slot was swapped in the meantime is released instead. Blocking.
fn read_from_slot(slot: &StdMutex<ReaderSlot>) -> SlotRead {
    let (mut reader, generation) = {
        let mut guard = lock_slot(slot);
        match guard.reader.take() {
            Some(reader) => {
                guard.busy = true;
                (reader, guard.generation)
            }
            None if guard.busy => return SlotRead::Busy,
            None => return SlotRead::Empty,
        }
    };

    let outcome = reader.read_frame();
    let position = reader.position();

    let mut guard = lock_slot(slot);
    if guard.generation == generation {
        guard.reader = Some(reader);
        guard.busy = false;
    } else {
        drop(guard);
        reader.release();
    }
    SlotRead::Read(outcome, position)
}

/// Swap the slot's reader without waiting on a grab in flight, then
/// release the previous one off the runtime
async fn swap_reader(source_id: SourceId, slot: &SharedSlot, next: Option<Box<dyn FrameReader>>) {
    let previous = {
        let mut guard = lock_slot(slot);
        guard.generation = guard.generation.wrapping_add(1);
        guard.busy = false;
        std::mem::replace(&mut guard.reader, next)
    };

    let Some(mut previous) = previous else {
        return;
    };
    if let Err(e) = tokio::task::spawn_blocking(move || previous.release()).await {
        tracing::error!(source_id = %source_id, error = %e, "Reader release task failed");
    }
}

/// What scoring decided for one frame
enum MotionDecision {
    /// Filtering disabled for this source
    Unfiltered,
    Accepted(MotionSnapshot),
    Filtered { score: f32 },
    /// Scoring failed; the frame is sent as if it had motion
    FailOpen(MotionSnapshot),
}

struct ScoredFrame {
    decision: MotionDecision,
    threshold: f32,
    /// Present only for frames that will be delivered
    jpeg: Option<Vec<u8>>,
}

/// Outcome of one capture tick
#[derive(Debug, Clone, PartialEq)]
enum TickOutcome {
    Delivered,
    Filtered,
    /// Grab failed (decode noise, read error, invalid frame)
    Failed,
    /// An earlier grab past its deadline still holds the reader
    Busy,
    EndOfStream,
    /// Unexpected fault inside the loop itself
    Faulted(String),
}

fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder.encode_image(frame)?;
    Ok(buf)
}

/// Score a frame under the pipeline lock, then encode it if it will be sent
fn score_and_encode(
    mut pipeline: OwnedMutexGuard<CapturePipeline>,
    frame: RgbImage,
    quality: u8,
) -> Result<ScoredFrame> {
    let source_id = pipeline.config.id;
    let threshold = pipeline.config.motion_threshold;

    let decision = match pipeline.detector.as_mut() {
        None => MotionDecision::Unfiltered,
        Some(detector) => match detector.detect(&frame) {
            Ok(result) if result.has_motion => MotionDecision::Accepted(MotionSnapshot {
                score: result.score,
                threshold: detector.threshold(),
                mask: detector.last_mask().cloned(),
            }),
            Ok(result) => MotionDecision::Filtered { score: result.score },
            Err(e) => {
                tracing::error!(
                    source_id = %source_id,
                    error = %e,
                    "Motion scoring failed, sending frame"
                );
                MotionDecision::FailOpen(MotionSnapshot {
                    score: 100.0,
                    threshold: detector.threshold(),
                    mask: None,
                })
            }
        },
    };
    drop(pipeline);

    let jpeg = match decision {
        MotionDecision::Filtered { .. } => None,
        _ => Some(encode_jpeg(&frame, quality)?),
    };

    Ok(ScoredFrame {
        decision,
        threshold,
        jpeg,
    })
}

/// State shared between the handle and its capture task
struct Shared {
    id: SourceId,
    backend: Arc<dyn FrameBackend>,
    settings: CaptureSettings,
    pipeline: Arc<Mutex<CapturePipeline>>,
    state: RwLock<SourceState>,
    reader: SharedSlot,
    on_frame: Option<FrameCallback>,
}

impl Shared {
    /// Swap the reader slot, releasing whatever was open
    async fn replace_reader(&self, next: Option<Box<dyn FrameReader>>) {
        swap_reader(self.id, &self.reader, next).await;
    }

    async fn connect(&self) -> Result<()> {
        self.state.write().await.status = SourceStatus::Connecting;
        let config = self.pipeline.lock().await.config.clone();

        tracing::info!(
            source_id = %self.id,
            name = %config.name,
            uri = %config.display_uri(),
            kind = config.resolved_kind().as_str(),
            "Connecting to source"
        );

        let backend = self.backend.clone();
        let opened = tokio::task::spawn_blocking(move || backend.open(&config))
            .await
            .map_err(|e| Error::Internal(format!("open task failed: {}", e)))
            .and_then(|result| result);

        match opened {
            Ok(reader) => {
                let total_frames = reader.total_frames();
                self.replace_reader(Some(reader)).await;

                if let Some(detector) = self.pipeline.lock().await.detector.as_mut() {
                    detector.reset();
                }

                let mut state = self.state.write().await;
                state.reset_stats();
                state.total_frames = total_frames;
                state.status = SourceStatus::Connected;
                tracing::info!(
                    source_id = %self.id,
                    name = %state.name,
                    total_frames = ?total_frames,
                    "Source connected"
                );
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.write().await;
                state.status = SourceStatus::Error;
                state.record_error(e.to_string());
                tracing::error!(
                    source_id = %self.id,
                    name = %state.name,
                    error = %e,
                    "Failed to connect to source"
                );
                Err(e)
            }
        }
    }

    /// One read on `slot`, bounded by `grab_timeout`. A read past the
    /// deadline keeps running on the blocking pool and hands its reader
    /// back when it returns.
    async fn grab(&self, slot: &SharedSlot) -> Result<SlotRead> {
        let slot = slot.clone();
        let task = tokio::task::spawn_blocking(move || read_from_slot(&slot));

        match tokio::time::timeout(self.settings.grab_timeout, task).await {
            Ok(joined) => joined.map_err(|e| Error::Internal(format!("grab task failed: {}", e))),
            Err(_) => {
                let timeout_ms = self.settings.grab_timeout.as_millis();
                tracing::warn!(source_id = %self.id, timeout_ms = timeout_ms as u64, "Frame grab timed out");
                Ok(SlotRead::Read(
                    GrabOutcome::Failed(format!("Frame grab timed out after {}ms", timeout_ms)),
                    0,
                ))
            }
        }
    }

    /// Grab one frame and check it. Failures are recorded on the state.
    async fn grab_valid_frame(&self, slot: &SharedSlot) -> std::result::Result<(RgbImage, u64), TickOutcome> {
        let (outcome, position) = match self.grab(slot).await {
            Ok(SlotRead::Read(outcome, position)) => (outcome, position),
            Ok(SlotRead::Busy) => return Err(TickOutcome::Busy),
            Ok(SlotRead::Empty) => (GrabOutcome::Failed("Source not open".to_string()), 0),
            Err(e) => return Err(TickOutcome::Faulted(e.to_string())),
        };

        let frame = match outcome {
            GrabOutcome::Frame(frame) => frame,
            GrabOutcome::DecoderError(msg) => {
                tracing::debug!(source_id = %self.id, error = %msg, "Decoder error skipped");
                self.state.write().await.record_decoder_error(msg);
                return Err(TickOutcome::Failed);
            }
            GrabOutcome::Failed(msg) => {
                tracing::debug!(source_id = %self.id, error = %msg, "Frame grab failed");
                self.state.write().await.record_error(msg);
                return Err(TickOutcome::Failed);
            }
            GrabOutcome::EndOfStream => return Err(TickOutcome::EndOfStream),
        };

        if let Err(rejection) = validate_frame(Some(&frame)) {
            tracing::warn!(
                source_id = %self.id,
                reason = rejection.as_str(),
                "Frame validation failed"
            );
            self.state
                .write()
                .await
                .record_error(format!("Frame validation failed: {}", rejection.as_str()));
            return Err(TickOutcome::Failed);
        }

        Ok((frame, position))
    }

    async fn tick(&self) -> TickOutcome {
        let (frame, position) = match self.grab_valid_frame(&self.reader).await {
            Ok(grabbed) => grabbed,
            Err(outcome) => return outcome,
        };

        let captured_at: DateTime<Utc> = Utc::now();
        self.state.write().await.record_frame(captured_at, position);

        let pipeline = self.pipeline.clone().lock_owned().await;
        let quality = self.settings.jpeg_quality;
        let scored = match tokio::task::spawn_blocking(move || score_and_encode(pipeline, frame, quality)).await {
            Ok(Ok(scored)) => scored,
            Ok(Err(e)) => return TickOutcome::Faulted(e.to_string()),
            Err(e) => return TickOutcome::Faulted(format!("scoring task failed: {}", e)),
        };

        let motion = {
            let mut state = self.state.write().await;
            let motion = match scored.decision {
                MotionDecision::Unfiltered => {
                    state.record_sent(None);
                    None
                }
                MotionDecision::Accepted(snapshot) => {
                    state.record_sent(Some(snapshot.score));
                    tracing::debug!(
                        source_id = %self.id,
                        score = snapshot.score,
                        threshold = scored.threshold,
                        "Frame sent"
                    );
                    Some(snapshot)
                }
                MotionDecision::FailOpen(snapshot) => {
                    state.record_sent(None);
                    Some(snapshot)
                }
                MotionDecision::Filtered { score } => {
                    state.record_filtered();
                    tracing::debug!(
                        source_id = %self.id,
                        score = score,
                        threshold = scored.threshold,
                        "Frame filtered"
                    );
                    check_detection_rate(self.id, &state, scored.threshold);
                    return TickOutcome::Filtered;
                }
            };
            if motion.is_some() {
                check_detection_rate(self.id, &state, scored.threshold);
            }
            motion
        };

        let Some(data) = scored.jpeg else {
            return TickOutcome::Faulted("accepted frame was not encoded".to_string());
        };

        if let Some(on_frame) = &self.on_frame {
            on_frame(FrameItem {
                source_id: self.id,
                data,
                timestamp: captured_at,
                motion,
            });
        }
        TickOutcome::Delivered
    }

    /// Release and reopen up to `reconnect_attempts` times
    async fn reconnect(&self) -> bool {
        let max_attempts = self.settings.reconnect_attempts;

        for attempt in 1..=max_attempts {
            tracing::info!(
                source_id = %self.id,
                attempt = attempt,
                max_attempts = max_attempts,
                "Reconnecting source"
            );
            self.replace_reader(None).await;
            tokio::time::sleep(self.settings.reconnect_delay).await;

            if self.connect().await.is_ok() {
                self.state.write().await.status = SourceStatus::Capturing;
                return true;
            }
        }

        self.state.write().await.status = SourceStatus::Error;
        tracing::error!(
            source_id = %self.id,
            attempts = max_attempts,
            "Reconnect attempts exhausted, source in error state"
        );
        false
    }

    async fn capture_loop(self: Arc<Self>) {
        let mut last_capture: Option<Instant> = None;
        let mut consecutive_errors: u32 = 0;

        loop {
            let interval = self.pipeline.lock().await.config.interval();
            let due = last_capture.map_or(true, |at| at.elapsed() >= interval);

            if due {
                match self.tick().await {
                    TickOutcome::Delivered | TickOutcome::Filtered => {
                        last_capture = Some(Instant::now());
                        consecutive_errors = 0;
                    }
                    outcome @ (TickOutcome::Failed | TickOutcome::Busy) => {
                        if outcome == TickOutcome::Busy {
                            self.state
                                .write()
                                .await
                                .record_error("Previous frame grab still running".to_string());
                        }
                        consecutive_errors += 1;
                        tracing::warn!(
                            source_id = %self.id,
                            consecutive_errors = consecutive_errors,
                            max = self.settings.max_consecutive_errors,
                            "Frame capture failed"
                        );
                    }
                    TickOutcome::EndOfStream => {
                        self.replace_reader(None).await;
                        self.state.write().await.status = SourceStatus::Disconnected;
                        tracing::info!(source_id = %self.id, "End of stream reached, source disconnected");
                        return;
                    }
                    TickOutcome::Faulted(e) => {
                        self.state.write().await.record_error(e.clone());
                        tracing::error!(source_id = %self.id, error = %e, "Capture loop fault");
                        tokio::time::sleep(self.settings.error_backoff).await;
                        continue;
                    }
                }
            }

            if consecutive_errors >= self.settings.max_consecutive_errors {
                tracing::warn!(
                    source_id = %self.id,
                    consecutive_errors = consecutive_errors,
                    "Too many consecutive errors"
                );
                if !self.reconnect().await {
                    return;
                }
                consecutive_errors = 0;
                last_capture = None;
            }

            tokio::time::sleep(self.settings.tick).await;
        }
    }
}

fn check_detection_rate(source_id: SourceId, state: &SourceState, threshold: f32) {
    if state.frames_captured < DETECTION_RATE_MIN_FRAMES
        || state.frames_captured % DETECTION_RATE_MIN_FRAMES != 0
    {
        return;
    }

    let rate = state.detection_rate();
    if rate < 5.0 {
        tracing::warn!(
            source_id = %source_id,
            name = %state.name,
            detection_rate = rate,
            threshold = threshold,
            "Low detection rate, consider lowering motion_threshold"
        );
    } else if rate > 95.0 {
        tracing::warn!(
            source_id = %source_id,
            name = %state.name,
            detection_rate = rate,
            threshold = threshold,
            "High detection rate, consider raising motion_threshold"
        );
    }
}

/// One source connection
pub struct FrameGrabber {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FrameGrabber {
    pub fn new(
        config: SourceConfig,
        backend: Arc<dyn FrameBackend>,
        settings: CaptureSettings,
        on_frame: Option<FrameCallback>,
    ) -> Result<Self> {
        config.validate()?;
        let detector = build_detector(&config, settings.motion_debug_dir.as_deref())?;

        Ok(Self {
            shared: Arc::new(Shared {
                id: config.id,
                backend,
                settings,
                state: RwLock::new(SourceState::new(config.name.clone())),
                pipeline: Arc::new(Mutex::new(CapturePipeline { config, detector })),
                reader: Arc::new(StdMutex::new(ReaderSlot::default())),
                on_frame,
            }),
            task: Mutex::new(None),
        })
    }

    pub fn id(&self) -> SourceId {
        self.shared.id
    }

    pub async fn config(&self) -> SourceConfig {
        self.shared.pipeline.lock().await.config.clone()
    }

    pub async fn status(&self) -> SourceStatus {
        self.shared.state.read().await.status
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        self.shared.state.read().await.snapshot(self.shared.id)
    }

    /// Capture task alive
    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Open the source. Resets stats and the motion model.
    pub async fn connect(&self) -> Result<()> {
        self.shared.connect().await
    }

    /// Start capturing, connecting first when needed
    pub async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        if self.status().await != SourceStatus::Connected {
            self.shared.connect().await?;
        }

        self.shared.state.write().await.status = SourceStatus::Capturing;
        let shared = self.shared.clone();
        *task = Some(tokio::spawn(shared.capture_loop()));

        tracing::info!(source_id = %self.shared.id, "Capture started");
        Ok(())
    }

    /// Cancel the capture loop. The handle stays open.
    pub async fn stop(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        let mut state = self.shared.state.write().await;
        if state.status == SourceStatus::Capturing {
            state.status = SourceStatus::Connected;
        }
        tracing::info!(source_id = %self.shared.id, "Capture stopped");
    }

    /// Stop and release the handle
    pub async fn disconnect(&self) {
        self.stop().await;
        self.shared.replace_reader(None).await;
        self.shared.state.write().await.status = SourceStatus::Disconnected;
        tracing::info!(source_id = %self.shared.id, "Source disconnected");
    }

    /// Swap in a new config.
    ///
    /// Returns true when live parameters changed (threshold, sensitivity,
    /// motion filtering, interval). A changed threshold or sensitivity
    /// rebuilds the detector, discarding its background model. URI and
    /// credential changes apply on the next connect.
    pub async fn update_config(&self, config: SourceConfig) -> Result<bool> {
        if config.id != self.shared.id {
            return Err(Error::Validation(format!(
                "Config id {} does not match source {}",
                config.id, self.shared.id
            )));
        }
        config.validate()?;

        let mut pipeline = self.shared.pipeline.lock().await;
        let old = &pipeline.config;
        let motion_changed = old.motion_threshold != config.motion_threshold
            || old.sensitivity != config.sensitivity
            || old.custom_motion != config.custom_motion;
        let interval_changed = old.interval_secs != config.interval_secs;
        let was_enabled = pipeline.detector.is_some();

        let mut changed = interval_changed;
        if config.motion_enabled {
            if !was_enabled || motion_changed {
                pipeline.detector = build_detector(&config, self.shared.settings.motion_debug_dir.as_deref())?;
                tracing::info!(
                    source_id = %self.shared.id,
                    sensitivity = %config.sensitivity,
                    threshold = config.motion_threshold,
                    "Motion detector rebuilt"
                );
                changed = true;
            }
        } else if was_enabled || motion_changed {
            pipeline.detector = None;
            changed = true;
        }

        self.shared.state.write().await.name = config.name.clone();
        pipeline.config = config;
        Ok(changed)
    }

    /// Grab one JPEG frame.
    ///
    /// An open handle is shared with the capture loop. Otherwise a
    /// temporary handle is opened and released again, leaving status,
    /// stats and the motion model as they were.
    pub async fn capture_single_frame(&self) -> Result<Option<Vec<u8>>> {
        let frame = match self.status().await {
            SourceStatus::Connected | SourceStatus::Capturing => self.grab_open_frame().await?,
            _ => self.grab_temporary_frame().await?,
        };
        let Some(frame) = frame else {
            return Ok(None);
        };

        let quality = self.shared.settings.jpeg_quality;
        tokio::task::spawn_blocking(move || encode_jpeg(&frame, quality))
            .await
            .map_err(|e| Error::Internal(format!("encode task failed: {}", e)))
            .and_then(|result| result)
            .map(Some)
    }

    /// Grab from the open handle, waiting out a capture-loop grab in flight
    async fn grab_open_frame(&self) -> Result<Option<RgbImage>> {
        let deadline = Instant::now() + self.shared.settings.grab_timeout;
        loop {
            match self.shared.grab_valid_frame(&self.shared.reader).await {
                Ok((frame, _)) => return Ok(Some(frame)),
                Err(TickOutcome::Busy) if Instant::now() < deadline => {
                    tokio::time::sleep(self.shared.settings.tick).await;
                }
                Err(TickOutcome::Busy) => {
                    return Err(Error::Capture("Frame grab still in progress".to_string()));
                }
                Err(TickOutcome::Faulted(e)) => return Err(Error::Capture(e)),
                Err(_) => return Ok(None),
            }
        }
    }

    async fn grab_temporary_frame(&self) -> Result<Option<RgbImage>> {
        let config = self.config().await;
        let backend = self.shared.backend.clone();
        let reader = tokio::task::spawn_blocking(move || backend.open(&config))
            .await
            .map_err(|e| Error::Internal(format!("open task failed: {}", e)))??;

        let slot: SharedSlot = Arc::new(StdMutex::new(ReaderSlot {
            reader: Some(reader),
            ..ReaderSlot::default()
        }));
        let result = match self.shared.grab_valid_frame(&slot).await {
            Ok((frame, _)) => Ok(Some(frame)),
            Err(TickOutcome::Faulted(e)) => Err(Error::Capture(e)),
            Err(_) => Ok(None),
        };

        swap_reader(self.shared.id, &slot, None).await;
        result
    }
}
