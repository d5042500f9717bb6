//! FrameQueue - Bounded Frame Buffer with Worker Pool
//!
//! ## Responsibilities
//!
//! - Non-blocking `put`: a full queue drops the new frame and counts it
//! - Fixed pool of workers draining the queue into an injected processor
//! - Processor failures and panics are isolated per item
//! - Every dequeued item is acknowledged, so `wait_empty` stays correct
//!
//! ## Backpressure
//!
//! Producers (capture loops) are never blocked. When consumers fall behind
//! the newest frames are dropped and `dropped` increments.

use crate::error::{Error, Result};
use crate::frame_grabber::SourceId;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use image::GrayImage;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

/// Worker poll timeout; bounds how long an idle worker ignores shutdown
const WORKER_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Motion data captured at scoring time
#[derive(Debug, Clone)]
pub struct MotionSnapshot {
    pub score: f32,
    pub threshold: f32,
    /// Combined motion mask at detector resolution
    pub mask: Option<GrayImage>,
}

/// A queued frame. Ownership moves to the worker that dequeues it.
#[derive(Debug, Clone)]
pub struct FrameItem {
    pub source_id: SourceId,
    /// JPEG bytes
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub motion: Option<MotionSnapshot>,
}

/// Injected per-item processor
pub type FrameProcessorFn = Arc<dyn Fn(FrameItem) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Point-in-time queue statistics
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub queue_size: usize,
    pub max_size: usize,
    pub processed: u64,
    pub errors: u64,
    pub dropped: u64,
    pub dequeued: u64,
    pub workers: usize,
    pub running: bool,
}

#[derive(Default)]
struct QueueCounters {
    processed: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
    dequeued: AtomicU64,
    /// Accepted but not yet acknowledged
    pending: AtomicUsize,
    drained: Notify,
}

impl QueueCounters {
    /// Decrement `pending`, saturating at zero. Returns false when nothing
    /// was pending.
    fn ack(&self) -> bool {
        match self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => {
                self.drained.notify_waiters();
                true
            }
            Ok(_) => true,
            Err(_) => false,
        }
    }
}

/// Acknowledges its item on drop. An item dropped before `finish`
/// (worker cancelled mid-processing) counts as an error.
struct Ack {
    counters: Arc<QueueCounters>,
    finished: bool,
}

impl Ack {
    fn new(counters: Arc<QueueCounters>) -> Self {
        counters.dequeued.fetch_add(1, Ordering::Relaxed);
        Self {
            counters,
            finished: false,
        }
    }

    fn finish(mut self, ok: bool) {
        let counter = if ok {
            &self.counters.processed
        } else {
            &self.counters.errors
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.finished = true;
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        if !self.finished {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.ack();
    }
}

/// Bounded queue plus worker pool
pub struct FrameQueue {
    max_size: usize,
    num_workers: usize,
    tx: mpsc::Sender<FrameItem>,
    rx: Arc<Mutex<mpsc::Receiver<FrameItem>>>,
    counters: Arc<QueueCounters>,
    processor: Mutex<Option<FrameProcessorFn>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl FrameQueue {
    pub fn new(max_size: usize, num_workers: usize) -> Result<Self> {
        if max_size == 0 {
            return Err(Error::Validation("Queue max_size must be at least 1".to_string()));
        }
        let (tx, rx) = mpsc::channel(max_size);

        Ok(Self {
            max_size,
            num_workers,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            counters: Arc::new(QueueCounters::default()),
            processor: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_processor(max_size: usize, num_workers: usize, processor: FrameProcessorFn) -> Result<Self> {
        let mut queue = Self::new(max_size, num_workers)?;
        queue.processor = Mutex::new(Some(processor));
        Ok(queue)
    }

    pub async fn set_processor(&self, processor: FrameProcessorFn) {
        *self.processor.lock().await = Some(processor);
    }

    /// Current depth
    pub fn size(&self) -> usize {
        self.max_size - self.tx.capacity()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn is_full(&self) -> bool {
        self.tx.capacity() == 0
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn processed_count(&self) -> u64 {
        self.counters.processed.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Enqueue without waiting. Returns false (and counts a drop) when full.
    pub fn put(&self, item: FrameItem) -> bool {
        self.counters.pending.fetch_add(1, Ordering::AcqRel);

        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(item)) => {
                self.counters.ack();
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    source_id = %item.source_id,
                    dropped_total = dropped,
                    "Queue full, frame dropped"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(item)) => {
                self.counters.ack();
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(source_id = %item.source_id, "Queue closed, frame dropped");
                false
            }
        }
    }

    /// Dequeue for an external consumer, waiting up to `timeout`.
    ///
    /// Every returned item must be acknowledged with [`FrameQueue::task_done`].
    pub async fn get(&self, timeout: Duration) -> Option<FrameItem> {
        let mut rx = self.rx.lock().await;
        let item = tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()?;
        self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Acknowledge an item taken with [`FrameQueue::get`]
    pub fn task_done(&self) {
        if self.counters.ack() {
            self.counters.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::warn!("task_done called with no pending item");
        }
    }

    /// Spawn the worker pool. No-op when already running.
    pub async fn start_workers(&self) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if self.is_running() {
            return Ok(());
        }

        let processor = self
            .processor
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Config("Frame processor not set".to_string()))?;

        self.running.store(true, Ordering::Release);
        for worker_id in 0..self.num_workers {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                self.rx.clone(),
                self.counters.clone(),
                processor.clone(),
                self.running.clone(),
            )));
        }

        tracing::info!(workers = self.num_workers, max_size = self.max_size, "Queue workers started");
        Ok(())
    }

    /// Cancel all workers. Items mid-processing are abandoned but acknowledged.
    pub async fn stop_workers(&self) {
        let mut workers = self.workers.lock().await;
        self.running.store(false, Ordering::Release);

        for handle in workers.iter() {
            handle.abort();
        }
        for handle in workers.drain(..) {
            let _ = handle.await;
        }

        tracing::info!("Queue workers stopped");
    }

    /// Wait until every accepted item has been acknowledged.
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn wait_empty(&self, timeout: Option<Duration>) -> bool {
        let drained = async {
            loop {
                let notified = self.counters.drained.notified();
                if self.counters.pending.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };

        match timeout {
            Some(limit) => {
                let done = tokio::time::timeout(limit, drained).await.is_ok();
                if !done {
                    tracing::warn!(
                        pending = self.counters.pending.load(Ordering::Acquire),
                        "Timed out waiting for queue to drain"
                    );
                }
                done
            }
            None => {
                drained.await;
                true
            }
        }
    }

    pub async fn stats(&self) -> QueueStats {
        QueueStats {
            queue_size: self.size(),
            max_size: self.max_size,
            processed: self.counters.processed.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            dequeued: self.counters.dequeued.load(Ordering::Relaxed),
            workers: self.workers.lock().await.len(),
            running: self.is_running(),
        }
    }

    /// Reset the processed/error/drop counters
    pub fn clear(&self) {
        self.counters.processed.store(0, Ordering::Relaxed);
        self.counters.errors.store(0, Ordering::Relaxed);
        self.counters.dropped.store(0, Ordering::Relaxed);
        self.counters.dequeued.store(0, Ordering::Relaxed);
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<FrameItem>>>,
    counters: Arc<QueueCounters>,
    processor: FrameProcessorFn,
    running: Arc<AtomicBool>,
) {
    tracing::debug!(worker_id = worker_id, "Queue worker started");

    while running.load(Ordering::Acquire) {
        let item = {
            let mut rx = rx.lock().await;
            match tokio::time::timeout(WORKER_POLL_TIMEOUT, rx.recv()).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => continue,
            }
        };

        let ack = Ack::new(counters.clone());
        let source_id = item.source_id;

        match AssertUnwindSafe(processor(item)).catch_unwind().await {
            Ok(Ok(())) => ack.finish(true),
            Ok(Err(e)) => {
                tracing::error!(
                    worker_id = worker_id,
                    source_id = %source_id,
                    error = %e,
                    "Frame processing failed"
                );
                ack.finish(false);
            }
            Err(_) => {
                tracing::error!(
                    worker_id = worker_id,
                    source_id = %source_id,
                    "Frame processor panicked"
                );
                ack.finish(false);
            }
        }
    }

    tracing::debug!(worker_id = worker_id, "Queue worker finished");
}
