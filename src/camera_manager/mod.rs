//! CameraManager - Source Registry
//!
//! ## Responsibilities
//!
//! - Own every source connection (FrameGrabber) by id
//! - Start/stop single sources or all enabled ones
//! - Wire accepted frames into the shared FrameQueue
//! - Hot-reload source configs
//!
//! Frames from a source are dropped at this boundary while no queue is set.

use crate::error::{Error, Result};
use crate::frame_grabber::{
    CaptureSettings, FrameBackend, FrameCallback, FrameGrabber, SourceConfig, SourceId,
    StatusSnapshot,
};
use crate::frame_queue::FrameQueue;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use tokio::sync::RwLock;

/// Queue slot read from capture callbacks
type QueueSlot = Arc<StdRwLock<Option<Arc<FrameQueue>>>>;

pub struct CameraManager {
    grabbers: RwLock<HashMap<SourceId, Arc<FrameGrabber>>>,
    queue: QueueSlot,
    backend: Arc<dyn FrameBackend>,
    settings: CaptureSettings,
}

impl CameraManager {
    pub fn new(backend: Arc<dyn FrameBackend>, settings: CaptureSettings) -> Self {
        Self {
            grabbers: RwLock::new(HashMap::new()),
            queue: Arc::new(StdRwLock::new(None)),
            backend,
            settings,
        }
    }

    pub fn set_frame_queue(&self, queue: Arc<FrameQueue>) {
        *self.queue.write().unwrap_or_else(PoisonError::into_inner) = Some(queue);
    }

    pub fn frame_queue(&self) -> Option<Arc<FrameQueue>> {
        self.queue.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn on_frame_callback(&self) -> FrameCallback {
        let slot = self.queue.clone();
        Arc::new(move |item| {
            let queue = slot.read().unwrap_or_else(PoisonError::into_inner).clone();
            match queue {
                Some(queue) => {
                    let source_id = item.source_id;
                    if !queue.put(item) {
                        tracing::debug!(source_id = %source_id, "Frame not queued");
                    }
                }
                None => {
                    tracing::debug!(source_id = %item.source_id, "No frame queue set, frame dropped");
                }
            }
        })
    }

    async fn grabber(&self, id: SourceId) -> Result<Arc<FrameGrabber>> {
        self.grabbers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Source not found: {}", id)))
    }

    /// Register a source. Returns false when the id is already registered.
    pub async fn add_source(&self, config: SourceConfig) -> Result<bool> {
        let mut grabbers = self.grabbers.write().await;
        if grabbers.contains_key(&config.id) {
            return Ok(false);
        }

        let id = config.id;
        let name = config.name.clone();
        let grabber = FrameGrabber::new(
            config,
            self.backend.clone(),
            self.settings.clone(),
            Some(self.on_frame_callback()),
        )?;
        grabbers.insert(id, Arc::new(grabber));

        tracing::info!(source_id = %id, name = %name, "Source added");
        Ok(true)
    }

    /// Disconnect and drop a source. Returns false for an unknown id.
    pub async fn remove_source(&self, id: SourceId) -> bool {
        let removed = self.grabbers.write().await.remove(&id);
        match removed {
            Some(grabber) => {
                grabber.disconnect().await;
                tracing::info!(source_id = %id, "Source removed");
                true
            }
            None => false,
        }
    }

    pub async fn start_source(&self, id: SourceId) -> Result<()> {
        self.grabber(id).await?.start().await
    }

    pub async fn stop_source(&self, id: SourceId) -> Result<()> {
        self.grabber(id).await?.stop().await;
        Ok(())
    }

    /// Start every enabled source. Failures are logged; returns how many started.
    pub async fn start_all(&self) -> usize {
        let grabbers: Vec<_> = self.grabbers.read().await.values().cloned().collect();
        let mut started = 0;

        for grabber in grabbers {
            if !grabber.config().await.enabled {
                continue;
            }
            match grabber.start().await {
                Ok(()) => started += 1,
                Err(e) => {
                    tracing::error!(
                        source_id = %grabber.id(),
                        error = %e,
                        "Failed to start source"
                    );
                }
            }
        }

        tracing::info!(started = started, "Sources started");
        started
    }

    /// Stop and disconnect every source
    pub async fn stop_all(&self) {
        let grabbers: Vec<_> = self.grabbers.read().await.values().cloned().collect();
        for grabber in grabbers {
            grabber.disconnect().await;
        }
        tracing::info!("All sources stopped");
    }

    pub async fn get_status(&self, id: SourceId) -> Option<StatusSnapshot> {
        let grabber = self.grabbers.read().await.get(&id).cloned()?;
        Some(grabber.snapshot().await)
    }

    pub async fn list_status(&self) -> Vec<StatusSnapshot> {
        let grabbers: Vec<_> = self.grabbers.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(grabbers.len());
        for grabber in grabbers {
            snapshots.push(grabber.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub async fn get_config(&self, id: SourceId) -> Option<SourceConfig> {
        let grabber = self.grabbers.read().await.get(&id).cloned()?;
        Some(grabber.config().await)
    }

    pub async fn list_configs(&self) -> Vec<SourceConfig> {
        let grabbers: Vec<_> = self.grabbers.read().await.values().cloned().collect();
        let mut configs = Vec::with_capacity(grabbers.len());
        for grabber in grabbers {
            configs.push(grabber.config().await);
        }
        configs
    }

    /// Hot-swap a source config. True when live parameters changed.
    pub async fn update_config(&self, id: SourceId, mut config: SourceConfig) -> Result<bool> {
        let grabber = self.grabber(id).await?;
        config.id = id;
        let changed = grabber.update_config(config).await?;
        tracing::info!(source_id = %id, changed = changed, "Source config updated");
        Ok(changed)
    }

    pub async fn capture_single_frame(&self, id: SourceId) -> Result<Option<Vec<u8>>> {
        self.grabber(id).await?.capture_single_frame().await
    }

    pub async fn len(&self) -> usize {
        self.grabbers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.grabbers.read().await.is_empty()
    }
}
