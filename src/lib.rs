//! CamOps Camserver Library
//!
//! Multi-source camera capture with motion filtering and vision analysis.
//!
//! ## Architecture (10 Components)
//!
//! 1. MotionDetector - Frame-to-frame motion scoring
//! 2. FrameGrabber - Per-source capture loop (connect, grab, score, deliver)
//! 3. FrameQueue - Bounded buffer with a worker pool
//! 4. CameraManager - Registry of sources, wiring frames into the queue
//! 5. FrameAnnotation - Motion/analysis overlays on frame copies
//! 6. AIClient - Vision LLM providers
//! 7. FrameProcessor - Queue consumer (analyse, persist, log)
//! 8. KeywordDetector - Keyword alert rules over analysis results
//! 9. EventLogService - Recent analysis events (ring buffer)
//! 10. WebAPI - Status and control endpoints
//!
//! ## Data flow
//!
//! FrameGrabber -> MotionDetector -> FrameQueue -> FrameProcessor
//! -> (AIClient, KeywordDetector, FrameAnnotation) -> EventLogService

pub mod ai_client;
pub mod camera_manager;
pub mod event_log_service;
pub mod frame_annotation;
pub mod frame_grabber;
pub mod frame_processor;
pub mod frame_queue;
pub mod keyword_detector;
pub mod motion_detector;
pub mod source_loader;
pub mod web_api;
pub mod models;
pub mod error;
pub mod state;

pub use error::{Error, Result};
pub use state::AppState;
