//! FrameProcessor - Queue Consumer
//!
//! ## Responsibilities
//!
//! - Analyse each dequeued frame with the vision provider
//! - Match the analysis against keyword alert rules
//! - Persist the frame, plus an annotated copy when enabled
//! - Record the result in the EventLogService
//!
//! ## Output layout
//!
//! `<frames_dir>/<source_id>_<unix_ms>.jpg` and
//! `<annotated_dir>/<source_id>_<unix_ms>_annotated.jpg`

use crate::ai_client::{AnalysisResult, VisionProvider};
use crate::error::{Error, Result};
use crate::event_log_service::{AnalysisEvent, EventLogService};
use crate::frame_annotation::{AnnotationInput, FrameAnnotator, MotionStatus};
use crate::frame_queue::{FrameItem, FrameProcessorFn, MotionSnapshot};
use crate::keyword_detector::KeywordDetector;
use chrono::Utc;
use futures::FutureExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct FrameProcessor {
    vision: Arc<VisionProvider>,
    event_log: Arc<EventLogService>,
    alerts: Arc<KeywordDetector>,
    /// None disables overlays
    annotator: Option<Arc<FrameAnnotator>>,
    frames_dir: PathBuf,
    annotated_dir: PathBuf,
}

impl FrameProcessor {
    pub fn new(
        vision: Arc<VisionProvider>,
        event_log: Arc<EventLogService>,
        alerts: Arc<KeywordDetector>,
        annotator: Option<Arc<FrameAnnotator>>,
        frames_dir: impl Into<PathBuf>,
        annotated_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            vision,
            event_log,
            alerts,
            annotator,
            frames_dir: frames_dir.into(),
            annotated_dir: annotated_dir.into(),
        }
    }

    /// Adapt into the queue's processor signature
    pub fn into_processor_fn(self: Arc<Self>) -> FrameProcessorFn {
        Arc::new(move |item| {
            let processor = self.clone();
            async move { processor.process(item).await.map(|_| ()) }.boxed()
        })
    }

    /// Analyse, persist and log one frame. Returns the event id.
    pub async fn process(&self, item: FrameItem) -> Result<u64> {
        let analysis = self.vision.analyze(&item.data).await?;
        let alerts = self
            .alerts
            .detect(&analysis.description, &analysis.keywords, item.source_id)
            .await;

        let stem = format!("{}_{}", item.source_id, item.timestamp.timestamp_millis());
        let frame_path = self.frames_dir.join(format!("{}.jpg", stem));
        write_file(&frame_path, &item.data).await?;

        let annotated_path = match &self.annotator {
            Some(annotator) => {
                let path = self.annotated_dir.join(format!("{}_annotated.jpg", stem));
                self.write_annotated(annotator.clone(), &item, &analysis, &path).await
            }
            None => None,
        };

        let event = AnalysisEvent {
            event_id: 0,
            source_id: item.source_id,
            captured_at: item.timestamp,
            frame_path,
            annotated_path,
            description: analysis.description,
            keywords: analysis.keywords,
            confidence: analysis.confidence,
            provider: analysis.provider,
            model: analysis.model,
            processing_time_ms: analysis.processing_time_ms,
            motion_score: item.motion.as_ref().map(|m| m.score),
            alerts,
            created_at: Utc::now(),
        };
        let keywords = event.keywords.len();
        let alert_count = event.alerts.len();
        let event_id = self.event_log.add_event(event).await;

        tracing::info!(
            source_id = %item.source_id,
            event_id = event_id,
            keywords = keywords,
            alerts = alert_count,
            "Frame processed"
        );
        Ok(event_id)
    }

    /// Render and write the overlay. Failures are logged, never returned.
    async fn write_annotated(
        &self,
        annotator: Arc<FrameAnnotator>,
        item: &FrameItem,
        analysis: &AnalysisResult,
        path: &Path,
    ) -> Option<PathBuf> {
        let jpeg = item.data.clone();
        let motion = item.motion.clone();
        let keywords = analysis.keywords.clone();
        let confidence = analysis.confidence;
        let provider = analysis.provider.clone();
        let model = analysis.model.clone();

        let rendered = tokio::task::spawn_blocking(move || {
            let input = AnnotationInput {
                motion_score: motion.as_ref().map(|m| m.score),
                motion_threshold: motion.as_ref().map(|m| m.threshold),
                motion_mask: motion.as_ref().and_then(|m| m.mask.as_ref()),
                motion_status: motion_status(motion.as_ref()),
                keywords: &keywords,
                confidence,
                provider: Some(&provider),
                model: Some(&model),
            };
            annotator.render(&jpeg, &input)
        })
        .await;

        let bytes = match rendered {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::warn!(source_id = %item.source_id, "Annotation skipped");
                return None;
            }
            Err(e) => {
                tracing::error!(source_id = %item.source_id, error = %e, "Annotation task failed");
                return None;
            }
        };

        match write_file(path, &bytes).await {
            Ok(()) => Some(path.to_path_buf()),
            Err(e) => {
                tracing::error!(
                    source_id = %item.source_id,
                    path = %path.display(),
                    error = %e,
                    "Failed to write annotated frame"
                );
                None
            }
        }
    }
}

fn motion_status(motion: Option<&MotionSnapshot>) -> MotionStatus {
    match motion {
        Some(m) if m.score >= m.threshold => MotionStatus::Motion,
        Some(_) => MotionStatus::NoMotion,
        None => MotionStatus::Unknown,
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| Error::Internal(format!("Failed to write {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_client::{ProviderKind, VisionSettings};
    use crate::frame_annotation::AnnotationStyle;
    use crate::keyword_detector::AlertRule;
    use axum::{routing::post, Json, Router};
    use image::codecs::jpeg::JpegEncoder;
    use image::{GrayImage, Rgb, RgbImage};
    use serde_json::json;
    use uuid::Uuid;

    async fn mock_vision(reply: &'static str) -> Arc<VisionProvider> {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move || async move {
                Json(json!({ "choices": [{ "message": { "content": reply } }] }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let settings = VisionSettings {
            provider: ProviderKind::LmStudio,
            lmstudio_api_url: format!("http://{}/v1", addr),
            ..Default::default()
        };
        Arc::new(VisionProvider::from_config(&settings).unwrap())
    }

    fn item(motion: Option<MotionSnapshot>) -> FrameItem {
        let frame = RgbImage::from_pixel(320, 240, Rgb([80, 80, 80]));
        let mut data = Vec::new();
        JpegEncoder::new_with_quality(&mut data, 85).encode_image(&frame).unwrap();
        FrameItem {
            source_id: Uuid::new_v4(),
            data,
            timestamp: Utc::now(),
            motion,
        }
    }

    #[tokio::test]
    async fn test_process_writes_frame_and_event() {
        let dir = tempfile::tempdir().unwrap();
        let vision = mock_vision(r#"{"description": "Corredor vazio", "keywords": ["corredor"], "confidence": 0.7}"#).await;
        let log = Arc::new(EventLogService::new(10));
        let processor = FrameProcessor::new(
            vision,
            log.clone(),
            Arc::new(KeywordDetector::new()),
            None,
            dir.path().join("frames"),
            dir.path().join("annotated"),
        );

        let item = item(None);
        let expected = dir.path().join("frames").join(format!(
            "{}_{}.jpg",
            item.source_id,
            item.timestamp.timestamp_millis()
        ));
        let data = item.data.clone();
        let event_id = processor.process(item).await.unwrap();

        assert_eq!(event_id, 1);
        assert_eq!(std::fs::read(&expected).unwrap(), data);
        let events = log.get_latest(1).await;
        assert_eq!(events[0].description, "Corredor vazio");
        assert_eq!(events[0].keywords, vec!["corredor"]);
        assert!(events[0].annotated_path.is_none());
        assert!(!dir.path().join("annotated").exists());
    }

    #[tokio::test]
    async fn test_process_writes_annotated_copy() {
        let dir = tempfile::tempdir().unwrap();
        let vision = mock_vision(r#"{"description": "Carro", "keywords": ["carro"]}"#).await;
        let log = Arc::new(EventLogService::new(10));
        let annotator = Arc::new(FrameAnnotator::new(AnnotationStyle::default(), None));
        let processor = FrameProcessor::new(
            vision,
            log.clone(),
            Arc::new(KeywordDetector::new()),
            Some(annotator),
            dir.path().join("frames"),
            dir.path().join("annotated"),
        );

        let motion = MotionSnapshot {
            score: 40.0,
            threshold: 10.0,
            mask: Some(GrayImage::from_pixel(320, 240, image::Luma([255]))),
        };
        processor.process(item(Some(motion))).await.unwrap();

        let event = log.get_latest(1).await.remove(0);
        let annotated = event.annotated_path.unwrap();
        assert!(annotated.to_string_lossy().ends_with("_annotated.jpg"));
        let bytes = std::fs::read(annotated).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(event.motion_score, Some(40.0));
    }

    #[tokio::test]
    async fn test_undecodable_frame_skips_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let vision = mock_vision("apenas texto livre").await;
        let log = Arc::new(EventLogService::new(10));
        let annotator = Arc::new(FrameAnnotator::new(AnnotationStyle::default(), None));
        let processor = FrameProcessor::new(
            vision,
            log.clone(),
            Arc::new(KeywordDetector::new()),
            Some(annotator),
            dir.path().join("frames"),
            dir.path().join("annotated"),
        );

        let mut broken = item(None);
        broken.data = b"not a jpeg".to_vec();
        processor.process(broken).await.unwrap();

        let event = log.get_latest(1).await.remove(0);
        assert!(event.annotated_path.is_none());
        assert_eq!(event.description, "apenas texto livre");
    }

    #[tokio::test]
    async fn test_alert_matches_recorded_on_event() {
        let dir = tempfile::tempdir().unwrap();
        let vision = mock_vision(r#"{"description": "Pessoa com mochila no portão", "keywords": ["pessoa", "mochila"]}"#).await;
        let log = Arc::new(EventLogService::new(10));
        let mut scoped = AlertRule::new("other camera", &["pessoa"]);
        scoped.source_ids = Some(vec![Uuid::new_v4()]);
        let alerts = KeywordDetector::with_rules(vec![
            AlertRule::new("intrusion", &["Pessoa", "arma"]),
            AlertRule::new("vehicles", &["carro"]),
            scoped,
        ])
        .await
        .unwrap();
        let processor = FrameProcessor::new(
            vision,
            log.clone(),
            Arc::new(alerts),
            None,
            dir.path().join("frames"),
            dir.path().join("annotated"),
        );

        processor.process(item(None)).await.unwrap();
        processor.process(item(None)).await.unwrap();

        let events = log.get_latest(2).await;
        // Newest first; the second frame falls inside the rule's cooldown
        assert!(events[0].alerts.is_empty());
        let fired = &events[1].alerts;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule_name, "intrusion");
        assert_eq!(fired[0].keywords_matched, vec!["Pessoa"]);
    }

    #[test]
    fn test_motion_status_from_snapshot() {
        let snapshot = |score| MotionSnapshot {
            score,
            threshold: 10.0,
            mask: None,
        };
        assert_eq!(motion_status(Some(&snapshot(12.0))), MotionStatus::Motion);
        assert_eq!(motion_status(Some(&snapshot(3.0))), MotionStatus::NoMotion);
        assert_eq!(motion_status(None), MotionStatus::Unknown);
    }
}
