//! API Routes

use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::event_log_service::AnalysisEvent;
use crate::frame_grabber::{SourceConfig, SourceId, StatusSnapshot};
use crate::keyword_detector::RuleStats;
use crate::models::{ApiResponse, ConfigUpdateResponse, DecoderTotals, MotionTotals, StatsResponse};
use crate::source_loader::SourceEntry;
use crate::state::AppState;

const DEFAULT_EVENT_LIMIT: usize = 50;
const MAX_EVENT_LIMIT: usize = 1000;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Stats
        .route("/api/v1/health", get(super::health_check))
        .route("/api/v1/stats", get(get_stats))
        // Sources
        .route("/api/v1/sources", get(list_sources))
        .route("/api/v1/sources/:id/status", get(get_source_status))
        .route(
            "/api/v1/sources/:id/config",
            get(get_source_config).put(update_source_config),
        )
        .route("/api/v1/sources/:id/start", post(start_source))
        .route("/api/v1/sources/:id/stop", post(stop_source))
        .route("/api/v1/sources/:id/snapshot", get(get_source_snapshot))
        .route("/api/v1/sources/:id/events", get(list_source_events))
        // Events
        .route("/api/v1/events", get(list_events))
        // Alerts
        .route("/api/v1/alerts/rules", get(list_alert_rules))
        .with_state(state)
}

// ========================================
// Stats
// ========================================

async fn get_stats(State(state): State<AppState>) -> Json<ApiResponse<StatsResponse>> {
    let snapshots = state.manager.list_status().await;
    let configs = state.manager.list_configs().await;

    let stats = StatsResponse {
        sources_total: configs.len(),
        sources_enabled: configs.iter().filter(|c| c.enabled).count(),
        events_total: state.event_log.count().await,
        queue: state.queue.stats().await,
        motion: MotionTotals::from_snapshots(&snapshots),
        decoder: DecoderTotals::from_snapshots(&snapshots),
    };

    Json(ApiResponse::success(stats))
}

// ========================================
// Source Handlers
// ========================================

async fn list_sources(State(state): State<AppState>) -> Json<ApiResponse<Vec<StatusSnapshot>>> {
    Json(ApiResponse::success(state.manager.list_status().await))
}

async fn get_source_status(
    State(state): State<AppState>,
    Path(id): Path<SourceId>,
) -> Result<Json<ApiResponse<StatusSnapshot>>> {
    let snapshot = state
        .manager
        .get_status(id)
        .await
        .ok_or_else(|| not_found(id))?;
    Ok(Json(ApiResponse::success(snapshot)))
}

async fn get_source_config(
    State(state): State<AppState>,
    Path(id): Path<SourceId>,
) -> Result<Json<ApiResponse<SourceConfig>>> {
    let config = state
        .manager
        .get_config(id)
        .await
        .ok_or_else(|| not_found(id))?;
    Ok(Json(ApiResponse::success(config)))
}

/// Partial update: fields left out keep their current value
async fn update_source_config(
    State(state): State<AppState>,
    Path(id): Path<SourceId>,
    Json(update): Json<SourceEntry>,
) -> Result<Json<ApiResponse<ConfigUpdateResponse>>> {
    let current = state
        .manager
        .get_config(id)
        .await
        .ok_or_else(|| not_found(id))?;
    let updated = state.manager.update_config(id, update.apply_to(&current)).await?;
    Ok(Json(ApiResponse::success(ConfigUpdateResponse { updated })))
}

async fn start_source(
    State(state): State<AppState>,
    Path(id): Path<SourceId>,
) -> Result<Json<ApiResponse<StatusSnapshot>>> {
    state.manager.start_source(id).await?;
    tracing::info!(source_id = %id, "Source started via API");
    source_snapshot(&state, id).await
}

async fn stop_source(
    State(state): State<AppState>,
    Path(id): Path<SourceId>,
) -> Result<Json<ApiResponse<StatusSnapshot>>> {
    state.manager.stop_source(id).await?;
    tracing::info!(source_id = %id, "Source stopped via API");
    source_snapshot(&state, id).await
}

/// One fresh JPEG from the source, for previews
async fn get_source_snapshot(
    State(state): State<AppState>,
    Path(id): Path<SourceId>,
) -> Result<impl IntoResponse> {
    let jpeg = state
        .manager
        .capture_single_frame(id)
        .await?
        .ok_or_else(|| Error::Capture(format!("No valid frame from source {}", id)))?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg))
}

// ========================================
// Event Handlers
// ========================================

#[derive(Debug, Deserialize)]
struct EventQuery {
    limit: Option<usize>,
}

impl EventQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, MAX_EVENT_LIMIT)
    }
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Json<ApiResponse<Vec<AnalysisEvent>>> {
    let events = state.event_log.get_latest(query.limit()).await;
    Json(ApiResponse::success(events))
}

async fn list_alert_rules(State(state): State<AppState>) -> Json<ApiResponse<Vec<RuleStats>>> {
    Json(ApiResponse::success(state.alerts.all_stats().await))
}

async fn list_source_events(
    State(state): State<AppState>,
    Path(id): Path<SourceId>,
    Query(query): Query<EventQuery>,
) -> Result<Json<ApiResponse<Vec<AnalysisEvent>>>> {
    if state.manager.get_status(id).await.is_none() {
        return Err(not_found(id));
    }
    let events = state.event_log.get_by_source(id, query.limit()).await;
    Ok(Json(ApiResponse::success(events)))
}

// ========================================
// Helpers
// ========================================

fn not_found(id: SourceId) -> Error {
    Error::NotFound(format!("Source not found: {}", id))
}

async fn source_snapshot(state: &AppState, id: SourceId) -> Result<Json<ApiResponse<StatusSnapshot>>> {
    let snapshot = state
        .manager
        .get_status(id)
        .await
        .ok_or_else(|| not_found(id))?;
    Ok(Json(ApiResponse::success(snapshot)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_client::{ProviderKind, VisionProvider, VisionSettings};
    use crate::camera_manager::CameraManager;
    use crate::event_log_service::EventLogService;
    use crate::frame_grabber::testing::{textured, ScriptedBackend};
    use crate::frame_grabber::{CaptureSettings, GrabOutcome, SourceStatus};
    use crate::frame_queue::FrameQueue;
    use crate::keyword_detector::{AlertRule, KeywordDetector};
    use crate::state::AppConfig;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use uuid::Uuid;

    struct TestServer {
        base: String,
        state: AppState,
        client: reqwest::Client,
    }

    impl TestServer {
        async fn get(&self, path: &str) -> (u16, Value) {
            let resp = self.client.get(format!("{}{}", self.base, path)).send().await.unwrap();
            let status = resp.status().as_u16();
            (status, resp.json().await.unwrap_or(Value::Null))
        }

        async fn post(&self, path: &str) -> (u16, Value) {
            let resp = self.client.post(format!("{}{}", self.base, path)).send().await.unwrap();
            let status = resp.status().as_u16();
            (status, resp.json().await.unwrap_or(Value::Null))
        }

        async fn put(&self, path: &str, body: Value) -> (u16, Value) {
            let resp = self
                .client
                .put(format!("{}{}", self.base, path))
                .json(&body)
                .send()
                .await
                .unwrap();
            let status = resp.status().as_u16();
            (status, resp.json().await.unwrap_or(Value::Null))
        }
    }

    async fn server() -> TestServer {
        let settings = CaptureSettings {
            max_consecutive_errors: 3,
            reconnect_attempts: 1,
            reconnect_delay: Duration::from_millis(10),
            tick: Duration::from_millis(5),
            error_backoff: Duration::from_millis(10),
            ..CaptureSettings::default()
        };
        let backend = ScriptedBackend::new(vec![], GrabOutcome::Frame(textured(3)));
        let manager = Arc::new(CameraManager::new(Arc::new(backend), settings));
        let queue = Arc::new(FrameQueue::new(10, 1).unwrap());
        manager.set_frame_queue(queue.clone());

        // Nothing listens on the discard port, so the provider is unhealthy
        let vision = VisionProvider::from_config(&VisionSettings {
            provider: ProviderKind::LmStudio,
            lmstudio_api_url: "http://127.0.0.1:9/v1".to_string(),
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();

        let state = AppState {
            config: AppConfig::from_lookup(|_| None).unwrap(),
            manager,
            queue,
            vision: Arc::new(vision),
            event_log: Arc::new(EventLogService::new(100)),
            alerts: Arc::new(KeywordDetector::new()),
            started_at: Instant::now(),
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestServer {
            base: format!("http://{}", addr),
            state,
            client: reqwest::Client::new(),
        }
    }

    async fn add_source(server: &TestServer, name: &str) -> SourceId {
        let config = SourceConfig::new(name, "rtsp://test/stream");
        let id = config.id;
        server.state.manager.add_source(config).await.unwrap();
        id
    }

    fn event(source_id: SourceId) -> AnalysisEvent {
        let now = chrono::Utc::now();
        AnalysisEvent {
            event_id: 0,
            source_id,
            captured_at: now,
            frame_path: "frames/a.jpg".into(),
            annotated_path: None,
            description: "Pessoa na entrada".to_string(),
            keywords: vec!["pessoa".to_string()],
            confidence: Some(0.9),
            provider: "lmstudio".to_string(),
            model: "local-model".to_string(),
            processing_time_ms: 120,
            motion_score: Some(33.0),
            alerts: vec![],
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_health_reports_provider() {
        let server = server().await;
        let (status, body) = server.get("/api/v1/health").await;

        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["vision"]["provider"], "lmstudio");
        assert_eq!(body["vision"]["healthy"], false);
    }

    #[tokio::test]
    async fn test_source_status_and_not_found() {
        let server = server().await;
        let id = add_source(&server, "front").await;

        let (status, body) = server.get(&format!("/api/v1/sources/{}/status", id)).await;
        assert_eq!(status, 200);
        assert_eq!(body["ok"], true);
        assert_eq!(body["data"]["name"], "front");
        assert_eq!(body["data"]["status"], "disconnected");

        let (status, body) = server
            .get(&format!("/api/v1/sources/{}/status", Uuid::new_v4()))
            .await;
        assert_eq!(status, 404);
        assert_eq!(body["error_code"], "NOT_FOUND");

        let (status, _) = server.get("/api/v1/sources/not-a-uuid/status").await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let server = server().await;
        let id = add_source(&server, "front").await;

        let (status, body) = server.post(&format!("/api/v1/sources/{}/start", id)).await;
        assert_eq!(status, 200);
        assert_eq!(body["data"]["status"], "capturing");

        let (status, body) = server.post(&format!("/api/v1/sources/{}/stop", id)).await;
        assert_eq!(status, 200);
        assert_eq!(body["data"]["status"], "connected");

        server.state.manager.stop_all().await;
        assert_eq!(
            server.state.manager.get_status(id).await.unwrap().status,
            SourceStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_config_update() {
        let server = server().await;
        let id = add_source(&server, "front").await;
        let path = format!("/api/v1/sources/{}/config", id);

        let (status, body) = server.put(&path, json!({"motion_threshold": 150.0})).await;
        assert_eq!(status, 400);
        assert_eq!(body["error_code"], "VALIDATION_ERROR");

        let (status, body) = server.put(&path, json!({"sensitivity": "high"})).await;
        assert_eq!(status, 200);
        assert_eq!(body["data"]["updated"], true);

        let (_, body) = server.get(&path).await;
        assert_eq!(body["data"]["sensitivity"], "high");
        assert_eq!(body["data"]["name"], "front");
    }

    #[tokio::test]
    async fn test_events_listing() {
        let server = server().await;
        let id = add_source(&server, "front").await;
        for _ in 0..3 {
            server.state.event_log.add_event(event(id)).await;
        }
        server.state.event_log.add_event(event(Uuid::new_v4())).await;

        let (_, body) = server.get("/api/v1/events?limit=2").await;
        let events = body["data"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event_id"], 4);

        let (status, body) = server.get(&format!("/api/v1/sources/{}/events", id)).await;
        assert_eq!(status, 200);
        assert_eq!(body["data"].as_array().unwrap().len(), 3);

        let (status, _) = server
            .get(&format!("/api/v1/sources/{}/events", Uuid::new_v4()))
            .await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn test_alert_rules_listing() {
        let server = server().await;
        let (_, body) = server.get("/api/v1/alerts/rules").await;
        assert!(body["data"].as_array().unwrap().is_empty());

        let mut rule = AlertRule::new("Intruder", &["person", "pessoa"]);
        rule.cooldown_secs = 60;
        server.state.alerts.add_rule(rule).await.unwrap();

        let (status, body) = server.get("/api/v1/alerts/rules").await;
        assert_eq!(status, 200);
        let rules = body["data"].as_array().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0]["name"], "Intruder");
        assert_eq!(rules[0]["keywords_count"], 2);
        assert_eq!(rules[0]["cooldown_secs"], 60);
        assert!(rules[0]["last_alert"].is_null());
    }

    #[tokio::test]
    async fn test_stats() {
        let server = server().await;
        add_source(&server, "a").await;
        let mut disabled = SourceConfig::new("b", "rtsp://test/b");
        disabled.enabled = false;
        server.state.manager.add_source(disabled).await.unwrap();
        server.state.event_log.add_event(event(Uuid::new_v4())).await;

        let (status, body) = server.get("/api/v1/stats").await;
        assert_eq!(status, 200);
        let data = &body["data"];
        assert_eq!(data["sources_total"], 2);
        assert_eq!(data["sources_enabled"], 1);
        assert_eq!(data["events_total"], 1);
        assert_eq!(data["queue"]["max_size"], 10);
        assert_eq!(data["motion"]["frames_total"], 0);
        assert_eq!(data["decoder"]["total_errors"], 0);
    }

    #[tokio::test]
    async fn test_snapshot_returns_jpeg() {
        let server = server().await;
        let id = add_source(&server, "front").await;

        let resp = server
            .client
            .get(format!("{}/api/v1/sources/{}/snapshot", server.base, id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(resp.headers()[reqwest::header::CONTENT_TYPE], "image/jpeg");
        let bytes = resp.bytes().await.unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
