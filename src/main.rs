//! CamOps Camserver
//!
//! Main entry point: load configuration and sources, start capture and the
//! analysis workers, serve the HTTP API until Ctrl-C.

use camops_camserver::{
    ai_client::VisionProvider,
    camera_manager::CameraManager,
    event_log_service::EventLogService,
    frame_annotation::{load_font, FrameAnnotator},
    frame_grabber::FfmpegBackend,
    frame_processor::FrameProcessor,
    frame_queue::FrameQueue,
    keyword_detector::{load_rules, KeywordDetector},
    source_loader::load_sources,
    state::{AppConfig, AppState},
    web_api,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time allowed for queued frames to finish on shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    let default_filter = std::env::var("LOG_LEVEL")
        .map(|level| format!("camops_camserver={},tower_http={}", level, level))
        .unwrap_or_else(|_| "camops_camserver=info,tower_http=info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting CamOps Camserver v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::from_env()?;
    tracing::info!(
        sources_file = %config.sources_file.display(),
        frames_dir = %config.frames_dir.display(),
        provider = %config.vision.provider,
        max_queue_size = config.max_queue_size,
        queue_workers = config.queue_workers,
        "Configuration loaded"
    );

    tokio::fs::create_dir_all(&config.frames_dir).await?;
    if config.annotation_enabled {
        tokio::fs::create_dir_all(&config.annotated_dir).await?;
    }

    // Decoder backend
    let backend = Arc::new(FfmpegBackend::new(config.ffmpeg_settings()));
    match backend.check_ffmpeg().await {
        Ok(version) => tracing::info!(version = %version, "ffmpeg available"),
        Err(e) => tracing::warn!(error = %e, "ffmpeg unavailable, sources will fail to connect"),
    }

    // Analysis pipeline
    let vision = Arc::new(VisionProvider::from_config(&config.vision)?);
    let event_log = Arc::new(EventLogService::new(config.event_log_capacity));

    let annotator = if config.annotation_enabled {
        let font = load_font(config.annotation_font_path.as_deref());
        Some(Arc::new(FrameAnnotator::new(config.annotation_style, font)))
    } else {
        None
    };

    let rules = load_rules(&config.alert_rules_file).await?;
    let alerts = Arc::new(KeywordDetector::with_rules(rules).await?);
    tracing::info!(
        rules = alerts.len().await,
        path = %config.alert_rules_file.display(),
        "Alert rules loaded"
    );

    let processor = Arc::new(FrameProcessor::new(
        vision.clone(),
        event_log.clone(),
        alerts.clone(),
        annotator,
        config.frames_dir.clone(),
        config.annotated_dir.clone(),
    ));
    let queue = Arc::new(FrameQueue::with_processor(
        config.max_queue_size,
        config.queue_workers,
        processor.into_processor_fn(),
    )?);
    queue.start_workers().await?;
    tracing::info!(workers = config.queue_workers, "FrameQueue started");

    // Sources
    let manager = Arc::new(CameraManager::new(backend, config.capture_settings()));
    manager.set_frame_queue(queue.clone());

    let sources = load_sources(&config.sources_file, &config.source_defaults()).await?;
    for source in sources {
        let id = source.id;
        match manager.add_source(source).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(source_id = %id, "Duplicate source skipped"),
            Err(e) => tracing::error!(source_id = %id, error = %e, "Failed to add source"),
        }
    }
    let started = manager.start_all().await;
    tracing::info!(
        sources = manager.len().await,
        started = started,
        "CameraManager initialized"
    );

    let state = AppState {
        config: config.clone(),
        manager: manager.clone(),
        queue: queue.clone(),
        vision,
        event_log,
        alerts,
        started_at: Instant::now(),
    };

    let app = web_api::create_router(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Shutdown: stop producers, drain, stop consumers
    tracing::info!("Shutting down");
    manager.stop_all().await;
    if !queue.wait_empty(Some(DRAIN_TIMEOUT)).await {
        tracing::warn!(remaining = queue.size(), "Queue not drained before shutdown");
    }
    queue.stop_workers().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
