//! Application state
//!
//! Configuration read from the environment and the shared components
//! handed to every HTTP handler.

use crate::ai_client::{ProviderKind, VisionProvider, VisionSettings};
use crate::camera_manager::CameraManager;
use crate::error::{Error, Result};
use crate::event_log_service::EventLogService;
use crate::frame_annotation::{parse_rgb, AnnotationStyle};
use crate::frame_grabber::{CaptureSettings, FfmpegSettings};
use crate::frame_queue::FrameQueue;
use crate::keyword_detector::KeywordDetector;
use crate::source_loader::SourceDefaults;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Smallest queue accepted from configuration
const MIN_QUEUE_SIZE: usize = 10;

/// Added to GRAB_TIMEOUT_SECS for the ffmpeg process deadline
const FFMPEG_DEADLINE_SLACK_SECS: u64 = 5;

/// Added again on top of the process deadline for the capture loop's own limit
const GRAB_DEADLINE_SLACK_SECS: u64 = 5;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// JSON array of source records
    pub sources_file: PathBuf,
    /// JSON array of keyword alert rules
    pub alert_rules_file: PathBuf,
    pub frames_dir: PathBuf,
    pub annotated_dir: PathBuf,
    /// Default capture interval for sources that omit one
    pub frame_interval_secs: u64,
    pub max_queue_size: usize,
    pub queue_workers: usize,
    pub motion_enabled: bool,
    pub motion_threshold: f32,
    pub rtsp_transport: String,
    pub max_consecutive_errors: u32,
    pub reconnect_attempts: u32,
    pub reconnect_delay_secs: u64,
    pub grab_timeout_secs: u64,
    /// Set to dump motion scoring stages as PNGs under this directory
    pub motion_debug_dir: Option<PathBuf>,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub vision: VisionSettings,
    pub annotation_enabled: bool,
    pub annotation_style: AnnotationStyle,
    /// None searches the usual DejaVuSans locations
    pub annotation_font_path: Option<PathBuf>,
    pub event_log_capacity: usize,
}

impl AppConfig {
    /// Read configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`; unset keys take their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = VisionSettings::default();

        let vision = VisionSettings {
            provider: env.parse("LLM_PROVIDER", ProviderKind::OpenAi)?,
            openai_api_key: env.optional("OPENAI_API_KEY"),
            openai_model: env.string("OPENAI_MODEL", &defaults.openai_model),
            anthropic_api_key: env.optional("ANTHROPIC_API_KEY"),
            anthropic_model: env.string("ANTHROPIC_MODEL", &defaults.anthropic_model),
            gemini_api_key: env.optional("GEMINI_API_KEY"),
            gemini_model: env.string("GEMINI_MODEL", &defaults.gemini_model),
            lmstudio_api_url: env.string("LMSTUDIO_API_URL", &defaults.lmstudio_api_url),
            lmstudio_model: env.string("LMSTUDIO_MODEL", &defaults.lmstudio_model),
            request_timeout: Duration::from_secs(env.parse("LLM_TIMEOUT_SECS", 60u64)?),
        };

        let style_defaults = AnnotationStyle::default();
        let text_color = match env.optional("ANNOTATION_TEXT_COLOR") {
            Some(raw) => parse_rgb(&raw).ok_or_else(|| {
                Error::Config(format!("ANNOTATION_TEXT_COLOR must be \"r,g,b\", got {}", raw))
            })?,
            None => style_defaults.text_color,
        };
        let annotation_style = AnnotationStyle {
            text_color,
            mask_alpha: env.parse("ANNOTATION_MASK_ALPHA", style_defaults.mask_alpha)?,
            font_scale: env.parse("ANNOTATION_FONT_SCALE", style_defaults.font_scale)?,
        };

        let frames_dir = PathBuf::from(env.string("FRAMES_STORAGE_PATH", "./frames"));
        let annotated_dir = env
            .optional("ANNOTATED_FRAMES_STORAGE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| frames_dir.join("annotated"));

        let config = Self {
            host: env.string("HOST", "0.0.0.0"),
            port: env.parse("PORT", 8000u16)?,
            sources_file: PathBuf::from(env.string("SOURCES_FILE", "./sources.json")),
            alert_rules_file: PathBuf::from(env.string("ALERT_RULES_FILE", "./alert_rules.json")),
            frames_dir,
            annotated_dir,
            frame_interval_secs: env.parse("FRAME_INTERVAL_SECONDS", 10u64)?,
            max_queue_size: env.parse("MAX_QUEUE_SIZE", 100usize)?,
            queue_workers: env.parse("QUEUE_WORKERS", 2usize)?,
            motion_enabled: env.parse("MOTION_DETECTION_ENABLED", true)?,
            motion_threshold: env.parse("MOTION_THRESHOLD", 10.0f32)?,
            rtsp_transport: env.string("RTSP_TRANSPORT", "tcp"),
            max_consecutive_errors: env.parse("RTSP_MAX_CONSECUTIVE_ERRORS", 10u32)?,
            reconnect_attempts: env.parse("RECONNECT_ATTEMPTS", 3u32)?,
            reconnect_delay_secs: env.parse("RECONNECT_DELAY_SECS", 2u64)?,
            grab_timeout_secs: env.parse("GRAB_TIMEOUT_SECS", 10u64)?,
            motion_debug_dir: env.optional("MOTION_DEBUG_DIR").map(PathBuf::from),
            ffmpeg_path: env.string("FFMPEG_PATH", "ffmpeg"),
            ffprobe_path: env.string("FFPROBE_PATH", "ffprobe"),
            vision,
            annotation_enabled: env.parse("ANNOTATION_ENABLED", true)?,
            annotation_style,
            annotation_font_path: env.optional("ANNOTATION_FONT_PATH").map(PathBuf::from),
            event_log_capacity: env.parse("EVENT_LOG_CAPACITY", 2000usize)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_interval_secs < 1 {
            return Err(Error::Config("FRAME_INTERVAL_SECONDS must be at least 1".to_string()));
        }
        if self.max_queue_size < MIN_QUEUE_SIZE {
            return Err(Error::Config(format!(
                "MAX_QUEUE_SIZE must be at least {}",
                MIN_QUEUE_SIZE
            )));
        }
        if self.queue_workers < 1 {
            return Err(Error::Config("QUEUE_WORKERS must be at least 1".to_string()));
        }
        if !(0.0..=100.0).contains(&self.motion_threshold) {
            return Err(Error::Config("MOTION_THRESHOLD must be between 0 and 100".to_string()));
        }
        if !(1..=100).contains(&self.max_consecutive_errors) {
            return Err(Error::Config(
                "RTSP_MAX_CONSECUTIVE_ERRORS must be between 1 and 100".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.annotation_style.mask_alpha) {
            return Err(Error::Config("ANNOTATION_MASK_ALPHA must be between 0 and 1".to_string()));
        }
        if self.annotation_style.font_scale <= 0.0 {
            return Err(Error::Config("ANNOTATION_FONT_SCALE must be positive".to_string()));
        }
        Ok(())
    }

    pub fn source_defaults(&self) -> SourceDefaults {
        SourceDefaults {
            interval_secs: self.frame_interval_secs,
            motion_enabled: self.motion_enabled,
            motion_threshold: self.motion_threshold,
        }
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            max_consecutive_errors: self.max_consecutive_errors,
            reconnect_attempts: self.reconnect_attempts,
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            grab_timeout: Duration::from_secs(
                self.grab_timeout_secs + FFMPEG_DEADLINE_SLACK_SECS + GRAB_DEADLINE_SLACK_SECS,
            ),
            motion_debug_dir: self.motion_debug_dir.clone(),
            ..CaptureSettings::default()
        }
    }

    pub fn ffmpeg_settings(&self) -> FfmpegSettings {
        FfmpegSettings {
            ffmpeg_path: self.ffmpeg_path.clone(),
            ffprobe_path: self.ffprobe_path.clone(),
            rtsp_transport: self.rtsp_transport.clone(),
            io_timeout: Duration::from_secs(self.grab_timeout_secs),
            process_timeout: Duration::from_secs(self.grab_timeout_secs + FFMPEG_DEADLINE_SLACK_SECS),
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("Invalid {}={}: {}", key, raw, e))),
            None => Ok(default),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    /// Source registry
    pub manager: Arc<CameraManager>,
    pub queue: Arc<FrameQueue>,
    pub vision: Arc<VisionProvider>,
    pub event_log: Arc<EventLogService>,
    pub alerts: Arc<KeywordDetector>,
    pub started_at: Instant,
}

impl AppState {
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
