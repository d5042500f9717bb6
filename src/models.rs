//! Shared API models
//!
//! Response bodies for the HTTP surface, kept apart from the component
//! modules so handlers and tests share one definition.

use crate::ai_client::ProviderHealth;
use crate::frame_grabber::StatusSnapshot;
use crate::frame_queue::QueueStats;
use serde::{Deserialize, Serialize};

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: u64,
    pub vision: ProviderHealth,
}

/// Motion filter totals across all sources
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionTotals {
    pub frames_total: u64,
    pub frames_sent: u64,
    pub frames_filtered: u64,
    /// Sent / captured, percent
    pub detection_rate: f64,
}

/// Decoder health across all sources
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DecoderTotals {
    pub total_errors: u64,
    /// Mean over sources with a non-zero rate, percent
    pub avg_error_rate: f64,
}

impl MotionTotals {
    pub fn from_snapshots(snapshots: &[StatusSnapshot]) -> Self {
        let mut totals = Self::default();
        for s in snapshots {
            totals.frames_total += s.frames_captured;
            totals.frames_sent += s.frames_sent;
            totals.frames_filtered += s.frames_filtered;
        }
        if totals.frames_total > 0 {
            totals.detection_rate = totals.frames_sent as f64 / totals.frames_total as f64 * 100.0;
        }
        totals
    }
}

impl DecoderTotals {
    pub fn from_snapshots(snapshots: &[StatusSnapshot]) -> Self {
        let total_errors = snapshots.iter().map(|s| s.decoder_errors).sum();
        let rates: Vec<f64> = snapshots
            .iter()
            .map(|s| s.decoder_error_rate)
            .filter(|rate| *rate > 0.0)
            .collect();
        let avg_error_rate = if rates.is_empty() {
            0.0
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        };
        Self {
            total_errors,
            avg_error_rate,
        }
    }
}

/// `/api/v1/stats` body
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub sources_total: usize,
    pub sources_enabled: usize,
    pub events_total: usize,
    pub queue: QueueStats,
    pub motion: MotionTotals,
    pub decoder: DecoderTotals,
}

/// Result of a config hot-swap
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfigUpdateResponse {
    pub updated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_grabber::SourceState;
    use uuid::Uuid;

    fn snapshot(captured: u64, sent: u64, decoder_errors: u64) -> StatusSnapshot {
        let mut state = SourceState::new("cam");
        for _ in 0..captured {
            state.record_frame(chrono::Utc::now(), 0);
        }
        for _ in 0..sent {
            state.record_sent(None);
        }
        for _ in 0..captured.saturating_sub(sent) {
            state.record_filtered();
        }
        for _ in 0..decoder_errors {
            state.record_decoder_error("corrupt");
        }
        state.snapshot(Uuid::new_v4())
    }

    #[test]
    fn test_motion_totals() {
        let totals = MotionTotals::from_snapshots(&[snapshot(10, 2, 0), snapshot(30, 8, 0)]);
        assert_eq!(totals.frames_total, 40);
        assert_eq!(totals.frames_sent, 10);
        assert_eq!(totals.frames_filtered, 30);
        assert!((totals.detection_rate - 25.0).abs() < 1e-9);

        assert_eq!(MotionTotals::from_snapshots(&[]).detection_rate, 0.0);
    }

    #[test]
    fn test_decoder_totals_skip_clean_sources() {
        let totals = DecoderTotals::from_snapshots(&[
            snapshot(10, 10, 1),
            snapshot(10, 10, 3),
            snapshot(10, 10, 0),
        ]);
        assert_eq!(totals.total_errors, 4);
        assert!((totals.avg_error_rate - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_api_response_shape() {
        let body = serde_json::to_value(ApiResponse::success(3)).unwrap();
        assert_eq!(body, serde_json::json!({"ok": true, "data": 3}));
        let body = serde_json::to_value(ApiResponse::<()>::error("nope")).unwrap();
        assert_eq!(body, serde_json::json!({"ok": false, "error": "nope"}));
    }
}
