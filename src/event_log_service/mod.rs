//! EventLogService - Analysed Frame Log (Ring Buffer)
//!
//! ## Responsibilities
//!
//! - Keep the most recent analysis events in memory
//! - Newest-first queries, overall and per source

use crate::frame_grabber::SourceId;
use crate::keyword_detector::AlertMatch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// One analysed frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisEvent {
    /// Assigned on insert
    pub event_id: u64,
    pub source_id: SourceId,
    pub captured_at: DateTime<Utc>,
    pub frame_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated_path: Option<PathBuf>,
    pub description: String,
    pub keywords: Vec<String>,
    pub confidence: Option<f32>,
    pub provider: String,
    pub model: String,
    pub processing_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion_score: Option<f32>,
    /// Alert rules this frame fired
    #[serde(default)]
    pub alerts: Vec<AlertMatch>,
    pub created_at: DateTime<Utc>,
}

struct EventRingBuffer {
    events: VecDeque<AnalysisEvent>,
    capacity: usize,
    next_id: u64,
}

impl EventRingBuffer {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            next_id: 1,
        }
    }

    fn push(&mut self, mut event: AnalysisEvent) -> u64 {
        let id = self.next_id;
        event.event_id = id;
        self.next_id += 1;

        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
        id
    }

    fn latest(&self, count: usize) -> Vec<AnalysisEvent> {
        self.events.iter().rev().take(count).cloned().collect()
    }

    fn by_source(&self, source_id: SourceId, count: usize) -> Vec<AnalysisEvent> {
        self.events
            .iter()
            .rev()
            .filter(|e| e.source_id == source_id)
            .take(count)
            .cloned()
            .collect()
    }
}

pub struct EventLogService {
    buffer: RwLock<EventRingBuffer>,
}

impl EventLogService {
    /// A zero capacity is raised to one
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: RwLock::new(EventRingBuffer::new(capacity)),
        }
    }

    /// Append an event, evicting the oldest when full. Returns the event id.
    pub async fn add_event(&self, event: AnalysisEvent) -> u64 {
        let source_id = event.source_id;
        let id = self.buffer.write().await.push(event);
        tracing::debug!(event_id = id, source_id = %source_id, "Event added to ring buffer");
        id
    }

    pub async fn get_latest(&self, count: usize) -> Vec<AnalysisEvent> {
        self.buffer.read().await.latest(count)
    }

    pub async fn get_by_source(&self, source_id: SourceId, count: usize) -> Vec<AnalysisEvent> {
        self.buffer.read().await.by_source(source_id, count)
    }

    pub async fn count(&self) -> usize {
        self.buffer.read().await.events.len()
    }

    pub async fn capacity(&self) -> usize {
        self.buffer.read().await.capacity
    }
}

impl Default for EventLogService {
    fn default() -> Self {
        Self::new(2000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn event(source_id: SourceId, description: &str) -> AnalysisEvent {
        let now = Utc::now();
        AnalysisEvent {
            event_id: 0,
            source_id,
            captured_at: now,
            frame_path: PathBuf::from("frames/x.jpg"),
            annotated_path: None,
            description: description.to_string(),
            keywords: vec![],
            confidence: None,
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            processing_time_ms: 10,
            motion_score: None,
            alerts: vec![],
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_ids_assigned_in_order() {
        let log = EventLogService::new(10);
        let source = Uuid::new_v4();
        assert_eq!(log.add_event(event(source, "a")).await, 1);
        assert_eq!(log.add_event(event(source, "b")).await, 2);

        let latest = log.get_latest(10).await;
        assert_eq!(latest[0].event_id, 2);
        assert_eq!(latest[1].description, "a");
    }

    #[tokio::test]
    async fn test_oldest_evicted_at_capacity() {
        let log = EventLogService::new(3);
        let source = Uuid::new_v4();
        for i in 0..5 {
            log.add_event(event(source, &i.to_string())).await;
        }

        assert_eq!(log.count().await, 3);
        let descriptions: Vec<_> = log
            .get_latest(10)
            .await
            .into_iter()
            .map(|e| e.description)
            .collect();
        assert_eq!(descriptions, vec!["4", "3", "2"]);
    }

    #[tokio::test]
    async fn test_filter_by_source() {
        let log = EventLogService::new(10);
        let (front, back) = (Uuid::new_v4(), Uuid::new_v4());
        log.add_event(event(front, "f1")).await;
        log.add_event(event(back, "b1")).await;
        log.add_event(event(front, "f2")).await;

        let events = log.get_by_source(front, 10).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].description, "f2");
        assert_eq!(log.get_by_source(back, 1).await.len(), 1);
        assert!(log.get_by_source(Uuid::new_v4(), 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_zero_capacity_raised() {
        let log = EventLogService::new(0);
        log.add_event(event(Uuid::new_v4(), "only")).await;
        assert_eq!(log.capacity().await, 1);
        assert_eq!(log.count().await, 1);
    }
}
