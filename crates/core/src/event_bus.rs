//! Lifecycle event bus.
//!
//! The scheduling engine accepts an `Arc<dyn EventSink>` and emits one
//! event per schedule transition, dispatch and recipient outcome.

use crate::types::{EventType, NotificationEvent};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: NotificationEvent);
}

/// Sink that drops every event.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: NotificationEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<NotificationEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_events<R>(&self, f: impl FnOnce(&mut Vec<NotificationEvent>) -> R) -> R {
        let mut guard = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.with_events(|events| events.clone())
    }

    pub fn count(&self) -> usize {
        self.with_events(|events| events.len())
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.with_events(|events| {
            events
                .iter()
                .filter(|e| e.event_type == event_type)
                .count()
        })
    }

    /// Events attributed to one schedule, in emission order.
    pub fn for_schedule(&self, schedule_id: Uuid) -> Vec<NotificationEvent> {
        self.with_events(|events| {
            events
                .iter()
                .filter(|e| e.schedule_id == Some(schedule_id))
                .cloned()
                .collect()
        })
    }

    pub fn clear(&self) {
        self.with_events(|events| events.clear());
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: NotificationEvent) {
        self.with_events(|events| events.push(event));
    }
}

pub fn make_event(
    event_type: EventType,
    schedule_id: Option<Uuid>,
    campaign_id: Option<Uuid>,
    detail: Option<String>,
) -> NotificationEvent {
    NotificationEvent {
        event_id: Uuid::new_v4(),
        event_type,
        schedule_id,
        campaign_id,
        detail,
        node_id: "local".into(),
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
