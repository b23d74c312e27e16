//! Engine event bus — trait for emitting experimentation events from any
//! module.
//!
//! Services accept an `Arc<dyn EventSink>` to feed assignment, conversion,
//! and lifecycle events into the analytics pipeline or customer webhooks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineEventType {
    ExperimentCreated,
    ExperimentStarted,
    ExperimentPaused,
    ExperimentResumed,
    ExperimentCompleted,
    ExperimentArchived,
    AssignmentCreated,
    ConversionRecorded,
    FlagCreated,
    FlagToggled,
    FlagEvaluated,
}

/// An experimentation event routed to the analytics pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_type: EngineEventType,
    pub owner_id: Option<Uuid>,
    pub experiment_id: Option<Uuid>,
    pub variant_id: Option<Uuid>,
    pub flag_key: Option<String>,
    pub visitor_id: Option<String>,
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(event_type: EngineEventType) -> Self {
        Self {
            event_type,
            owner_id: None,
            experiment_id: None,
            variant_id: None,
            flag_key: None,
            visitor_id: None,
            detail: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn experiment(mut self, experiment_id: Uuid) -> Self {
        self.experiment_id = Some(experiment_id);
        self
    }

    pub fn variant(mut self, variant_id: Uuid) -> Self {
        self.variant_id = Some(variant_id);
        self
    }

    pub fn owner(mut self, owner_id: Uuid) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    pub fn flag(mut self, key: impl Into<String>) -> Self {
        self.flag_key = Some(key.into());
        self
    }

    pub fn visitor(mut self, visitor_id: impl Into<String>) -> Self {
        self.visitor_id = Some(visitor_id.into());
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Trait for emitting engine events. Implementations route events to the
/// analytics store, message bus, or customer webhooks.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// No-op sink for tests and hosts that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: EngineEventType) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus mutex poisoned").clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: EngineEvent) {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .push(event);
    }
}
