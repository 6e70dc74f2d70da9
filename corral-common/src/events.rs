//! Monitoring-event schema.
//!
//! Events are transient: delivered synchronously to registered listeners in
//! emission order, then discarded. Nothing here is persisted.

use crate::types::ExecutionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Categories of monitoring events emitted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringEventType {
    ExecutionStart,
    ExecutionComplete,
    PerformanceWarning,
    SecurityEvent,
    ResourceUsage,
    Error,
}

/// One monitoring event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringEvent {
    pub event_type: MonitoringEventType,
    pub timestamp: DateTime<Utc>,
    /// Execution this event belongs to, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ExecutionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MonitoringEvent {
    pub fn new(event_type: MonitoringEventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            context_id: None,
            data: None,
            message: None,
        }
    }

    pub fn for_execution(mut self, id: ExecutionId) -> Self {
        self.context_id = Some(id);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Callback invoked for every monitoring event the manager fans out.
///
/// Listeners run synchronously on the emitting path; a panicking listener
/// is isolated and must never abort the execution it observes.
pub type MonitoringEventListener = Arc<dyn Fn(&MonitoringEvent) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let id = ExecutionId::new();
        let event = MonitoringEvent::new(MonitoringEventType::SecurityEvent)
            .for_execution(id)
            .with_message("rule `allow-cdn` matched `fetch`");
        assert_eq!(event.event_type, MonitoringEventType::SecurityEvent);
        assert_eq!(event.context_id, Some(id));
        assert!(event.data.is_none());
    }

    #[test]
    fn test_event_serde_skips_empty_fields() {
        let event = MonitoringEvent::new(MonitoringEventType::ExecutionStart);
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("context_id").is_none());
        assert!(json.get("data").is_none());
    }
}
