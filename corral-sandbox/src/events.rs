//! Listener fan-out for monitoring events.
//!
//! The bus snapshots the listener set before each dispatch, so listeners
//! may register or remove themselves while events are being delivered. A
//! panicking listener is isolated from the execution it observes.

use crate::config::MonitoringConfig;
use corral_common::{ListenerId, MonitoringEvent, MonitoringEventListener, MonitoringEventType};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

/// Emission endpoint handed to the engine and monitor for one execution,
/// pre-filtered by the instance's monitoring configuration.
pub type EventSink = Arc<dyn Fn(MonitoringEvent) + Send + Sync>;

/// Publish/subscribe channel owned by the manager.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<HashMap<ListenerId, MonitoringEventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: MonitoringEventListener) -> ListenerId {
        let id = ListenerId::new();
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .insert(id, listener);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .remove(&id)
            .is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().expect("listener lock poisoned").len()
    }

    /// Deliver one event to every currently registered listener.
    pub fn emit(&self, event: MonitoringEvent) {
        let snapshot: Vec<MonitoringEventListener> = {
            let listeners = self.listeners.read().expect("listener lock poisoned");
            listeners.values().cloned().collect()
        };
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::warn!(
                    event_type = ?event.event_type,
                    "monitoring listener panicked; continuing"
                );
            }
        }
    }

    /// A sink for one execution, filtered by the instance's monitoring
    /// category flags.
    pub fn sink_for(&self, monitoring: MonitoringConfig) -> EventSink {
        let bus = self.clone();
        Arc::new(move |event: MonitoringEvent| {
            if category_enabled(&monitoring, event.event_type) {
                bus.emit(event);
            }
        })
    }
}

fn category_enabled(config: &MonitoringConfig, event_type: MonitoringEventType) -> bool {
    match event_type {
        MonitoringEventType::ExecutionStart | MonitoringEventType::ExecutionComplete => {
            config.execution_events
        }
        MonitoringEventType::PerformanceWarning => config.performance_warnings,
        MonitoringEventType::SecurityEvent => config.security_events,
        MonitoringEventType::ResourceUsage => config.resource_usage,
        MonitoringEventType::Error => config.error_events,
    }
}
