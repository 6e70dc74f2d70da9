//! Common test utilities shared across integration tests.

use corral_common::MonitoringEvent;
use corral_sandbox::{
    PartialBasicConfig, PartialSandboxConfig, PerformanceConfig, SandboxManager, SecurityPolicy,
    SecuritySection,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// Register a listener that records every delivered event.
pub fn collect_events(manager: &SandboxManager) -> Arc<Mutex<Vec<MonitoringEvent>>> {
    let events: Arc<Mutex<Vec<MonitoringEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    manager.add_event_listener(Arc::new(move |event| {
        sink.lock().unwrap().push(event.clone());
    }));
    events
}

/// Overrides with a short timeout and an unbounded iteration ceiling, for
/// exercising wall-clock enforcement.
pub fn tight_timeout_config(timeout: Duration) -> PartialSandboxConfig {
    PartialSandboxConfig {
        basic: Some(PartialBasicConfig {
            timeout: Some(timeout),
            ..PartialBasicConfig::default()
        }),
        performance: Some(PerformanceConfig {
            max_loop_iterations: u64::MAX,
            ..PerformanceConfig::default()
        }),
        ..PartialSandboxConfig::default()
    }
}

/// Overrides carrying a specific security policy.
pub fn policy_config(policy: SecurityPolicy) -> PartialSandboxConfig {
    PartialSandboxConfig {
        security: Some(SecuritySection {
            policy,
            block_critical_static_risks: true,
        }),
        ..PartialSandboxConfig::default()
    }
}
