//! Event fan-out behavior: ordering, category filtering, warning
//! thresholds and listener isolation.

use crate::common::{collect_events, setup_test_logging};
use corral_common::MonitoringEventType;
use corral_sandbox::{
    CustomRule, ExecutionStatus, MonitoringConfig, PartialBasicConfig, PartialSandboxConfig,
    PerformanceConfig, RuleAction, SandboxManager, SecurityPolicy, SecuritySection,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_events_bracket_the_execution() {
    setup_test_logging();
    let manager = SandboxManager::new();
    let events = collect_events(&manager);

    let id = manager.create_sandbox(None).await.unwrap();
    let ctx = manager.execute_code(id, "3 * 3", None).await.unwrap();

    let types: Vec<MonitoringEventType> =
        events.lock().unwrap().iter().map(|e| e.event_type).collect();
    assert_eq!(types.first(), Some(&MonitoringEventType::ExecutionStart));
    assert_eq!(types.last(), Some(&MonitoringEventType::ExecutionComplete));

    let recorded = events.lock().unwrap();
    assert!(recorded
        .iter()
        .all(|e| e.context_id == Some(ctx.execution_id)));
}

#[tokio::test]
async fn test_warn_rule_emits_security_event() {
    let manager = SandboxManager::new();
    let events = collect_events(&manager);

    let mut policy = SecurityPolicy::locked_down();
    policy.custom_rules = vec![CustomRule::new("audit-fetch", "^fetch$", RuleAction::Warn)];
    let id = manager
        .create_sandbox(Some(PartialSandboxConfig {
            security: Some(SecuritySection {
                policy,
                block_critical_static_risks: true,
            }),
            ..PartialSandboxConfig::default()
        }))
        .await
        .unwrap();

    let ctx = manager.execute_code(id, "fetch('x')", None).await.unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Success);

    let recorded = events.lock().unwrap();
    let security_event = recorded
        .iter()
        .find(|e| e.event_type == MonitoringEventType::SecurityEvent)
        .expect("warn rule must emit a security event");
    assert!(security_event
        .message
        .as_deref()
        .unwrap()
        .contains("audit-fetch"));
}

#[tokio::test]
async fn test_disabled_category_is_filtered() {
    let manager = SandboxManager::new();
    let events = collect_events(&manager);

    let mut policy = SecurityPolicy::locked_down();
    policy.custom_rules = vec![CustomRule::new("audit-fetch", "^fetch$", RuleAction::Warn)];
    let id = manager
        .create_sandbox(Some(PartialSandboxConfig {
            security: Some(SecuritySection {
                policy,
                block_critical_static_risks: true,
            }),
            monitoring: Some(MonitoringConfig {
                security_events: false,
                resource_usage: false,
                ..MonitoringConfig::default()
            }),
            ..PartialSandboxConfig::default()
        }))
        .await
        .unwrap();

    manager.execute_code(id, "fetch('x')", None).await.unwrap();

    let recorded = events.lock().unwrap();
    assert!(recorded
        .iter()
        .all(|e| e.event_type != MonitoringEventType::SecurityEvent));
    assert!(recorded
        .iter()
        .all(|e| e.event_type != MonitoringEventType::ResourceUsage));
    assert!(recorded
        .iter()
        .any(|e| e.event_type == MonitoringEventType::ExecutionStart));
}

#[tokio::test]
async fn test_execution_time_warning_fires_once() {
    let manager = SandboxManager::new();
    let events = collect_events(&manager);

    let id = manager
        .create_sandbox(Some(PartialSandboxConfig {
            basic: Some(PartialBasicConfig {
                timeout: Some(Duration::from_secs(10)),
                ..PartialBasicConfig::default()
            }),
            performance: Some(PerformanceConfig {
                sampling_interval: Duration::from_millis(5),
                execution_time_warning: Duration::from_millis(20),
                max_loop_iterations: u64::MAX,
                ..PerformanceConfig::default()
            }),
            ..PartialSandboxConfig::default()
        }))
        .await
        .unwrap();

    // enough work to run well past the 20ms warning threshold
    let code = "let n = 0; while (n < 300000) { n += 1; } n";
    let ctx = manager.execute_code(id, code, None).await.unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Success);

    let recorded = events.lock().unwrap();
    let warnings: Vec<_> = recorded
        .iter()
        .filter(|e| e.event_type == MonitoringEventType::PerformanceWarning)
        .filter(|e| e.message.as_deref().unwrap_or("").contains("execution time"))
        .collect();
    assert_eq!(warnings.len(), 1);
}

#[tokio::test]
async fn test_panicking_listener_does_not_affect_execution() {
    let manager = SandboxManager::new();
    manager.add_event_listener(Arc::new(|_| panic!("listener bug")));
    let events = collect_events(&manager);

    let id = manager.create_sandbox(None).await.unwrap();
    let ctx = manager.execute_code(id, "5 + 5", None).await.unwrap();

    assert_eq!(ctx.status, ExecutionStatus::Success);
    assert_eq!(ctx.result, Some(serde_json::json!(10)));
    assert!(!events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_error_event_on_failure() {
    let manager = SandboxManager::new();
    let events = collect_events(&manager);

    let id = manager.create_sandbox(None).await.unwrap();
    let ctx = manager
        .execute_code(id, "nonexistent()", None)
        .await
        .unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Failed);

    let recorded = events.lock().unwrap();
    assert!(recorded
        .iter()
        .any(|e| e.event_type == MonitoringEventType::Error));
}
