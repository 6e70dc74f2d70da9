//! End-to-end behavior of the sandbox pipeline through the manager.

use crate::common::{setup_test_logging, tight_timeout_config};
use assert_matches::assert_matches;
use corral_common::SandboxErrorType;
use corral_sandbox::{
    ExecutionStatus, PartialBasicConfig, PartialSandboxConfig, PerformanceConfig,
    SandboxConfigType, SandboxManager,
};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_simple_expression_succeeds() {
    setup_test_logging();
    let manager = SandboxManager::new();
    let id = manager.create_sandbox(None).await.unwrap();

    let ctx = manager.execute_code(id, "1 + 1", None).await.unwrap();
    assert_matches!(ctx.status, ExecutionStatus::Success);
    assert_eq!(ctx.result, Some(serde_json::json!(2)));
    assert!(ctx.error.is_none());

    let state = manager.get_instance_state(id).await.unwrap();
    assert_eq!(state.error_count, 0);
}

#[tokio::test]
async fn test_restricted_sandbox_blocks_network() {
    let manager = SandboxManager::new();
    let id = manager
        .create_sandbox_with_type(SandboxConfigType::Restricted, None)
        .await
        .unwrap();

    let ctx = manager
        .execute_code(id, "fetch('https://api.example.com/data')", None)
        .await
        .unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Failed);
    assert_eq!(ctx.error.unwrap().kind, SandboxErrorType::ForbiddenAccess);
}

#[tokio::test]
async fn test_infinite_loop_times_out_within_bounds() {
    let manager = SandboxManager::new();
    let id = manager
        .create_sandbox(Some(tight_timeout_config(Duration::from_millis(100))))
        .await
        .unwrap();

    let started = Instant::now();
    let ctx = manager
        .execute_code(id, "while (true) {}", None)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(ctx.status, ExecutionStatus::TimedOut);
    assert_eq!(ctx.error.unwrap().kind, SandboxErrorType::Timeout);
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(400), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_fail_closed_increments_error_count_once() {
    let manager = SandboxManager::new();
    // the basic preset denies the file system entirely
    let id = manager.create_sandbox(None).await.unwrap();

    let ctx = manager
        .execute_code(id, "fs.writeFile('/etc/passwd', 'oops')", None)
        .await
        .unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Failed);
    assert_eq!(ctx.error.unwrap().kind, SandboxErrorType::ForbiddenAccess);

    let state = manager.get_instance_state(id).await.unwrap();
    assert_eq!(state.error_count, 1);

    let ctx = manager.execute_code(id, "2 + 2", None).await.unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Success);
    let state = manager.get_instance_state(id).await.unwrap();
    assert_eq!(state.error_count, 1);
}

#[tokio::test]
async fn test_syntax_error_short_circuits() {
    let manager = SandboxManager::new();
    let id = manager.create_sandbox(None).await.unwrap();

    let ctx = manager
        .execute_code(id, "let x = {broken", None)
        .await
        .unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Failed);
    assert!(ctx.start_time.is_none(), "validation must reject before RUNNING");

    let error = ctx.error.unwrap();
    assert_eq!(error.kind, SandboxErrorType::SyntaxError);
    let context = error.context.unwrap();
    assert!(context["line"].as_u64().is_some());
    assert!(context["column"].as_u64().is_some());
}

#[tokio::test]
async fn test_resource_accumulation_over_runs() {
    let manager = SandboxManager::new();
    let id = manager.create_sandbox(None).await.unwrap();
    let code = "let parts = ['one', 'two', 'three']; parts.join('-')";

    let mut per_run = Vec::new();
    for _ in 0..3 {
        let ctx = manager.execute_code(id, code, None).await.unwrap();
        assert_eq!(ctx.status, ExecutionStatus::Success);
        per_run.push(ctx.memory_bytes.unwrap());
    }
    assert_eq!(per_run[0], per_run[1]);
    assert_eq!(per_run[1], per_run[2]);

    let state = manager.get_instance_state(id).await.unwrap();
    assert_eq!(state.execution_count, 3);
    assert_eq!(
        state.total_resource_usage.memory_bytes,
        per_run.iter().sum::<u64>()
    );
}

#[tokio::test]
async fn test_memory_limit_kills_allocation_loop() {
    let manager = SandboxManager::new();
    let id = manager
        .create_sandbox(Some(PartialSandboxConfig {
            basic: Some(PartialBasicConfig {
                max_memory_bytes: Some(256 * 1024),
                timeout: Some(Duration::from_secs(5)),
                ..PartialBasicConfig::default()
            }),
            performance: Some(PerformanceConfig {
                sampling_interval: Duration::from_millis(5),
                max_loop_iterations: u64::MAX,
                ..PerformanceConfig::default()
            }),
            ..PartialSandboxConfig::default()
        }))
        .await
        .unwrap();

    let code = r#"
        let chunk = 'xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx';
        let data = '';
        while (true) { data = data + chunk; }
    "#;
    let ctx = manager.execute_code(id, code, None).await.unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Failed);
    assert_eq!(ctx.error.unwrap().kind, SandboxErrorType::MemoryLimit);
    assert!(ctx.memory_bytes.unwrap() >= 256 * 1024);
}

#[tokio::test]
async fn test_unbounded_recursion_hits_resource_limit() {
    let manager = SandboxManager::new();
    let id = manager.create_sandbox(None).await.unwrap();

    let ctx = manager
        .execute_code(id, "function f() { return f(); } f()", None)
        .await
        .unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Failed);
    assert_eq!(ctx.error.unwrap().kind, SandboxErrorType::ResourceLimit);
}

#[tokio::test]
async fn test_context_values_reach_the_script() {
    let manager = SandboxManager::new();
    let id = manager.create_sandbox(None).await.unwrap();

    let mut context = HashMap::new();
    context.insert(
        "payload".to_string(),
        serde_json::json!({ "values": [1, 2, 3, 4] }),
    );
    let ctx = manager
        .execute_code(
            id,
            "let total = 0; for (let i = 0; i < payload.values.length; i++) { total += payload.values[i]; } total",
            Some(context),
        )
        .await
        .unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Success);
    assert_eq!(ctx.result, Some(serde_json::json!(10)));
}

#[tokio::test]
async fn test_injected_globals_from_config() {
    let manager = SandboxManager::new();
    let mut injected = HashMap::new();
    injected.insert("appVersion".to_string(), serde_json::json!("2.4.0"));
    let id = manager
        .create_sandbox(Some(PartialSandboxConfig {
            basic: Some(PartialBasicConfig {
                injected_globals: Some(injected),
                ..PartialBasicConfig::default()
            }),
            ..PartialSandboxConfig::default()
        }))
        .await
        .unwrap();

    let ctx = manager
        .execute_code(id, "'version: ' + appVersion", None)
        .await
        .unwrap();
    assert_eq!(ctx.result, Some(serde_json::json!("version: 2.4.0")));
}

#[tokio::test]
async fn test_runtime_error_is_classified() {
    let manager = SandboxManager::new();
    let id = manager.create_sandbox(None).await.unwrap();

    let ctx = manager
        .execute_code(id, "undefinedVariable + 1", None)
        .await
        .unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Failed);
    let error = ctx.error.unwrap();
    assert_eq!(error.kind, SandboxErrorType::RuntimeError);
    assert!(error.message.contains("not defined"));
}

#[tokio::test]
async fn test_executions_are_serialized_per_instance() {
    let manager = SandboxManager::new();
    let id = manager.create_sandbox(None).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..4 {
        let runner = manager.clone();
        tasks.push(tokio::spawn(async move {
            runner
                .execute_code(id, format!("{} * 10", i), None)
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        let ctx = task.await.unwrap();
        assert_eq!(ctx.status, ExecutionStatus::Success);
    }

    let state = manager.get_instance_state(id).await.unwrap();
    assert_eq!(state.execution_count, 4);
    assert!(!state.is_active);
}
