//! Policy resolution behavior observed end-to-end: allow/forbid lists,
//! custom rule ordering, and per-capability permission levels.

use crate::common::policy_config;
use corral_common::SandboxErrorType;
use corral_sandbox::{
    CustomRule, ExecutionStatus, PartialBasicConfig, PartialSandboxConfig, PermissionLevel,
    RuleAction, SandboxConfigType, SandboxManager, SecurityPolicy, SecuritySection,
};

#[tokio::test]
async fn test_first_matching_rule_wins_at_runtime() {
    let manager = SandboxManager::new();

    let mut allow_first = SecurityPolicy::locked_down();
    allow_first.custom_rules = vec![
        CustomRule::new("allow-fetch", "^fetch$", RuleAction::Allow),
        CustomRule::new("deny-fetch", "^fetch$", RuleAction::Deny),
    ];
    let id = manager
        .create_sandbox(Some(policy_config(allow_first)))
        .await
        .unwrap();
    let ctx = manager
        .execute_code(id, "fetch('https://example.com')", None)
        .await
        .unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Success);

    let mut deny_first = SecurityPolicy::locked_down();
    deny_first.custom_rules = vec![
        CustomRule::new("deny-fetch", "^fetch$", RuleAction::Deny),
        CustomRule::new("allow-fetch", "^fetch$", RuleAction::Allow),
    ];
    let id = manager
        .create_sandbox(Some(policy_config(deny_first)))
        .await
        .unwrap();
    let ctx = manager
        .execute_code(id, "fetch('https://example.com')", None)
        .await
        .unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Failed);
    assert_eq!(ctx.error.unwrap().kind, SandboxErrorType::ForbiddenAccess);
}

#[tokio::test]
async fn test_forbidden_globals_beat_allow_rules() {
    let manager = SandboxManager::new();
    let mut policy = SecurityPolicy::permissive();
    policy.custom_rules = vec![CustomRule::new("allow-all", ".*", RuleAction::Allow)];

    let id = manager
        .create_sandbox(Some(PartialSandboxConfig {
            basic: Some(PartialBasicConfig {
                forbidden_globals: Some(vec!["fetch".to_string()]),
                ..PartialBasicConfig::default()
            }),
            security: Some(SecuritySection {
                policy,
                block_critical_static_risks: true,
            }),
            ..PartialSandboxConfig::default()
        }))
        .await
        .unwrap();

    let ctx = manager.execute_code(id, "fetch('x')", None).await.unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Failed);
    assert_eq!(ctx.error.unwrap().kind, SandboxErrorType::ForbiddenAccess);
}

#[tokio::test]
async fn test_allowed_globals_exempt_from_base_level() {
    let manager = SandboxManager::new();
    let id = manager
        .create_sandbox(Some(PartialSandboxConfig {
            basic: Some(PartialBasicConfig {
                allowed_globals: Some(vec!["fetch".to_string()]),
                ..PartialBasicConfig::default()
            }),
            security: Some(SecuritySection {
                policy: SecurityPolicy::locked_down(),
                block_critical_static_risks: true,
            }),
            ..PartialSandboxConfig::default()
        }))
        .await
        .unwrap();

    let ctx = manager.execute_code(id, "fetch('x')", None).await.unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_module_rules_match_by_name() {
    let manager = SandboxManager::new();
    let mut policy = SecurityPolicy::permissive();
    policy.custom_rules = vec![CustomRule::new(
        "deny-lodash",
        "^require:lodash$",
        RuleAction::Deny,
    )];
    let id = manager
        .create_sandbox(Some(policy_config(policy)))
        .await
        .unwrap();

    let ctx = manager
        .execute_code(id, "require('lodash')", None)
        .await
        .unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Failed);

    let ctx = manager
        .execute_code(id, "require('left-pad')", None)
        .await
        .unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_read_only_dom_allows_reads_blocks_writes() {
    let manager = SandboxManager::new();
    let id = manager
        .create_sandbox(Some(PartialSandboxConfig {
            basic: Some(PartialBasicConfig {
                enable_dom: Some(true),
                ..PartialBasicConfig::default()
            }),
            security: Some(SecuritySection {
                policy: SecurityPolicy {
                    dom: PermissionLevel::ReadOnly,
                    ..SecurityPolicy::locked_down()
                },
                block_critical_static_risks: true,
            }),
            ..PartialSandboxConfig::default()
        }))
        .await
        .unwrap();

    let ctx = manager
        .execute_code(id, "document.getElementById('root')", None)
        .await
        .unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Success);

    let ctx = manager
        .execute_code(id, "document.appendChild('node')", None)
        .await
        .unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Failed);
    assert_eq!(ctx.error.unwrap().kind, SandboxErrorType::ForbiddenAccess);
}

#[tokio::test]
async fn test_development_preset_grants_everything() {
    let manager = SandboxManager::new();
    let id = manager
        .create_sandbox_with_type(SandboxConfigType::Development, None)
        .await
        .unwrap();

    let ctx = manager
        .execute_code(
            id,
            "fetch('x'); fs.writeFile('a', 'b'); document.write('c'); 'done'",
            None,
        )
        .await
        .unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Success);
    assert_eq!(ctx.result, Some(serde_json::json!("done")));
}

#[tokio::test]
async fn test_escape_attempt_is_security_violation() {
    let manager = SandboxManager::new();
    // static blocking disabled, so the attempt reaches the runtime gate
    let id = manager
        .create_sandbox(Some(PartialSandboxConfig {
            security: Some(SecuritySection {
                policy: SecurityPolicy::permissive(),
                block_critical_static_risks: false,
            }),
            ..PartialSandboxConfig::default()
        }))
        .await
        .unwrap();

    let ctx = manager
        .execute_code(id, "globalThis", None)
        .await
        .unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Failed);
    assert_eq!(
        ctx.error.unwrap().kind,
        SandboxErrorType::SecurityViolation
    );
}

#[tokio::test]
async fn test_invalid_custom_rule_fails_creation() {
    let manager = SandboxManager::new();
    let mut policy = SecurityPolicy::standard();
    policy.custom_rules = vec![CustomRule::new("broken", "([unclosed", RuleAction::Deny)];
    let result = manager.create_sandbox(Some(policy_config(policy))).await;
    assert!(result.is_err());
}
