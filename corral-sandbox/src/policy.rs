//! Security policy and its compiled, enforceable form.
//!
//! A [`SecurityPolicy`] is declarative: one permission level per capability
//! plus an ordered list of custom rules. [`CapabilitySet::resolve`] compiles
//! it together with the instance's allow/forbid lists into the single
//! capability set checked at every capability-sensitive operation.

use crate::config::BasicConfig;
use corral_common::SandboxError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Coarse grant applied per capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    /// Deny everything in the category.
    None,
    /// Allow read-only variants only.
    ReadOnly,
    /// Allow reads and invocations, deny writes.
    Limited,
    /// Allow everything in the category.
    Full,
}

/// Categorized permissions the hosted code may exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Network,
    FileSystem,
    Dom,
    SystemApi,
    ThirdPartyLibs,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Capability::Network => "network",
            Capability::FileSystem => "file_system",
            Capability::Dom => "dom",
            Capability::SystemApi => "system_api",
            Capability::ThirdPartyLibs => "third_party_libs",
        };
        write!(f, "{}", name)
    }
}

/// How an operation touches its capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Read,
    Write,
    Invoke,
}

/// Disposition of a matched custom rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Permit silently.
    Allow,
    /// Block and terminate the execution.
    Deny,
    /// Permit, but emit a security event.
    Warn,
}

/// A named, pattern-matched override. Rules are evaluated in declaration
/// order and the first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomRule {
    pub name: String,
    /// Regex matched against the operation string (`fetch`,
    /// `document.write`, `require:lodash`, ...).
    pub pattern: String,
    pub action: RuleAction,
}

impl CustomRule {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>, action: RuleAction) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            action,
        }
    }
}

/// Declarative capability grants for one sandbox instance. Immutable once
/// attached; changing policy requires a new instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub network: PermissionLevel,
    pub file_system: PermissionLevel,
    pub dom: PermissionLevel,
    pub system_api: PermissionLevel,
    pub third_party_libs: PermissionLevel,
    #[serde(default)]
    pub custom_rules: Vec<CustomRule>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl SecurityPolicy {
    /// Network calls allowed in limited form, everything else denied.
    pub fn standard() -> Self {
        Self {
            network: PermissionLevel::Limited,
            file_system: PermissionLevel::None,
            dom: PermissionLevel::None,
            system_api: PermissionLevel::None,
            third_party_libs: PermissionLevel::None,
            custom_rules: Vec::new(),
        }
    }

    /// Every capability denied.
    pub fn locked_down() -> Self {
        Self {
            network: PermissionLevel::None,
            file_system: PermissionLevel::None,
            dom: PermissionLevel::None,
            system_api: PermissionLevel::None,
            third_party_libs: PermissionLevel::None,
            custom_rules: Vec::new(),
        }
    }

    /// Every capability fully granted.
    pub fn permissive() -> Self {
        Self {
            network: PermissionLevel::Full,
            file_system: PermissionLevel::Full,
            dom: PermissionLevel::Full,
            system_api: PermissionLevel::Full,
            third_party_libs: PermissionLevel::Full,
            custom_rules: Vec::new(),
        }
    }

    pub fn level_for(&self, capability: Capability) -> PermissionLevel {
        match capability {
            Capability::Network => self.network,
            Capability::FileSystem => self.file_system,
            Capability::Dom => self.dom,
            Capability::SystemApi => self.system_api,
            Capability::ThirdPartyLibs => self.third_party_libs,
        }
    }
}

/// Outcome of one capability check.
#[derive(Debug, Clone)]
pub enum AccessDecision {
    /// Proceed silently.
    Allow,
    /// Proceed, and emit a security event naming the matched rule.
    Warn { rule: String },
    /// Block; the execution terminates with this error.
    Deny { error: SandboxError },
}

struct CompiledRule {
    name: String,
    regex: Regex,
    action: RuleAction,
}

/// Identifiers that reach for the host scope. Referencing them is a
/// policy-level breach regardless of configuration.
const ESCAPE_IDENTIFIERS: &[&str] = &["globalThis", "window", "eval", "Function"];

/// The effective capability set for one instance, checked at every
/// capability-sensitive operation an execution attempts.
pub struct CapabilitySet {
    policy: SecurityPolicy,
    rules: Vec<CompiledRule>,
    allowed: HashSet<String>,
    forbidden: HashSet<String>,
}

impl CapabilitySet {
    /// Compile a policy plus the instance's allow/forbid lists. Invalid
    /// rule patterns are configuration errors, caught at instance creation.
    pub fn resolve(policy: &SecurityPolicy, basic: &BasicConfig) -> crate::Result<Self> {
        let mut rules = Vec::with_capacity(policy.custom_rules.len());
        for rule in &policy.custom_rules {
            let regex = Regex::new(&rule.pattern).map_err(|e| {
                anyhow::anyhow!("invalid pattern in custom rule `{}`: {}", rule.name, e)
            })?;
            rules.push(CompiledRule {
                name: rule.name.clone(),
                regex,
                action: rule.action,
            });
        }
        Ok(Self {
            policy: policy.clone(),
            rules,
            allowed: basic.allowed_globals.iter().cloned().collect(),
            forbidden: basic.forbidden_globals.iter().cloned().collect(),
        })
    }

    /// Check one attempted capability use.
    ///
    /// Resolution order: forbidden list, explicit allow list, custom rules
    /// in declaration order (first match wins), then the category's base
    /// permission level.
    pub fn check(
        &self,
        capability: Capability,
        operation: &str,
        access: AccessKind,
    ) -> AccessDecision {
        let root = operation_root(operation);

        if self.forbidden.contains(operation) || self.forbidden.contains(root) {
            return AccessDecision::Deny {
                error: SandboxError::forbidden_access(operation),
            };
        }

        if self.allowed.contains(operation) || self.allowed.contains(root) {
            return AccessDecision::Allow;
        }

        for rule in &self.rules {
            if rule.regex.is_match(operation) {
                return match rule.action {
                    RuleAction::Allow => AccessDecision::Allow,
                    RuleAction::Warn => AccessDecision::Warn {
                        rule: rule.name.clone(),
                    },
                    RuleAction::Deny => AccessDecision::Deny {
                        error: SandboxError::forbidden_access(operation).with_context(
                            serde_json::json!({
                                "operation": operation,
                                "rule": rule.name,
                            }),
                        ),
                    },
                };
            }
        }

        let level = self.policy.level_for(capability);
        let permitted = match (level, access) {
            (PermissionLevel::None, _) => false,
            (PermissionLevel::ReadOnly, AccessKind::Read) => true,
            (PermissionLevel::ReadOnly, _) => false,
            (PermissionLevel::Limited, AccessKind::Write) => false,
            (PermissionLevel::Limited, _) => true,
            (PermissionLevel::Full, _) => true,
        };

        if permitted {
            AccessDecision::Allow
        } else {
            AccessDecision::Deny {
                error: SandboxError::forbidden_access(operation).with_context(serde_json::json!({
                    "operation": operation,
                    "capability": capability.to_string(),
                    "level": level,
                })),
            }
        }
    }

    /// Unconditional check applied to every global identifier reference,
    /// before any capability category is consulted.
    pub fn check_identifier(&self, name: &str) -> Option<SandboxError> {
        if self.forbidden.contains(name) {
            return Some(SandboxError::forbidden_access(name));
        }
        if ESCAPE_IDENTIFIERS.contains(&name) {
            return Some(SandboxError::security_violation(format!(
                "attempt to reach the host scope via `{}`",
                name
            )));
        }
        None
    }

    /// Whether the allow list explicitly grants this identifier.
    pub fn is_explicitly_allowed(&self, name: &str) -> bool {
        self.allowed.contains(name)
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }
}

fn operation_root(operation: &str) -> &str {
    operation
        .split(['.', ':'])
        .next()
        .unwrap_or(operation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(policy: SecurityPolicy) -> CapabilitySet {
        CapabilitySet::resolve(&policy, &BasicConfig::default()).unwrap()
    }

    #[test]
    fn test_base_level_mapping() {
        let caps = resolve(SecurityPolicy {
            network: PermissionLevel::ReadOnly,
            file_system: PermissionLevel::Limited,
            ..SecurityPolicy::locked_down()
        });

        assert!(matches!(
            caps.check(Capability::Network, "fetch", AccessKind::Read),
            AccessDecision::Allow
        ));
        assert!(matches!(
            caps.check(Capability::Network, "fetch", AccessKind::Invoke),
            AccessDecision::Deny { .. }
        ));
        assert!(matches!(
            caps.check(Capability::FileSystem, "fs.readFile", AccessKind::Invoke),
            AccessDecision::Allow
        ));
        assert!(matches!(
            caps.check(Capability::FileSystem, "fs.writeFile", AccessKind::Write),
            AccessDecision::Deny { .. }
        ));
        assert!(matches!(
            caps.check(Capability::Dom, "document.title", AccessKind::Read),
            AccessDecision::Deny { .. }
        ));
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let mut policy = SecurityPolicy::locked_down();
        policy.custom_rules = vec![
            CustomRule::new("allow-fetch", "^fetch$", RuleAction::Allow),
            CustomRule::new("deny-fetch", "^fetch$", RuleAction::Deny),
        ];
        let caps = resolve(policy);
        assert!(matches!(
            caps.check(Capability::Network, "fetch", AccessKind::Invoke),
            AccessDecision::Allow
        ));

        // reversed declaration order flips the outcome
        let mut policy = SecurityPolicy::locked_down();
        policy.custom_rules = vec![
            CustomRule::new("deny-fetch", "^fetch$", RuleAction::Deny),
            CustomRule::new("allow-fetch", "^fetch$", RuleAction::Allow),
        ];
        let caps = resolve(policy);
        assert!(matches!(
            caps.check(Capability::Network, "fetch", AccessKind::Invoke),
            AccessDecision::Deny { .. }
        ));
    }

    #[test]
    fn test_forbidden_list_beats_allow_rule() {
        let mut policy = SecurityPolicy::permissive();
        policy.custom_rules = vec![CustomRule::new("allow-all", ".*", RuleAction::Allow)];
        let basic = BasicConfig {
            forbidden_globals: vec!["fetch".to_string()],
            ..BasicConfig::default()
        };
        let caps = CapabilitySet::resolve(&policy, &basic).unwrap();
        let decision = caps.check(Capability::Network, "fetch", AccessKind::Invoke);
        match decision {
            AccessDecision::Deny { error } => {
                assert_eq!(error.kind, corral_common::SandboxErrorType::ForbiddenAccess);
            }
            other => panic!("expected deny, got {:?}", other),
        }
    }

    #[test]
    fn test_warn_rule_names_itself() {
        let mut policy = SecurityPolicy::locked_down();
        policy.custom_rules = vec![CustomRule::new("audit-require", "^require:", RuleAction::Warn)];
        let caps = resolve(policy);
        match caps.check(Capability::ThirdPartyLibs, "require:lodash", AccessKind::Invoke) {
            AccessDecision::Warn { rule } => assert_eq!(rule, "audit-require"),
            other => panic!("expected warn, got {:?}", other),
        }
    }

    #[test]
    fn test_escape_identifiers_are_violations() {
        let caps = resolve(SecurityPolicy::permissive());
        let err = caps.check_identifier("globalThis").unwrap();
        assert_eq!(err.kind, corral_common::SandboxErrorType::SecurityViolation);
        assert!(caps.check_identifier("data").is_none());
    }

    #[test]
    fn test_invalid_rule_pattern_is_config_error() {
        let mut policy = SecurityPolicy::standard();
        policy.custom_rules = vec![CustomRule::new("broken", "([", RuleAction::Deny)];
        assert!(CapabilitySet::resolve(&policy, &BasicConfig::default()).is_err());
    }
}
