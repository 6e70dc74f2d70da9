//! Error taxonomy for sandboxed execution.
//!
//! Every failure in the pipeline is classified into exactly one
//! [`SandboxErrorType`]; each variant has a single detector (the validator
//! for syntax, the policy engine for access violations, the resource
//! monitor for limits, the execution engine for everything else).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Failure classes for sandboxed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxErrorType {
    /// Wall-clock deadline exceeded.
    Timeout,
    /// Hard memory ceiling exceeded.
    MemoryLimit,
    /// Code referenced or invoked a denied identifier or operation.
    ForbiddenAccess,
    /// Code failed to parse.
    SyntaxError,
    /// Uncaught runtime failure, or manager-level misuse.
    RuntimeError,
    /// Policy-level breach, e.g. a sandbox-escape attempt.
    SecurityViolation,
    /// Call-stack or iteration ceiling exceeded.
    ResourceLimit,
}

impl std::fmt::Display for SandboxErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SandboxErrorType::Timeout => "timeout",
            SandboxErrorType::MemoryLimit => "memory limit",
            SandboxErrorType::ForbiddenAccess => "forbidden access",
            SandboxErrorType::SyntaxError => "syntax error",
            SandboxErrorType::RuntimeError => "runtime error",
            SandboxErrorType::SecurityViolation => "security violation",
            SandboxErrorType::ResourceLimit => "resource limit",
        };
        write!(f, "{}", name)
    }
}

/// An error value produced by the sandbox pipeline.
///
/// Constructed once at the failure site and never mutated afterward; the
/// detecting component moves it into the terminal execution context.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct SandboxError {
    pub kind: SandboxErrorType,
    pub message: String,
    /// Structured diagnostic payload (line/column, identifier, limit hit).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl SandboxError {
    pub fn new(kind: SandboxErrorType, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach a structured diagnostic payload.
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn timeout(limit_ms: u64) -> Self {
        Self::new(
            SandboxErrorType::Timeout,
            format!("execution timed out after {}ms", limit_ms),
        )
        .with_context(serde_json::json!({ "limit_ms": limit_ms }))
    }

    pub fn memory_limit(limit_bytes: u64) -> Self {
        Self::new(
            SandboxErrorType::MemoryLimit,
            format!("memory usage exceeded the {} byte limit", limit_bytes),
        )
        .with_context(serde_json::json!({ "limit_bytes": limit_bytes }))
    }

    pub fn forbidden_access(operation: impl Into<String>) -> Self {
        let operation = operation.into();
        Self::new(
            SandboxErrorType::ForbiddenAccess,
            format!("forbidden access to `{}`", operation),
        )
        .with_context(serde_json::json!({ "operation": operation }))
    }

    pub fn syntax(line: u32, column: u32, message: impl Into<String>) -> Self {
        Self::new(SandboxErrorType::SyntaxError, message.into())
            .with_context(serde_json::json!({ "line": line, "column": column }))
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(SandboxErrorType::RuntimeError, message)
    }

    pub fn security_violation(message: impl Into<String>) -> Self {
        Self::new(SandboxErrorType::SecurityViolation, message)
    }

    pub fn resource_limit(message: impl Into<String>) -> Self {
        Self::new(SandboxErrorType::ResourceLimit, message)
    }
}

/// Handler for errors that occur outside any tracked execution context,
/// e.g. during instance teardown.
pub type GlobalErrorHandler = Arc<dyn Fn(&SandboxError) + Send + Sync>;
