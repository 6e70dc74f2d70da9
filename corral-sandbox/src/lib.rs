//! Corral sandbox - capability-mediated execution of untrusted script code
//!
//! Accepts a string of untrusted script code, executes it under a
//! configurable security and resource policy, and reports a structured
//! result or a classified failure. The hosted code cannot escape its
//! permission boundary or exhaust host resources.

mod config;
mod events;
mod execution;
mod lang;
mod manager;
mod monitor;
mod policy;
mod runtime;
mod validator;

pub use config::{
    BasicConfig, DebugConfig, DebugLogLevel, ExtendedSandboxConfig, GlobalSandboxSettings,
    MonitoringConfig, PartialBasicConfig, PartialSandboxConfig, PerformanceConfig,
    SandboxConfigType, SandboxFactoryOptions, SecuritySection,
};
pub use events::{EventBus, EventSink};
pub use execution::{CodeExecutionContext, ExecutionEngine, ExecutionStatus};
pub use manager::{SandboxInstanceState, SandboxManager};
pub use monitor::{ExecutionMeter, ResourceMonitor, ResourceUsageStats};
pub use policy::{
    AccessDecision, AccessKind, Capability, CapabilitySet, CustomRule, PermissionLevel,
    RuleAction, SecurityPolicy,
};
pub use runtime::{InterpIsolate, InterruptHandle, InterruptReason, Isolate, IsolateJob, IsolateOutcome};
pub use validator::{
    CodeComplexity, ResourceEstimate, RiskSeverity, SecurityReport, SecurityRisk, SyntaxIssue,
    SyntaxReport, SyntaxSeverity, Validator,
};

/// Re-export the shared error and event types.
pub use corral_common::{
    ExecutionId, GlobalErrorHandler, InstanceId, ListenerId, MonitoringEvent,
    MonitoringEventListener, MonitoringEventType, SandboxError, SandboxErrorType,
};

/// Crate-level result for fallible setup paths (config merging, policy
/// compilation). Execution failures are reported through
/// [`CodeExecutionContext::error`], not through this alias.
pub type Result<T> = anyhow::Result<T>;
