//! Execution context lifecycle and the engine that drives it.
//!
//! `PENDING -> RUNNING -> {SUCCESS | FAILED | CANCELLED | TIMED_OUT}`.
//! The right-hand states are terminal; a context is terminal exactly when
//! `end_time` is set. Code that fails static validation never leaves
//! `PENDING` and never gets a `start_time`.

use crate::config::ExtendedSandboxConfig;
use crate::events::EventSink;
use crate::monitor::{ExecutionMeter, ResourceMonitor, ResourceUsageStats};
use crate::policy::CapabilitySet;
use crate::runtime::{InterruptHandle, InterruptReason, Isolate, IsolateJob};
use crate::validator::Validator;
use chrono::{DateTime, Utc};
use corral_common::{
    ExecutionId, InstanceId, MonitoringEvent, MonitoringEventType, SandboxError, SandboxErrorType,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::TimedOut
        )
    }
}

/// The unit of work and its record: one code submission, its live state
/// while running, and its frozen outcome once terminal.
///
/// Linked to its owning instance by id only, never by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeExecutionContext {
    pub execution_id: ExecutionId,
    pub instance_id: InstanceId,
    /// The exact submitted source.
    pub code: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SandboxError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CodeExecutionContext {
    pub fn new(execution_id: ExecutionId, instance_id: InstanceId, code: impl Into<String>) -> Self {
        Self {
            execution_id,
            instance_id,
            code: code.into(),
            start_time: None,
            end_time: None,
            status: ExecutionStatus::Pending,
            result: None,
            error: None,
            memory_bytes: None,
            metadata: HashMap::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn begin(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = ExecutionStatus::Running;
        self.start_time = Some(Utc::now());
    }

    fn succeed(&mut self, result: serde_json::Value) {
        if self.is_terminal() {
            return;
        }
        self.status = ExecutionStatus::Success;
        self.result = Some(result);
        self.end_time = Some(Utc::now());
    }

    fn fail(&mut self, error: SandboxError) {
        if self.is_terminal() {
            return;
        }
        self.status = ExecutionStatus::Failed;
        self.error = Some(error);
        self.end_time = Some(Utc::now());
    }

    fn time_out(&mut self, error: SandboxError) {
        if self.is_terminal() {
            return;
        }
        self.status = ExecutionStatus::TimedOut;
        self.error = Some(error);
        self.end_time = Some(Utc::now());
    }

    fn cancel(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = ExecutionStatus::Cancelled;
        self.end_time = Some(Utc::now());
    }
}

/// Drives one isolated execution through its lifecycle and guarantees a
/// terminal context, whatever the script does.
pub struct ExecutionEngine {
    isolate: Arc<dyn Isolate>,
    validator: Validator,
}

impl ExecutionEngine {
    pub fn new(isolate: Arc<dyn Isolate>) -> Self {
        Self {
            isolate,
            validator: Validator::new(),
        }
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Run one execution to a terminal state. Returns the final resource
    /// usage for instance-level accumulation; every failure lands in
    /// `ctx.error`, nothing unwinds to the caller.
    pub async fn execute(
        &self,
        ctx: &mut CodeExecutionContext,
        config: &ExtendedSandboxConfig,
        capabilities: Arc<CapabilitySet>,
        sink: EventSink,
        interrupt: InterruptHandle,
        context: HashMap<String, serde_json::Value>,
    ) -> ResourceUsageStats {
        if let Some(error) = self.preflight(ctx, config) {
            sink(
                MonitoringEvent::new(MonitoringEventType::Error)
                    .for_execution(ctx.execution_id)
                    .with_message(error.to_string()),
            );
            ctx.fail(error);
            return ResourceUsageStats::default();
        }

        ctx.begin();
        tracing::info!(
            execution_id = %ctx.execution_id,
            instance_id = %ctx.instance_id,
            runtime = self.isolate.name(),
            code_len = ctx.code.len(),
            "executing code"
        );
        sink(
            MonitoringEvent::new(MonitoringEventType::ExecutionStart)
                .for_execution(ctx.execution_id)
                .with_data(serde_json::json!({ "code_len": ctx.code.len() })),
        );

        let meter = Arc::new(ExecutionMeter::new(&config.performance));
        let monitor = ResourceMonitor::watch(
            meter.clone(),
            &config.basic,
            &config.performance,
            interrupt.clone(),
            sink.clone(),
            ctx.execution_id,
        );

        let outcome = self
            .isolate
            .run(IsolateJob {
                execution_id: ctx.execution_id,
                code: ctx.code.clone(),
                capabilities,
                basic: config.basic.clone(),
                context,
                meter,
                interrupt: interrupt.clone(),
                sink: sink.clone(),
                stack_traces: config.debug.enable_stack_traces,
            })
            .await;

        let stats = monitor.finish().await;
        ctx.memory_bytes = Some(stats.memory_bytes);
        sink(
            MonitoringEvent::new(MonitoringEventType::ResourceUsage)
                .for_execution(ctx.execution_id)
                .with_data(serde_json::to_value(&stats).unwrap_or_default()),
        );

        match outcome {
            Ok(outcome) => {
                if !outcome.console.is_empty() {
                    ctx.metadata.insert(
                        "console".to_string(),
                        serde_json::json!(outcome.console),
                    );
                }
                ctx.succeed(outcome.value);
                sink(
                    MonitoringEvent::new(MonitoringEventType::ExecutionComplete)
                        .for_execution(ctx.execution_id)
                        .with_data(serde_json::json!({
                            "status": ctx.status,
                            "execution_time_ms": stats.execution_time.as_millis() as u64,
                            "memory_bytes": stats.memory_bytes,
                        })),
                );
            }
            Err(error) => {
                if interrupt.reason() == Some(InterruptReason::Cancelled) {
                    ctx.cancel();
                    sink(
                        MonitoringEvent::new(MonitoringEventType::ExecutionComplete)
                            .for_execution(ctx.execution_id)
                            .with_data(serde_json::json!({ "status": ctx.status })),
                    );
                } else {
                    tracing::debug!(
                        execution_id = %ctx.execution_id,
                        kind = %error.kind,
                        "execution failed"
                    );
                    sink(
                        MonitoringEvent::new(MonitoringEventType::Error)
                            .for_execution(ctx.execution_id)
                            .with_message(error.to_string()),
                    );
                    if error.kind == SandboxErrorType::Timeout {
                        ctx.time_out(error);
                    } else {
                        ctx.fail(error);
                    }
                }
            }
        }

        stats
    }

    /// Static validation gate. An error here means no execution context
    /// ever starts running and no isolate resources are spent.
    fn preflight(
        &self,
        ctx: &CodeExecutionContext,
        config: &ExtendedSandboxConfig,
    ) -> Option<SandboxError> {
        let syntax = self.validator.validate_syntax(&ctx.code);
        if let Some(issue) = syntax
            .issues
            .iter()
            .find(|i| i.severity == crate::validator::SyntaxSeverity::Error)
        {
            return Some(SandboxError::syntax(
                issue.line,
                issue.column,
                issue.message.clone(),
            ));
        }

        if config.security.block_critical_static_risks {
            let security = self.validator.check_security(&ctx.code);
            if let Some(risk) = security
                .risks
                .iter()
                .find(|r| r.severity == crate::validator::RiskSeverity::Critical)
            {
                return Some(
                    SandboxError::security_violation(format!(
                        "blocked by static analysis: {}",
                        risk.description
                    ))
                    .with_context(serde_json::json!({
                        "class": risk.class,
                        "line": risk.line,
                        "suggestion": risk.suggestion,
                    })),
                );
            }
        }

        let estimate = self.validator.estimate_resource_usage(&ctx.code);
        if estimate.estimated_memory_bytes > config.basic.max_memory_bytes {
            return Some(
                SandboxError::resource_limit(format!(
                    "estimated memory usage {} bytes exceeds the {} byte limit",
                    estimate.estimated_memory_bytes, config.basic.max_memory_bytes
                ))
                .with_context(serde_json::json!({
                    "estimated_memory_bytes": estimate.estimated_memory_bytes,
                    "complexity": estimate.complexity,
                })),
            );
        }

        None
    }
}
