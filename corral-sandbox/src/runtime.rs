//! Isolation primitive contract and the reference interpreter behind it.
//!
//! The execution engine acquires one isolate run per execution: a fresh
//! global scope, discarded on the terminal transition, never shared across
//! instances. Any backend satisfying [`Isolate`] can host the script; the
//! in-process interpreter is the default.

mod interp;

use crate::config::BasicConfig;
use crate::events::EventSink;
use crate::monitor::ExecutionMeter;
use crate::policy::CapabilitySet;
use async_trait::async_trait;
use corral_common::{ExecutionId, SandboxError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Why a run was pre-emptively interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    Timeout,
    MemoryLimit,
    ResourceLimit,
    Cancelled,
}

#[derive(Default)]
struct InterruptState {
    flag: AtomicBool,
    reason: Mutex<Option<InterruptReason>>,
}

/// Pre-emptive interruption for one run. The interpreter polls the flag at
/// every statement and loop iteration, so even a tight synchronous loop
/// stops promptly. The first interrupt wins; later calls are no-ops.
#[derive(Clone, Default)]
pub struct InterruptHandle {
    state: Arc<InterruptState>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self, reason: InterruptReason) {
        let mut slot = self.state.reason.lock().expect("interrupt lock poisoned");
        if slot.is_none() {
            *slot = Some(reason);
            self.state.flag.store(true, Ordering::Release);
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.flag.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<InterruptReason> {
        *self.state.reason.lock().expect("interrupt lock poisoned")
    }
}

/// Everything one isolate run needs: the code, the compiled capability
/// set, host-provided bindings, and the observation plumbing.
pub struct IsolateJob {
    pub execution_id: ExecutionId,
    pub code: String,
    pub capabilities: Arc<CapabilitySet>,
    pub basic: BasicConfig,
    /// Per-call values exposed to the script as global bindings.
    pub context: HashMap<String, serde_json::Value>,
    pub meter: Arc<ExecutionMeter>,
    pub interrupt: InterruptHandle,
    pub sink: EventSink,
    /// Attach script stack traces to error payloads.
    pub stack_traces: bool,
}

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct IsolateOutcome {
    /// Value of the program's final expression statement.
    pub value: serde_json::Value,
    /// Captured console output, in emission order.
    pub console: Vec<String>,
}

/// Contract for the isolation primitive.
///
/// Implementations must give every job its own global scope, honor the
/// interrupt handle pre-emptively, and report usage through the job's
/// meter. Capability checks go through the job's capability set; a denial
/// terminates the run.
#[async_trait]
pub trait Isolate: Send + Sync {
    async fn run(&self, job: IsolateJob) -> Result<IsolateOutcome, SandboxError>;

    fn name(&self) -> &str;
}

/// The built-in tree-walking interpreter. Runs the script on a blocking
/// thread; a fresh environment is built per job and dropped with it.
#[derive(Default)]
pub struct InterpIsolate;

impl InterpIsolate {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Isolate for InterpIsolate {
    async fn run(&self, job: IsolateJob) -> Result<IsolateOutcome, SandboxError> {
        let interrupt = job.interrupt.clone();
        let basic = job.basic.clone();
        let result = tokio::task::spawn_blocking(move || interp::evaluate(job))
            .await
            .map_err(|e| SandboxError::runtime(format!("isolate worker failed: {}", e)))?;

        result.map_err(|err| match err {
            interp::ScriptError::Runtime(message) => SandboxError::runtime(message),
            interp::ScriptError::Halt(error) => error,
            interp::ScriptError::Interrupted => match interrupt.reason() {
                Some(InterruptReason::Timeout) | None => {
                    SandboxError::timeout(basic.timeout.as_millis() as u64)
                }
                Some(InterruptReason::MemoryLimit) => {
                    SandboxError::memory_limit(basic.max_memory_bytes)
                }
                Some(InterruptReason::ResourceLimit) => {
                    SandboxError::resource_limit("execution interrupted over resource limits")
                }
                Some(InterruptReason::Cancelled) => {
                    SandboxError::runtime("execution cancelled by the caller")
                }
            },
        })
    }

    fn name(&self) -> &str {
        "interp"
    }
}
