//! Live resource observation for one running execution.
//!
//! The interpreter writes counters into a shared [`ExecutionMeter`]; a
//! sampling task reads them, emits warning events, and fires the interrupt
//! handle when a hard limit is crossed. The monitor is the sole authority
//! for killing runaway code; the policy engine only governs what code may
//! touch, not how much it consumes.

use crate::config::{BasicConfig, PerformanceConfig};
use crate::events::EventSink;
use crate::runtime::{InterruptHandle, InterruptReason};
use corral_common::{ExecutionId, MonitoringEvent, MonitoringEventType, SandboxError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Snapshot of one execution's resource usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsageStats {
    pub memory_bytes: u64,
    #[serde(with = "humantime_serde")]
    pub execution_time: Duration,
    /// Percent of one core, when the host can measure it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f32>,
    pub call_stack_depth: u32,
    pub loop_iterations: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_calls: Option<u64>,
}

impl Default for ResourceUsageStats {
    fn default() -> Self {
        Self {
            memory_bytes: 0,
            execution_time: Duration::ZERO,
            cpu_usage: None,
            call_stack_depth: 0,
            loop_iterations: 0,
            function_calls: None,
        }
    }
}

impl ResourceUsageStats {
    /// Fold another execution's stats into this running total. Sums for
    /// the additive counters, peak for stack depth; monotonic either way.
    pub fn accumulate(&mut self, other: &ResourceUsageStats) {
        self.memory_bytes += other.memory_bytes;
        self.execution_time += other.execution_time;
        self.call_stack_depth = self.call_stack_depth.max(other.call_stack_depth);
        self.loop_iterations += other.loop_iterations;
        if let Some(calls) = other.function_calls {
            *self.function_calls.get_or_insert(0) += calls;
        }
    }
}

/// Shared counters written by the interpreter and read by the monitor.
///
/// Loop and call-stack ceilings are checked inline on the hot path, so an
/// unbounded recursion is caught even between two monitor samples.
pub struct ExecutionMeter {
    memory_bytes: AtomicU64,
    loop_iterations: AtomicU64,
    call_depth: AtomicU32,
    max_call_depth: AtomicU32,
    function_calls: AtomicU64,
    max_call_stack_depth: u32,
    max_loop_iterations: u64,
}

impl ExecutionMeter {
    pub fn new(performance: &PerformanceConfig) -> Self {
        Self {
            memory_bytes: AtomicU64::new(0),
            loop_iterations: AtomicU64::new(0),
            call_depth: AtomicU32::new(0),
            max_call_depth: AtomicU32::new(0),
            function_calls: AtomicU64::new(0),
            max_call_stack_depth: performance.max_call_stack_depth,
            max_loop_iterations: performance.max_loop_iterations,
        }
    }

    /// Record an allocation. The counter only grows; freed values are not
    /// subtracted, which keeps the limit deterministic for a given program.
    pub fn add_memory(&self, bytes: u64) {
        self.memory_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes.load(Ordering::Relaxed)
    }

    /// One loop iteration. Errors when the iteration ceiling is crossed.
    pub fn loop_tick(&self) -> Result<(), SandboxError> {
        let count = self.loop_iterations.fetch_add(1, Ordering::Relaxed) + 1;
        if count > self.max_loop_iterations {
            return Err(SandboxError::resource_limit(format!(
                "loop iteration ceiling ({}) exceeded",
                self.max_loop_iterations
            )));
        }
        Ok(())
    }

    /// Entering a script function call. Errors past the depth ceiling.
    pub fn enter_call(&self) -> Result<(), SandboxError> {
        self.function_calls.fetch_add(1, Ordering::Relaxed);
        let depth = self.call_depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_call_depth.fetch_max(depth, Ordering::Relaxed);
        if depth > self.max_call_stack_depth {
            return Err(SandboxError::resource_limit(format!(
                "call stack depth ceiling ({}) exceeded",
                self.max_call_stack_depth
            )));
        }
        Ok(())
    }

    pub fn exit_call(&self) {
        self.call_depth.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, elapsed: Duration) -> ResourceUsageStats {
        ResourceUsageStats {
            memory_bytes: self.memory_bytes.load(Ordering::Relaxed),
            execution_time: elapsed,
            cpu_usage: None,
            call_stack_depth: self.max_call_depth.load(Ordering::Relaxed),
            loop_iterations: self.loop_iterations.load(Ordering::Relaxed),
            function_calls: Some(self.function_calls.load(Ordering::Relaxed)),
        }
    }
}

/// Sampling task observing one execution.
pub struct ResourceMonitor {
    handle: tokio::task::JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
    meter: Arc<ExecutionMeter>,
    started: Instant,
}

impl ResourceMonitor {
    /// Start observing. The returned monitor must be [`finish`]ed once the
    /// isolate returns, to stop the sampler and collect final stats.
    ///
    /// [`finish`]: ResourceMonitor::finish
    pub fn watch(
        meter: Arc<ExecutionMeter>,
        basic: &BasicConfig,
        performance: &PerformanceConfig,
        interrupt: InterruptHandle,
        sink: EventSink,
        execution_id: ExecutionId,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let started = Instant::now();
        let deadline = started + basic.timeout;
        let timeout = basic.timeout;
        let max_memory = basic.max_memory_bytes;
        let memory_warning = performance.memory_warning_bytes;
        let time_warning = performance.execution_time_warning;
        let sampling = performance.sampling_interval;

        let task_meter = meter.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sampling);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut memory_warned = false;
            let mut time_warned = false;

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep_until(deadline) => {
                        tracing::debug!(execution_id = %execution_id, "wall-clock deadline reached");
                        interrupt.interrupt(InterruptReason::Timeout);
                        break;
                    }
                    _ = interval.tick() => {
                        let elapsed = started.elapsed();
                        let stats = task_meter.snapshot(elapsed);

                        sink(
                            MonitoringEvent::new(MonitoringEventType::ResourceUsage)
                                .for_execution(execution_id)
                                .with_data(serde_json::to_value(&stats).unwrap_or_default()),
                        );

                        if !memory_warned && stats.memory_bytes >= memory_warning {
                            memory_warned = true;
                            sink(
                                MonitoringEvent::new(MonitoringEventType::PerformanceWarning)
                                    .for_execution(execution_id)
                                    .with_message(format!(
                                        "memory usage {} bytes crossed the warning threshold {}",
                                        stats.memory_bytes, memory_warning
                                    )),
                            );
                        }
                        if !time_warned && elapsed >= time_warning {
                            time_warned = true;
                            sink(
                                MonitoringEvent::new(MonitoringEventType::PerformanceWarning)
                                    .for_execution(execution_id)
                                    .with_message(format!(
                                        "execution time {}ms crossed the warning threshold {}ms",
                                        elapsed.as_millis(),
                                        time_warning.as_millis()
                                    )),
                            );
                        }

                        if stats.memory_bytes >= max_memory {
                            tracing::debug!(execution_id = %execution_id, "memory ceiling reached");
                            interrupt.interrupt(InterruptReason::MemoryLimit);
                            break;
                        }
                        if elapsed >= timeout {
                            interrupt.interrupt(InterruptReason::Timeout);
                            break;
                        }
                    }
                }
            }
        });

        Self {
            handle,
            stop_tx,
            meter,
            started,
        }
    }

    /// Stop sampling and return the final usage snapshot.
    pub async fn finish(self) -> ResourceUsageStats {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
        self.meter.snapshot(self.started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_common::SandboxErrorType;

    fn meter(max_depth: u32, max_loops: u64) -> ExecutionMeter {
        ExecutionMeter::new(&PerformanceConfig {
            max_call_stack_depth: max_depth,
            max_loop_iterations: max_loops,
            ..PerformanceConfig::default()
        })
    }

    #[test]
    fn test_loop_ceiling() {
        let meter = meter(8, 3);
        assert!(meter.loop_tick().is_ok());
        assert!(meter.loop_tick().is_ok());
        assert!(meter.loop_tick().is_ok());
        let err = meter.loop_tick().unwrap_err();
        assert_eq!(err.kind, SandboxErrorType::ResourceLimit);
    }

    #[test]
    fn test_call_depth_ceiling_and_peak() {
        let meter = meter(2, 100);
        meter.enter_call().unwrap();
        meter.enter_call().unwrap();
        assert!(meter.enter_call().is_err());
        meter.exit_call();
        meter.exit_call();
        meter.exit_call();
        let stats = meter.snapshot(Duration::ZERO);
        assert_eq!(stats.call_stack_depth, 3);
        assert_eq!(stats.function_calls, Some(3));
    }

    #[test]
    fn test_accumulate_is_monotonic() {
        let mut total = ResourceUsageStats::default();
        let run = ResourceUsageStats {
            memory_bytes: 100,
            execution_time: Duration::from_millis(10),
            call_stack_depth: 4,
            loop_iterations: 7,
            function_calls: Some(2),
            cpu_usage: None,
        };
        total.accumulate(&run);
        total.accumulate(&run);
        assert_eq!(total.memory_bytes, 200);
        assert_eq!(total.execution_time, Duration::from_millis(20));
        assert_eq!(total.call_stack_depth, 4);
        assert_eq!(total.loop_iterations, 14);
        assert_eq!(total.function_calls, Some(4));
    }

    #[tokio::test]
    async fn test_monitor_fires_timeout_interrupt() {
        let meter = Arc::new(ExecutionMeter::new(&PerformanceConfig::default()));
        let basic = BasicConfig {
            timeout: Duration::from_millis(30),
            ..BasicConfig::default()
        };
        let interrupt = InterruptHandle::new();
        let sink: EventSink = Arc::new(|_| {});
        let monitor = ResourceMonitor::watch(
            meter,
            &basic,
            &PerformanceConfig::default(),
            interrupt.clone(),
            sink,
            ExecutionId::new(),
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(interrupt.reason(), Some(InterruptReason::Timeout));
        let stats = monitor.finish().await;
        assert!(stats.execution_time >= Duration::from_millis(30));
    }
}
