//! Sandbox manager: instance lifecycle, execution routing, event fan-out
//! and the periodic cleanup sweep.

use crate::config::{
    ExtendedSandboxConfig, GlobalSandboxSettings, PartialSandboxConfig, SandboxConfigType,
    SandboxFactoryOptions,
};
use crate::events::EventBus;
use crate::execution::{CodeExecutionContext, ExecutionEngine};
use crate::monitor::ResourceUsageStats;
use crate::policy::CapabilitySet;
use crate::runtime::{InterpIsolate, InterruptHandle, InterruptReason, Isolate};
use chrono::{DateTime, Utc};
use corral_common::{
    ExecutionId, InstanceId, ListenerId, MonitoringEventListener, SandboxError,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// How long `destroy_sandbox` waits for a cancelled execution to settle
/// before reporting the leak to the global error handler.
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// One running or idle sandbox instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInstanceState {
    pub instance_id: InstanceId,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// True while an execution is in flight.
    pub is_active: bool,
    pub execution_count: u64,
    /// Running accumulation across all executions of this instance; reset
    /// only by destroying the instance.
    pub total_resource_usage: ResourceUsageStats,
    pub error_count: u64,
    pub config: ExtendedSandboxConfig,
}

struct InstanceHandle {
    config_type: SandboxConfigType,
    state: RwLock<SandboxInstanceState>,
    capabilities: Arc<CapabilitySet>,
    /// Serializes executions within one instance.
    exec_lock: Mutex<()>,
    /// Interrupt handle of the in-flight execution, for destroy-time
    /// cancellation.
    current_interrupt: std::sync::Mutex<Option<InterruptHandle>>,
}

/// Top-level facade over the sandbox pipeline.
///
/// Instances run concurrently; one instance's executions are serialized so
/// its counters update atomically. All handles are shared, so the manager
/// is cheap to clone.
#[derive(Clone)]
pub struct SandboxManager {
    engine: Arc<ExecutionEngine>,
    events: EventBus,
    settings: GlobalSandboxSettings,
    instances: Arc<RwLock<HashMap<InstanceId, Arc<InstanceHandle>>>>,
    /// Terminal contexts, retained until the owning instance goes away.
    executions: Arc<RwLock<HashMap<ExecutionId, CodeExecutionContext>>>,
}

impl Default for SandboxManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxManager {
    /// Manager backed by the built-in interpreter isolate.
    pub fn new() -> Self {
        Self::with_isolate(Arc::new(InterpIsolate::new()))
    }

    /// Manager backed by a custom isolation primitive.
    pub fn with_isolate(isolate: Arc<dyn Isolate>) -> Self {
        Self {
            engine: Arc::new(ExecutionEngine::new(isolate)),
            events: EventBus::new(),
            settings: GlobalSandboxSettings::current(),
            instances: Arc::new(RwLock::new(HashMap::new())),
            executions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Override the process-wide settings for this manager.
    pub fn with_settings(mut self, settings: GlobalSandboxSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Create an instance from the `Basic` preset plus overrides.
    pub async fn create_sandbox(
        &self,
        custom: Option<PartialSandboxConfig>,
    ) -> crate::Result<InstanceId> {
        self.create_sandbox_with_type(SandboxConfigType::Basic, custom)
            .await
    }

    /// Create an instance from a preset plus overrides. The custom rules
    /// are compiled here, so a bad pattern fails creation, not execution.
    pub async fn create_sandbox_with_type(
        &self,
        config_type: SandboxConfigType,
        custom: Option<PartialSandboxConfig>,
    ) -> crate::Result<InstanceId> {
        let mut config = ExtendedSandboxConfig::preset(config_type);
        // Basic/Custom take their quantitative baseline from the
        // process-wide settings; the named presets carry their own.
        if matches!(
            config_type,
            SandboxConfigType::Basic | SandboxConfigType::Custom
        ) {
            config.basic.timeout = self.settings.default_timeout;
            config.basic.max_memory_bytes = self.settings.default_max_memory_bytes;
        }
        if let Some(custom) = custom {
            config = config.merged_with(custom);
        }
        let capabilities = Arc::new(CapabilitySet::resolve(
            &config.security.policy,
            &config.basic,
        )?);

        let instance_id = InstanceId::new();
        let now = Utc::now();
        let handle = Arc::new(InstanceHandle {
            config_type,
            state: RwLock::new(SandboxInstanceState {
                instance_id,
                created_at: now,
                last_active_at: now,
                is_active: false,
                execution_count: 0,
                total_resource_usage: ResourceUsageStats::default(),
                error_count: 0,
                config,
            }),
            capabilities,
            exec_lock: Mutex::new(()),
            current_interrupt: std::sync::Mutex::new(None),
        });

        self.instances.write().await.insert(instance_id, handle);
        tracing::info!(instance_id = %instance_id, config_type = ?config_type, "sandbox instance created");
        Ok(instance_id)
    }

    /// Create (or, with the pool hint, reuse) an instance from
    /// caller-facing factory options.
    pub async fn create_from_options(
        &self,
        options: SandboxFactoryOptions,
    ) -> crate::Result<InstanceId> {
        if options.reuse_idle_instance && options.custom_config.is_none() {
            let instances = self.instances.read().await;
            for (id, handle) in instances.iter() {
                if handle.config_type != options.config_type {
                    continue;
                }
                if let Ok(state) = handle.state.try_read() {
                    if !state.is_active {
                        tracing::debug!(instance_id = %id, "reusing idle sandbox instance");
                        return Ok(*id);
                    }
                }
            }
        }
        self.create_sandbox_with_type(options.config_type, options.custom_config)
            .await
    }

    /// Execute one code submission on an instance.
    ///
    /// Unknown or destroyed instances are rejected immediately; everything
    /// else resolves to a terminal [`CodeExecutionContext`], success or
    /// failure.
    pub async fn execute_code(
        &self,
        instance_id: InstanceId,
        code: impl Into<String>,
        context: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<CodeExecutionContext, SandboxError> {
        let handle = self
            .instances
            .read()
            .await
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| {
                SandboxError::runtime(format!("unknown sandbox instance {}", instance_id))
            })?;

        let _guard = handle.exec_lock.lock().await;

        // The instance may have been destroyed while we waited our turn.
        if !self.instances.read().await.contains_key(&instance_id) {
            return Err(SandboxError::runtime(format!(
                "sandbox instance {} was destroyed",
                instance_id
            )));
        }

        let config = handle.state.read().await.config.clone();
        {
            let mut state = handle.state.write().await;
            state.is_active = true;
            state.last_active_at = Utc::now();
        }

        let interrupt = InterruptHandle::new();
        *handle
            .current_interrupt
            .lock()
            .expect("interrupt slot poisoned") = Some(interrupt.clone());

        let mut ctx = CodeExecutionContext::new(ExecutionId::new(), instance_id, code);
        let sink = self.events.sink_for(config.monitoring.clone());
        let stats = self
            .engine
            .execute(
                &mut ctx,
                &config,
                handle.capabilities.clone(),
                sink,
                interrupt,
                context.unwrap_or_default(),
            )
            .await;

        *handle
            .current_interrupt
            .lock()
            .expect("interrupt slot poisoned") = None;

        {
            let mut state = handle.state.write().await;
            state.is_active = false;
            state.execution_count += 1;
            state.last_active_at = Utc::now();
            state.total_resource_usage.accumulate(&stats);
            if ctx.error.is_some() {
                state.error_count += 1;
            }
        }

        // Retain the terminal context unless the instance vanished mid-run.
        if self.instances.read().await.contains_key(&instance_id) {
            self.executions
                .write()
                .await
                .insert(ctx.execution_id, ctx.clone());
        }

        Ok(ctx)
    }

    /// Destroy an instance, cancelling any in-flight execution first.
    /// Idempotent: destroying an absent instance returns `false`.
    pub async fn destroy_sandbox(&self, instance_id: InstanceId) -> bool {
        let handle = self.instances.write().await.remove(&instance_id);
        let Some(handle) = handle else {
            return false;
        };

        let in_flight = handle
            .current_interrupt
            .lock()
            .expect("interrupt slot poisoned")
            .clone();
        if let Some(interrupt) = in_flight {
            interrupt.interrupt(InterruptReason::Cancelled);
            if tokio::time::timeout(TEARDOWN_GRACE, handle.exec_lock.lock())
                .await
                .is_err()
            {
                let error = SandboxError::runtime(format!(
                    "instance {} teardown timed out with an execution still in flight",
                    instance_id
                ));
                tracing::warn!(instance_id = %instance_id, "teardown grace period expired");
                if let Some(handler) = &self.settings.global_error_handler {
                    handler(&error);
                }
            }
        }

        self.executions
            .write()
            .await
            .retain(|_, ctx| ctx.instance_id != instance_id);
        tracing::info!(instance_id = %instance_id, "sandbox instance destroyed");
        true
    }

    pub async fn get_instance_state(&self, instance_id: InstanceId) -> Option<SandboxInstanceState> {
        let instances = self.instances.read().await;
        let handle = instances.get(&instance_id)?.clone();
        drop(instances);
        let state = handle.state.read().await.clone();
        Some(state)
    }

    pub async fn get_all_instances(&self) -> Vec<SandboxInstanceState> {
        let handles: Vec<Arc<InstanceHandle>> =
            self.instances.read().await.values().cloned().collect();
        let mut states = Vec::with_capacity(handles.len());
        for handle in handles {
            states.push(handle.state.read().await.clone());
        }
        states
    }

    /// A retained terminal context by id.
    pub async fn get_execution(&self, execution_id: ExecutionId) -> Option<CodeExecutionContext> {
        self.executions.read().await.get(&execution_id).cloned()
    }

    /// Remove instances idle longer than the configured cleanup interval.
    /// Instances with an execution in flight are never reaped. Returns the
    /// number of instances removed.
    pub async fn cleanup(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.settings.cleanup_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let mut reaped = Vec::new();
        {
            let mut instances = self.instances.write().await;
            let ids: Vec<InstanceId> = instances.keys().copied().collect();
            for id in ids {
                let Some(handle) = instances.get(&id) else {
                    continue;
                };
                let idle = match handle.state.try_read() {
                    Ok(state) => !state.is_active && state.last_active_at < cutoff,
                    Err(_) => false,
                };
                if idle {
                    instances.remove(&id);
                    reaped.push(id);
                }
            }
        }

        if !reaped.is_empty() {
            let reaped_set: HashSet<InstanceId> = reaped.iter().copied().collect();
            self.executions
                .write()
                .await
                .retain(|_, ctx| !reaped_set.contains(&ctx.instance_id));
            tracing::info!(reaped = reaped.len(), "cleanup sweep removed idle instances");
        }
        reaped.len()
    }

    pub fn add_event_listener(&self, listener: MonitoringEventListener) -> ListenerId {
        self.events.add_listener(listener)
    }

    pub fn remove_event_listener(&self, listener_id: ListenerId) -> bool {
        self.events.remove_listener(listener_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PartialBasicConfig, PerformanceConfig};
    use crate::execution::ExecutionStatus;
    use corral_common::{MonitoringEventType, SandboxErrorType};
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn test_execute_simple_expression() {
        let manager = SandboxManager::new();
        let id = manager.create_sandbox(None).await.unwrap();
        let ctx = manager.execute_code(id, "1 + 1", None).await.unwrap();
        assert_eq!(ctx.status, ExecutionStatus::Success);
        assert_eq!(ctx.result, Some(serde_json::json!(2)));

        let state = manager.get_instance_state(id).await.unwrap();
        assert_eq!(state.execution_count, 1);
        assert_eq!(state.error_count, 0);
    }

    #[tokio::test]
    async fn test_unknown_instance_is_rejected() {
        let manager = SandboxManager::new();
        let err = manager
            .execute_code(InstanceId::new(), "1", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, SandboxErrorType::RuntimeError);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let manager = SandboxManager::new();
        let id = manager.create_sandbox(None).await.unwrap();
        assert!(manager.destroy_sandbox(id).await);
        assert!(!manager.destroy_sandbox(id).await);
        assert!(manager.get_instance_state(id).await.is_none());
    }

    #[tokio::test]
    async fn test_get_all_instances() {
        let manager = SandboxManager::new();
        let a = manager.create_sandbox(None).await.unwrap();
        let b = manager
            .create_sandbox_with_type(SandboxConfigType::Secure, None)
            .await
            .unwrap();

        let states = manager.get_all_instances().await;
        assert_eq!(states.len(), 2);
        let ids: Vec<InstanceId> = states.iter().map(|s| s.instance_id).collect();
        assert!(ids.contains(&a));
        assert!(ids.contains(&b));
    }

    #[tokio::test]
    async fn test_forbidden_access_increments_error_count() {
        let manager = SandboxManager::new();
        let id = manager
            .create_sandbox_with_type(SandboxConfigType::Restricted, None)
            .await
            .unwrap();
        let ctx = manager
            .execute_code(id, "fetch('https://example.com')", None)
            .await
            .unwrap();
        assert_eq!(ctx.status, ExecutionStatus::Failed);
        assert_eq!(ctx.error.unwrap().kind, SandboxErrorType::ForbiddenAccess);

        let state = manager.get_instance_state(id).await.unwrap();
        assert_eq!(state.error_count, 1);
        assert_eq!(state.execution_count, 1);
    }

    #[tokio::test]
    async fn test_resource_accumulation_is_deterministic() {
        let manager = SandboxManager::new();
        let id = manager.create_sandbox(None).await.unwrap();
        let code = "let s = 'aaaaaaaa' + 'bbbbbbbb'; s.length";

        let first = manager.execute_code(id, code, None).await.unwrap();
        let second = manager.execute_code(id, code, None).await.unwrap();
        let per_run = first.memory_bytes.unwrap();
        assert_eq!(second.memory_bytes.unwrap(), per_run);

        let state = manager.get_instance_state(id).await.unwrap();
        assert_eq!(state.total_resource_usage.memory_bytes, per_run * 2);
        assert_eq!(state.execution_count, 2);
    }

    #[tokio::test]
    async fn test_listener_sees_start_and_complete_in_order() {
        let manager = SandboxManager::new();
        let seen: Arc<StdMutex<Vec<MonitoringEventType>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let listener_id = manager.add_event_listener(Arc::new(move |event| {
            seen_clone.lock().unwrap().push(event.event_type);
        }));

        let id = manager.create_sandbox(None).await.unwrap();
        manager.execute_code(id, "2 + 2", None).await.unwrap();

        let events = seen.lock().unwrap().clone();
        assert_eq!(events.first(), Some(&MonitoringEventType::ExecutionStart));
        assert_eq!(
            events.last(),
            Some(&MonitoringEventType::ExecutionComplete)
        );

        assert!(manager.remove_event_listener(listener_id));
    }

    #[tokio::test]
    async fn test_destroy_cancels_in_flight_execution() {
        let manager = SandboxManager::new();
        let id = manager
            .create_sandbox(Some(PartialSandboxConfig {
                basic: Some(PartialBasicConfig {
                    timeout: Some(Duration::from_secs(30)),
                    ..PartialBasicConfig::default()
                }),
                performance: Some(PerformanceConfig {
                    max_loop_iterations: u64::MAX,
                    ..PerformanceConfig::default()
                }),
                ..PartialSandboxConfig::default()
            }))
            .await
            .unwrap();

        let runner = manager.clone();
        let task =
            tokio::spawn(async move { runner.execute_code(id, "while (true) {}", None).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.destroy_sandbox(id).await);

        let ctx = task.await.unwrap().unwrap();
        assert_eq!(ctx.status, ExecutionStatus::Cancelled);
        assert!(manager.get_execution(ctx.execution_id).await.is_none());
    }

    #[tokio::test]
    async fn test_settings_provide_basic_defaults() {
        let manager = SandboxManager::new().with_settings(GlobalSandboxSettings {
            default_timeout: Duration::from_millis(1234),
            default_max_memory_bytes: 1024 * 1024,
            ..GlobalSandboxSettings::default()
        });
        let id = manager.create_sandbox(None).await.unwrap();
        let state = manager.get_instance_state(id).await.unwrap();
        assert_eq!(state.config.basic.timeout, Duration::from_millis(1234));
        assert_eq!(state.config.basic.max_memory_bytes, 1024 * 1024);

        // named presets keep their own limits
        let id = manager
            .create_sandbox_with_type(SandboxConfigType::Restricted, None)
            .await
            .unwrap();
        let state = manager.get_instance_state(id).await.unwrap();
        assert_eq!(state.config.basic.timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cleanup_reaps_idle_instances() {
        let manager = SandboxManager::new().with_settings(GlobalSandboxSettings {
            cleanup_interval: Duration::ZERO,
            ..GlobalSandboxSettings::default()
        });
        let id = manager.create_sandbox(None).await.unwrap();
        manager.execute_code(id, "1", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(manager.cleanup().await, 1);
        assert!(manager.get_instance_state(id).await.is_none());
    }

    #[tokio::test]
    async fn test_executions_are_retained_until_destroy() {
        let manager = SandboxManager::new();
        let id = manager.create_sandbox(None).await.unwrap();
        let ctx = manager.execute_code(id, "40 + 2", None).await.unwrap();

        let retained = manager.get_execution(ctx.execution_id).await.unwrap();
        assert_eq!(retained.result, Some(serde_json::json!(42)));

        manager.destroy_sandbox(id).await;
        assert!(manager.get_execution(ctx.execution_id).await.is_none());
    }

    #[tokio::test]
    async fn test_factory_reuses_idle_instance() {
        let manager = SandboxManager::new();
        let first = manager
            .create_from_options(SandboxFactoryOptions {
                config_type: SandboxConfigType::Secure,
                custom_config: None,
                reuse_idle_instance: false,
            })
            .await
            .unwrap();
        let second = manager
            .create_from_options(SandboxFactoryOptions {
                config_type: SandboxConfigType::Secure,
                custom_config: None,
                reuse_idle_instance: true,
            })
            .await
            .unwrap();
        assert_eq!(first, second);

        let third = manager
            .create_from_options(SandboxFactoryOptions {
                config_type: SandboxConfigType::Restricted,
                custom_config: None,
                reuse_idle_instance: true,
            })
            .await
            .unwrap();
        assert_ne!(first, third);
    }
}
