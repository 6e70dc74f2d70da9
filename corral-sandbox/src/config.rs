//! Sandbox configuration: per-instance config sections, preset types,
//! partial-config merging, and process-wide settings.

use crate::policy::SecurityPolicy;
use corral_common::GlobalErrorHandler;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Identifier and quantitative limits for one sandbox instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicConfig {
    /// Global identifiers the script may reference even when a custom rule
    /// or base permission level would otherwise apply.
    #[serde(default)]
    pub allowed_globals: Vec<String>,

    /// Global identifiers denied unconditionally, before any rule runs.
    #[serde(default)]
    pub forbidden_globals: Vec<String>,

    /// Whether the script may use `console`.
    pub enable_console: bool,

    /// Whether the script may use `setTimeout`/`setInterval`.
    pub enable_timers: bool,

    /// Hard wall-clock deadline for one execution.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Reject assignments to undeclared identifiers.
    pub strict_mode: bool,

    /// Values exposed to the script as global bindings.
    #[serde(default)]
    pub injected_globals: HashMap<String, serde_json::Value>,

    /// Whether the `document` surface is exposed at all.
    pub enable_dom: bool,

    /// Hard memory ceiling for one execution.
    pub max_memory_bytes: u64,
}

impl Default for BasicConfig {
    fn default() -> Self {
        Self {
            allowed_globals: Vec::new(),
            forbidden_globals: Vec::new(),
            enable_console: true,
            enable_timers: true,
            timeout: Duration::from_secs(5),
            strict_mode: false,
            injected_globals: HashMap::new(),
            enable_dom: false,
            max_memory_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Sampling cadence, warning thresholds and hard ceilings for the
/// resource monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// How often the monitor samples resource usage.
    #[serde(with = "humantime_serde")]
    pub sampling_interval: Duration,

    /// Crossing this emits a performance warning, nothing more.
    pub memory_warning_bytes: u64,

    /// Crossing this emits a performance warning, nothing more.
    #[serde(with = "humantime_serde")]
    pub execution_time_warning: Duration,

    /// Hard ceiling on call-stack depth.
    pub max_call_stack_depth: u32,

    /// Hard ceiling on total loop iterations across one execution.
    pub max_loop_iterations: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            sampling_interval: Duration::from_millis(25),
            memory_warning_bytes: 16 * 1024 * 1024,
            execution_time_warning: Duration::from_secs(2),
            max_call_stack_depth: 256,
            max_loop_iterations: 1_000_000,
        }
    }
}

/// Which monitoring-event categories are delivered to listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub execution_events: bool,
    pub performance_warnings: bool,
    pub security_events: bool,
    pub resource_usage: bool,
    pub error_events: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            execution_events: true,
            performance_warnings: true,
            security_events: true,
            resource_usage: true,
            error_events: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Diagnostics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    pub log_level: DebugLogLevel,
    pub enable_source_maps: bool,
    /// Include script stack traces in error payloads.
    pub enable_stack_traces: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: DebugLogLevel::Info,
            enable_source_maps: false,
            enable_stack_traces: false,
        }
    }
}

/// Security policy plus static-analysis disposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySection {
    #[serde(default)]
    pub policy: SecurityPolicy,

    /// Whether a critical static-analysis finding blocks execution before
    /// a context is started. Defaults to blocking.
    #[serde(default = "default_true")]
    pub block_critical_static_risks: bool,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            policy: SecurityPolicy::default(),
            block_critical_static_risks: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Full configuration of one sandbox instance. Immutable once attached;
/// changing policy means creating a new instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtendedSandboxConfig {
    #[serde(default)]
    pub basic: BasicConfig,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

/// Preset families a partial config is merged over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxConfigType {
    Basic,
    Secure,
    Restricted,
    Development,
    Production,
    Custom,
}

impl Default for SandboxConfigType {
    fn default() -> Self {
        SandboxConfigType::Basic
    }
}

impl ExtendedSandboxConfig {
    /// Defaults for a preset family.
    pub fn preset(kind: SandboxConfigType) -> Self {
        match kind {
            SandboxConfigType::Basic | SandboxConfigType::Custom => Self {
                security: SecuritySection {
                    policy: SecurityPolicy::standard(),
                    ..SecuritySection::default()
                },
                ..Self::default()
            },
            SandboxConfigType::Secure => Self {
                basic: BasicConfig {
                    enable_timers: false,
                    strict_mode: true,
                    timeout: Duration::from_secs(3),
                    max_memory_bytes: 16 * 1024 * 1024,
                    ..BasicConfig::default()
                },
                security: SecuritySection {
                    policy: SecurityPolicy::locked_down(),
                    ..SecuritySection::default()
                },
                ..Self::default()
            },
            SandboxConfigType::Restricted => Self {
                basic: BasicConfig {
                    enable_console: false,
                    enable_timers: false,
                    strict_mode: true,
                    timeout: Duration::from_secs(1),
                    max_memory_bytes: 8 * 1024 * 1024,
                    ..BasicConfig::default()
                },
                security: SecuritySection {
                    policy: SecurityPolicy::locked_down(),
                    ..SecuritySection::default()
                },
                performance: PerformanceConfig {
                    memory_warning_bytes: 4 * 1024 * 1024,
                    execution_time_warning: Duration::from_millis(500),
                    max_call_stack_depth: 64,
                    max_loop_iterations: 100_000,
                    ..PerformanceConfig::default()
                },
                ..Self::default()
            },
            SandboxConfigType::Development => Self {
                basic: BasicConfig {
                    timeout: Duration::from_secs(30),
                    max_memory_bytes: 256 * 1024 * 1024,
                    enable_dom: true,
                    ..BasicConfig::default()
                },
                security: SecuritySection {
                    policy: SecurityPolicy::permissive(),
                    ..SecuritySection::default()
                },
                performance: PerformanceConfig {
                    memory_warning_bytes: 128 * 1024 * 1024,
                    execution_time_warning: Duration::from_secs(10),
                    max_call_stack_depth: 1024,
                    max_loop_iterations: 10_000_000,
                    ..PerformanceConfig::default()
                },
                debug: DebugConfig {
                    log_level: DebugLogLevel::Debug,
                    enable_stack_traces: true,
                    ..DebugConfig::default()
                },
                ..Self::default()
            },
            SandboxConfigType::Production => Self {
                basic: BasicConfig {
                    enable_console: false,
                    timeout: Duration::from_secs(5),
                    max_memory_bytes: 64 * 1024 * 1024,
                    ..BasicConfig::default()
                },
                security: SecuritySection {
                    policy: SecurityPolicy::standard(),
                    ..SecuritySection::default()
                },
                debug: DebugConfig {
                    log_level: DebugLogLevel::Warn,
                    ..DebugConfig::default()
                },
                ..Self::default()
            },
        }
    }

    /// Merge a partial config over this one. Partial fields win.
    pub fn merged_with(mut self, partial: PartialSandboxConfig) -> Self {
        if let Some(basic) = partial.basic {
            basic.apply(&mut self.basic);
        }
        if let Some(security) = partial.security {
            self.security = security;
        }
        if let Some(performance) = partial.performance {
            self.performance = performance;
        }
        if let Some(monitoring) = partial.monitoring {
            self.monitoring = monitoring;
        }
        if let Some(debug) = partial.debug {
            self.debug = debug;
        }
        self
    }
}

/// Field-level overrides for [`BasicConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialBasicConfig {
    pub allowed_globals: Option<Vec<String>>,
    pub forbidden_globals: Option<Vec<String>>,
    pub enable_console: Option<bool>,
    pub enable_timers: Option<bool>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    pub strict_mode: Option<bool>,
    pub injected_globals: Option<HashMap<String, serde_json::Value>>,
    pub enable_dom: Option<bool>,
    pub max_memory_bytes: Option<u64>,
}

impl PartialBasicConfig {
    fn apply(self, target: &mut BasicConfig) {
        if let Some(v) = self.allowed_globals {
            target.allowed_globals = v;
        }
        if let Some(v) = self.forbidden_globals {
            target.forbidden_globals = v;
        }
        if let Some(v) = self.enable_console {
            target.enable_console = v;
        }
        if let Some(v) = self.enable_timers {
            target.enable_timers = v;
        }
        if let Some(v) = self.timeout {
            target.timeout = v;
        }
        if let Some(v) = self.strict_mode {
            target.strict_mode = v;
        }
        if let Some(v) = self.injected_globals {
            target.injected_globals = v;
        }
        if let Some(v) = self.enable_dom {
            target.enable_dom = v;
        }
        if let Some(v) = self.max_memory_bytes {
            target.max_memory_bytes = v;
        }
    }
}

/// Overrides supplied to `create_sandbox`, merged over a preset.
///
/// `basic` merges field by field; the remaining sections replace the
/// preset section wholesale (a security policy is one declarative unit).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialSandboxConfig {
    pub basic: Option<PartialBasicConfig>,
    pub security: Option<SecuritySection>,
    pub performance: Option<PerformanceConfig>,
    pub monitoring: Option<MonitoringConfig>,
    pub debug: Option<DebugConfig>,
}

/// Creation options consumed from the embedding document/editor.
#[derive(Clone, Default)]
pub struct SandboxFactoryOptions {
    pub config_type: SandboxConfigType,
    pub custom_config: Option<PartialSandboxConfig>,
    /// Pool hint: reuse an idle instance with the same preset instead of
    /// creating a fresh one.
    pub reuse_idle_instance: bool,
}

/// Process-wide settings with load-once/override semantics.
#[derive(Clone)]
pub struct GlobalSandboxSettings {
    pub default_timeout: Duration,
    pub default_max_memory_bytes: u64,
    /// Instances idle longer than this are removed by `cleanup()`.
    pub cleanup_interval: Duration,
    pub global_error_handler: Option<GlobalErrorHandler>,
}

impl std::fmt::Debug for GlobalSandboxSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalSandboxSettings")
            .field("default_timeout", &self.default_timeout)
            .field("default_max_memory_bytes", &self.default_max_memory_bytes)
            .field("cleanup_interval", &self.cleanup_interval)
            .field(
                "global_error_handler",
                &self.global_error_handler.as_ref().map(|_| "<handler>"),
            )
            .finish()
    }
}

impl Default for GlobalSandboxSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            default_max_memory_bytes: 32 * 1024 * 1024,
            cleanup_interval: Duration::from_secs(300),
            global_error_handler: None,
        }
    }
}

static SETTINGS: RwLock<Option<GlobalSandboxSettings>> = RwLock::new(None);

impl GlobalSandboxSettings {
    /// The installed process-wide settings, or defaults if none were
    /// installed yet.
    pub fn current() -> Self {
        SETTINGS
            .read()
            .expect("settings lock poisoned")
            .clone()
            .unwrap_or_default()
    }

    /// Install process-wide settings, replacing any previous value.
    pub fn install(settings: GlobalSandboxSettings) {
        *SETTINGS.write().expect("settings lock poisoned") = Some(settings);
    }
}
