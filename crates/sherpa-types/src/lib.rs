use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Lifecycle state of a supervised module.
///
/// Every module is in exactly one of these five states at all times.
/// Transitions are driven by the module handle in `sherpa-kernel`;
/// [`ModuleState::Error`] is not terminal – a restart from it is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    /// Registered with the supervisor but never started.
    Registered,
    /// Initialised and running.
    Active,
    /// Temporarily paused; can only be entered from [`ModuleState::Active`].
    Suspended,
    /// Cleanly shut down.
    Stopped,
    /// A hook fault occurred; the last error is recorded on the module.
    Error,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleState::Registered => "registered",
            ModuleState::Active => "active",
            ModuleState::Suspended => "suspended",
            ModuleState::Stopped => "stopped",
            ModuleState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Derived health score in `[0, 100]`.
///
/// A pure function of the module's error count: each recorded fault costs
/// ten points, floored at zero. Recomputed on every status read, never
/// stored on the live module.
pub fn health_score(error_count: u32) -> u8 {
    100u32.saturating_sub(error_count.saturating_mul(10)).min(100) as u8
}

/// Immutable point-in-time status of a single module.
///
/// Produced by the module handle on demand; `health_score` is always the
/// live-computed value for the captured `error_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub name: String,
    pub state: ModuleState,
    pub version: String,
    /// Wall-clock time of the last successful start, cleared on stop.
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_update: DateTime<Utc>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub health_score: u8,
    /// Open string-keyed map merged by config injection.
    pub custom_info: BTreeMap<String, Value>,
}

/// Immutable aggregate capture of every module's status at one instant.
///
/// Serialized as the durable runtime-state file. A loaded snapshot carries
/// display data only; it never reconstructs live modules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub modules: BTreeMap<String, ModuleStatus>,
    pub module_count: usize,
    pub active_count: usize,
    pub suspended_count: usize,
    pub error_count: usize,
}

/// Aggregate health classification of the whole module set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthVerdict {
    /// No module in error and average health score above 80.
    Healthy,
    /// Errored modules are a minority (fewer than half).
    Degraded,
    /// Errored modules are half or more of the total.
    Critical,
}

impl fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthVerdict::Healthy => "healthy",
            HealthVerdict::Degraded => "degraded",
            HealthVerdict::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// System-level health report computed from all module statuses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub verdict: HealthVerdict,
    pub total_modules: usize,
    pub active_modules: usize,
    pub suspended_modules: usize,
    pub stopped_modules: usize,
    pub error_modules: usize,
    pub average_health_score: f64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
}

/// Supervision error spanning lookup failures, dependency resolution
/// faults, contained hook faults, and persistence failures.
///
/// This is the only error type that crosses the supervision boundary;
/// hook faults never propagate as panics or foreign error types.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("module '{0}' is not registered")]
    ModuleNotFound(String),

    #[error("module '{module}' depends on unregistered module '{dependency}'")]
    DependencyMissing { module: String, dependency: String },

    #[error("dependency '{dependency}' of module '{module}' failed to start")]
    DependencyFailed { module: String, dependency: String },

    #[error("circular dependency detected while resolving '{module}': {chain}")]
    CycleDetected { module: String, chain: String },

    #[error("{op} hook of module '{module}' failed: {details}")]
    HookFault {
        module: String,
        op: &'static str,
        details: String,
    },

    #[error("module '{module}' cannot {op} from state '{from}'")]
    InvalidTransition {
        module: String,
        from: ModuleState,
        op: &'static str,
    },

    #[error("runtime state persistence failed: {0}")]
    Persistence(String),
}
