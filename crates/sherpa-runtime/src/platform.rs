//! [`SupervisionPlatform`] – operator façade and background monitor.
//!
//! The platform owns the [`ModuleRegistry`] behind a single mutex and is
//! the one composition point of the supervision core: construct it once
//! from a [`PlatformConfig`] and pass it to whatever wires up the device
//! (no ambient global instance).
//!
//! All caller-facing operations are synchronous and delegate to the
//! registry under the mutex.  The monitor cycle runs as a tokio task at a
//! fixed interval; each tick persists the runtime snapshot and computes
//! aggregate health, and a fault inside one tick is caught and logged
//! without stopping subsequent ticks.  Because the monitor reads through
//! the same mutex callers mutate through, snapshots never observe a torn
//! intermediate registry state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use sherpa_kernel::module::Lifecycle;
use sherpa_kernel::registry::{BatchResults, ModuleRegistry, StopPolicy};
use sherpa_types::{
    HealthVerdict, ModuleState, ModuleStatus, RuntimeSnapshot, SupervisorError, SystemHealth,
};

use crate::report;

/// Upper bound on how long [`SupervisionPlatform::stop_monitor`] waits for
/// the monitor loop to observe cancellation before detaching it.
const MONITOR_STOP_TIMEOUT: Duration = Duration::from_secs(5);

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`SupervisionPlatform`].
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Where the runtime-state snapshot file is written.
    pub state_path: PathBuf,
    /// How often the background monitor persists state and checks health.
    pub monitor_interval: Duration,
    /// Pause between batch start/stop items.
    pub stagger: Duration,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("runtime_state.json"),
            monitor_interval: Duration::from_secs(30),
            stagger: Duration::from_millis(100),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SupervisionPlatform
// ────────────────────────────────────────────────────────────────────────────

struct MonitorHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Operator façade over the module registry plus the periodic monitor.
///
/// # Example
///
/// ```rust,no_run
/// use sherpa_runtime::platform::{PlatformConfig, SupervisionPlatform};
///
/// #[tokio::main]
/// async fn main() {
///     let mut platform = SupervisionPlatform::new(PlatformConfig::default());
///     platform.start_monitor();
///     // register modules, start_all, ...
///     platform.stop_monitor().await;
/// }
/// ```
pub struct SupervisionPlatform {
    registry: Arc<Mutex<ModuleRegistry>>,
    monitor_interval: Duration,
    monitor: Option<MonitorHandle>,
}

impl SupervisionPlatform {
    /// Build a platform and its registry from `config`.
    pub fn new(config: PlatformConfig) -> Self {
        let registry = ModuleRegistry::new(&config.state_path).with_stagger(config.stagger);
        info!(
            state_path = %config.state_path.display(),
            interval = ?config.monitor_interval,
            "supervision platform initialised"
        );
        Self {
            registry: Arc::new(Mutex::new(registry)),
            monitor_interval: config.monitor_interval,
            monitor: None,
        }
    }

    // ------------------------------------------------------------------
    // Registry delegation
    // ------------------------------------------------------------------

    pub fn register_module(
        &self,
        name: &str,
        version: &str,
        module: Box<dyn Lifecycle>,
        dependencies: &[&str],
    ) {
        self.registry().register(name, version, module, dependencies);
    }

    pub fn unregister_module(&self, name: &str) -> Result<(), SupervisorError> {
        self.registry().unregister(name)
    }

    pub fn start_module(&self, name: &str) -> Result<(), SupervisorError> {
        self.registry().start_module(name)
    }

    pub fn stop_module(&self, name: &str) -> Result<(), SupervisorError> {
        self.registry().stop_module(name)
    }

    pub fn stop_module_with(
        &self,
        name: &str,
        policy: StopPolicy,
    ) -> Result<(), SupervisorError> {
        self.registry().stop_module_with(name, policy)
    }

    pub fn restart_module(&self, name: &str) -> Result<(), SupervisorError> {
        self.registry().restart_module(name)
    }

    pub fn suspend_module(&self, name: &str) -> Result<(), SupervisorError> {
        self.registry().suspend_module(name)
    }

    pub fn resume_module(&self, name: &str) -> Result<(), SupervisorError> {
        self.registry().resume_module(name)
    }

    pub fn inject_config(
        &self,
        name: &str,
        config: BTreeMap<String, serde_json::Value>,
    ) -> Result<(), SupervisorError> {
        self.registry().inject_config(name, config)
    }

    pub fn module_status(&self, name: &str) -> Result<ModuleStatus, SupervisorError> {
        self.registry().module_status(name)
    }

    pub fn module_health(
        &self,
        name: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>, SupervisorError> {
        self.registry().module_health(name)
    }

    pub fn list_registered(&self) -> Vec<String> {
        self.registry().list_registered()
    }

    pub fn start_all(&self, order: Option<&[String]>) -> BatchResults {
        self.registry().start_all(order)
    }

    pub fn stop_all(&self, reverse: bool) -> BatchResults {
        self.registry().stop_all(reverse)
    }

    pub fn startup_order(&self) -> Result<Vec<String>, SupervisorError> {
        self.registry().startup_order()
    }

    pub fn all_status(&self) -> BTreeMap<String, ModuleStatus> {
        self.registry().all_status()
    }

    pub fn runtime_snapshot(&self) -> RuntimeSnapshot {
        self.registry().runtime_snapshot()
    }

    pub fn save_runtime_state(&self) -> Result<(), SupervisorError> {
        self.registry().save_runtime_state()
    }

    pub fn load_runtime_state(&self) -> Result<RuntimeSnapshot, SupervisorError> {
        self.registry().load_runtime_state()
    }

    // ------------------------------------------------------------------
    // Aggregate health
    // ------------------------------------------------------------------

    /// Classify system health from all module statuses.
    ///
    /// Healthy when no module is in error and the average health score is
    /// above 80; degraded when errored modules are fewer than half of the
    /// total; critical otherwise.  Note that an empty registry classifies
    /// as critical under this arithmetic (average 0, and 0 is not less
    /// than 0/2); preserved deliberately so "nothing supervised" is never
    /// reported as healthy.
    pub fn health_check(&self) -> SystemHealth {
        let statuses = self.registry().all_status();
        classify(&statuses)
    }

    /// Formatted operator dump of aggregate health and per-module status.
    /// Presentation only; not part of the programmatic contract.
    pub fn status_report(&self) -> String {
        let statuses = self.registry().all_status();
        let health = classify(&statuses);
        report::render(&health, &statuses)
    }

    // ------------------------------------------------------------------
    // Monitor cycle
    // ------------------------------------------------------------------

    /// Spawn the background monitor task.  Idempotent: a second call while
    /// the monitor runs is a logged no-op.  Must be called from within a
    /// tokio runtime.
    pub fn start_monitor(&mut self) {
        if self.monitor.is_some() {
            warn!("monitor already running");
            return;
        }
        let (cancel, mut cancel_rx) = watch::channel(false);
        let registry = Arc::clone(&self.registry);
        let interval = self.monitor_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => monitor_tick(&registry),
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("monitor loop exited");
        });
        self.monitor = Some(MonitorHandle { cancel, task });
        info!(interval = ?interval, "monitor started");
    }

    /// Signal the monitor loop to exit and wait for it, bounded by
    /// [`MONITOR_STOP_TIMEOUT`].  Idempotent; never blocks indefinitely.
    pub async fn stop_monitor(&mut self) {
        let Some(MonitorHandle { cancel, task }) = self.monitor.take() else {
            debug!("monitor not running; stop is a no-op");
            return;
        };
        let _ = cancel.send(true);
        if tokio::time::timeout(MONITOR_STOP_TIMEOUT, task).await.is_err() {
            warn!(timeout = ?MONITOR_STOP_TIMEOUT, "monitor did not exit in time; detaching");
        }
        info!("monitor stopped");
    }

    /// `true` while the background monitor task is installed.
    pub fn monitor_running(&self) -> bool {
        self.monitor.is_some()
    }

    // ------------------------------------------------------------------
    // Private helpers
    // ------------------------------------------------------------------

    // Module hooks are unwind-contained inside the registry, so a poisoned
    // mutex can only mean a fault in the supervision code itself; the
    // registry data is still structurally sound, recover the guard.
    fn registry(&self) -> MutexGuard<'_, ModuleRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One monitor cycle: persist the snapshot, then evaluate health.  Every
/// failure path is logged and swallowed so the loop self-heals on the next
/// tick.
fn monitor_tick(registry: &Arc<Mutex<ModuleRegistry>>) {
    let guard = registry.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(e) = guard.save_runtime_state() {
        warn!(error = %e, "monitor tick: runtime state save failed");
    }
    let statuses = guard.all_status();
    drop(guard);

    let health = classify(&statuses);
    if health.error_modules > 0 {
        warn!(
            error_modules = health.error_modules,
            verdict = %health.verdict,
            "modules in error state"
        );
    } else {
        debug!(verdict = %health.verdict, "monitor tick complete");
    }
}

pub(crate) fn classify(statuses: &BTreeMap<String, ModuleStatus>) -> SystemHealth {
    let total = statuses.len();
    let count_in = |state: ModuleState| statuses.values().filter(|s| s.state == state).count();
    let error_modules = count_in(ModuleState::Error);
    let average_health_score = if total > 0 {
        statuses.values().map(|s| s.health_score as f64).sum::<f64>() / total as f64
    } else {
        0.0
    };
    let verdict = if error_modules == 0 && average_health_score > 80.0 {
        HealthVerdict::Healthy
    } else if (error_modules as f64) < total as f64 / 2.0 {
        HealthVerdict::Degraded
    } else {
        HealthVerdict::Critical
    };
    SystemHealth {
        verdict,
        total_modules: total,
        active_modules: count_in(ModuleState::Active),
        suspended_modules: count_in(ModuleState::Suspended),
        stopped_modules: count_in(ModuleState::Stopped),
        error_modules,
        average_health_score,
        timestamp: Utc::now(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub {
        fail_init: bool,
    }

    impl Stub {
        fn ok() -> Box<Self> {
            Box::new(Self { fail_init: false })
        }
        fn failing() -> Box<Self> {
            Box::new(Self { fail_init: true })
        }
    }

    impl Lifecycle for Stub {
        fn initialize(&mut self) -> Result<(), String> {
            if self.fail_init {
                return Err("refused".to_string());
            }
            Ok(())
        }
        fn cleanup(&mut self) -> Result<(), String> {
            Ok(())
        }
    }

    fn platform_in(dir: &std::path::Path) -> SupervisionPlatform {
        SupervisionPlatform::new(PlatformConfig {
            state_path: dir.join("runtime_state.json"),
            monitor_interval: Duration::from_millis(10),
            stagger: Duration::ZERO,
        })
    }

    #[test]
    fn facade_delegates_full_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform_in(dir.path());
        platform.register_module("speech", "1.0.0", Stub::ok(), &[]);
        platform.register_module("nav", "1.0.0", Stub::ok(), &["speech"]);

        platform.start_module("nav").unwrap();
        assert_eq!(
            platform.module_status("speech").unwrap().state,
            ModuleState::Active
        );
        platform.suspend_module("nav").unwrap();
        platform.resume_module("nav").unwrap();
        platform.restart_module("nav").unwrap();
        platform.stop_module("nav").unwrap();
        platform.unregister_module("nav").unwrap();
        assert_eq!(platform.list_registered(), vec!["speech"]);
    }

    #[test]
    fn empty_platform_classifies_critical() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform_in(dir.path());
        let health = platform.health_check();
        assert_eq!(health.verdict, HealthVerdict::Critical);
        assert_eq!(health.total_modules, 0);
    }

    #[test]
    fn all_active_platform_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform_in(dir.path());
        platform.register_module("a", "1.0.0", Stub::ok(), &[]);
        platform.register_module("b", "1.0.0", Stub::ok(), &[]);
        platform.start_all(None);
        let health = platform.health_check();
        assert_eq!(health.verdict, HealthVerdict::Healthy);
        assert_eq!(health.active_modules, 2);
        assert!(health.average_health_score > 80.0);
    }

    #[test]
    fn minority_of_errors_is_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform_in(dir.path());
        platform.register_module("a", "1.0.0", Stub::ok(), &[]);
        platform.register_module("b", "1.0.0", Stub::ok(), &[]);
        platform.register_module("bad", "1.0.0", Stub::failing(), &[]);
        platform.start_all(None);
        let health = platform.health_check();
        assert_eq!(health.verdict, HealthVerdict::Degraded);
        assert_eq!(health.error_modules, 1);
    }

    #[test]
    fn majority_of_errors_is_critical() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform_in(dir.path());
        platform.register_module("bad1", "1.0.0", Stub::failing(), &[]);
        platform.register_module("bad2", "1.0.0", Stub::failing(), &[]);
        platform.register_module("ok", "1.0.0", Stub::ok(), &[]);
        platform.start_all(None);
        let health = platform.health_check();
        assert_eq!(health.verdict, HealthVerdict::Critical);
        assert_eq!(health.error_modules, 2);
    }

    #[test]
    fn status_report_names_every_module() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform_in(dir.path());
        platform.register_module("speech", "1.0.0", Stub::ok(), &[]);
        platform.register_module("bad", "1.0.0", Stub::failing(), &[]);
        platform.start_all(None);
        let report = platform.status_report();
        assert!(report.contains("speech"));
        assert!(report.contains("bad"));
        assert!(report.contains("refused"));
    }

    #[tokio::test]
    async fn monitor_persists_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let mut platform = platform_in(dir.path());
        platform.register_module("a", "1.0.0", Stub::ok(), &[]);
        platform.start_module("a").unwrap();

        platform.start_monitor();
        assert!(platform.monitor_running());
        tokio::time::sleep(Duration::from_millis(60)).await;
        platform.stop_monitor().await;
        assert!(!platform.monitor_running());

        let snapshot = platform.load_runtime_state().unwrap();
        assert_eq!(snapshot.module_count, 1);
        assert_eq!(snapshot.active_count, 1);
    }

    #[tokio::test]
    async fn monitor_survives_persistence_faults() {
        // State path points into a directory that does not exist, so every
        // tick's save fails; the loop must keep running and stop cleanly.
        let mut platform = SupervisionPlatform::new(PlatformConfig {
            state_path: PathBuf::from("/nonexistent-dir/state.json"),
            monitor_interval: Duration::from_millis(10),
            stagger: Duration::ZERO,
        });
        platform.register_module("a", "1.0.0", Stub::ok(), &[]);
        platform.start_monitor();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(platform.monitor_running());
        platform.stop_monitor().await;
    }

    #[tokio::test]
    async fn monitor_start_and_stop_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut platform = platform_in(dir.path());
        platform.start_monitor();
        platform.start_monitor();
        assert!(platform.monitor_running());
        platform.stop_monitor().await;
        // Second stop is a no-op, not a hang or panic.
        platform.stop_monitor().await;
        assert!(!platform.monitor_running());
    }

    #[tokio::test]
    async fn monitor_reads_do_not_block_caller_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let mut platform = platform_in(dir.path());
        platform.start_monitor();
        // Mutate the registry while the monitor is ticking.
        for i in 0..5 {
            let name = format!("m{i}");
            platform.register_module(&name, "1.0.0", Stub::ok(), &[]);
            platform.start_module(&name).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        platform.stop_monitor().await;
        assert_eq!(platform.health_check().active_modules, 5);
    }
}
