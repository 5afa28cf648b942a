//! [`ModuleRegistry`] – the directory of supervised modules.
//!
//! Owns the name→module map, the dependency graph and the registration
//! order; implements dependency-ordered start/stop, batch operations and
//! runtime-state persistence.
//!
//! # Dependencies
//!
//! Dependency edges are weak, name-based references stored separately from
//! the module map.  A dangling edge (prerequisite never registered) is
//! legal until the dependent module is started, at which point it is
//! reported as [`SupervisorError::DependencyMissing`].  Resolution is an
//! explicit depth-first traversal with a currently-resolving marker path,
//! so a circular declaration yields [`SupervisorError::CycleDetected`]
//! before any module in the cycle is started.
//!
//! Prerequisites that were already started before a later failure are not
//! rolled back: module hooks are expected to tolerate re-invocation, and a
//! partially started chain is left running for the operator to inspect.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use sherpa_types::{ModuleState, ModuleStatus, RuntimeSnapshot, SupervisorError};

use crate::module::{Lifecycle, ModuleHandle};

/// Pause inserted between batch start/stop invocations so freshly started
/// modules do not contend for shared device resources (microphone, camera)
/// at the same instant.
const DEFAULT_STAGGER: Duration = Duration::from_millis(100);

/// What to do with active dependents when a module they rely on is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopPolicy {
    /// Log a warning naming the active dependents and stop only the named
    /// module.  Matches the historical device behavior.
    #[default]
    WarnOnly,
    /// Stop active dependents first, depth-first, before the named module.
    Cascade,
}

/// Per-item outcome of a batch operation, in invocation order.
pub type BatchResults = Vec<(String, Result<(), SupervisorError>)>;

/// The module directory: name→handle map, dependency edges, registration
/// order, and the runtime-state file location.
///
/// All operations are synchronous and blocking.  Callers that share a
/// registry with a background monitor must serialize access through a
/// single mutex; the registry itself holds no interior locking.
pub struct ModuleRegistry {
    modules: HashMap<String, ModuleHandle>,
    dependencies: HashMap<String, Vec<String>>,
    registration_order: Vec<String>,
    state_path: PathBuf,
    stagger: Duration,
}

impl ModuleRegistry {
    /// Create an empty registry persisting runtime state to `state_path`.
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            modules: HashMap::new(),
            dependencies: HashMap::new(),
            registration_order: Vec::new(),
            state_path: state_path.into(),
            stagger: DEFAULT_STAGGER,
        }
    }

    /// Override the pause between batch items (builder-style).
    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register `module` under `name` with the given prerequisite names.
    ///
    /// Re-registering an existing name silently replaces the previous
    /// module (a warning is logged); the registration order keeps the
    /// original position.  Prerequisites need not be registered yet.
    pub fn register(
        &mut self,
        name: &str,
        version: &str,
        module: Box<dyn Lifecycle>,
        dependencies: &[&str],
    ) {
        if self.modules.contains_key(name) {
            warn!(module = name, "already registered; replacing previous module");
        }
        self.modules
            .insert(name.to_string(), ModuleHandle::new(name, version, module));
        if !self.registration_order.iter().any(|n| n == name) {
            self.registration_order.push(name.to_string());
        }
        if dependencies.is_empty() {
            self.dependencies.remove(name);
        } else {
            self.dependencies.insert(
                name.to_string(),
                dependencies.iter().map(|d| d.to_string()).collect(),
            );
        }
        info!(module = name, deps = ?dependencies, "module registered");
    }

    /// Remove `name` from the registry, stopping it first if active.
    pub fn unregister(&mut self, name: &str) -> Result<(), SupervisorError> {
        let handle = self
            .modules
            .get_mut(name)
            .ok_or_else(|| SupervisorError::ModuleNotFound(name.to_string()))?;
        if handle.state() == ModuleState::Active {
            // Best effort: a faulted cleanup must not block removal.
            if let Err(e) = handle.stop() {
                warn!(module = name, error = %e, "stop failed during unregister");
            }
        }
        self.modules.remove(name);
        self.dependencies.remove(name);
        self.registration_order.retain(|n| n != name);
        info!(module = name, "module unregistered");
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Registered names in registration order.
    pub fn list_registered(&self) -> Vec<String> {
        self.registration_order.clone()
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Start `name`, first ensuring every declared prerequisite is active.
    ///
    /// Resolution is depth-first: each prerequisite is recursively started
    /// before the dependent's own `initialize` hook runs – the only
    /// cross-module ordering guarantee the supervisor provides.
    /// Prerequisites already started before a later failure stay running.
    ///
    /// # Errors
    ///
    /// - [`SupervisorError::ModuleNotFound`] – `name` is not registered.
    /// - [`SupervisorError::DependencyMissing`] – a prerequisite name is
    ///   unregistered; the dependent is left untouched (not in error).
    /// - [`SupervisorError::CycleDetected`] – the declaration graph loops
    ///   back through `name`; nothing in the cycle is started.
    /// - [`SupervisorError::DependencyFailed`] – a prerequisite's own start
    ///   faulted.
    /// - [`SupervisorError::HookFault`] – the module's own hook faulted.
    pub fn start_module(&mut self, name: &str) -> Result<(), SupervisorError> {
        let mut resolving = Vec::new();
        self.start_resolved(name, &mut resolving)
    }

    fn start_resolved(
        &mut self,
        name: &str,
        resolving: &mut Vec<String>,
    ) -> Result<(), SupervisorError> {
        if !self.modules.contains_key(name) {
            error!(module = name, "cannot start: not registered");
            return Err(SupervisorError::ModuleNotFound(name.to_string()));
        }
        if resolving.iter().any(|n| n == name) {
            let chain = format!("{} -> {}", resolving.join(" -> "), name);
            error!(module = name, %chain, "circular dependency");
            return Err(SupervisorError::CycleDetected {
                module: name.to_string(),
                chain,
            });
        }
        resolving.push(name.to_string());

        if let Some(deps) = self.dependencies.get(name).cloned() {
            for dep in deps {
                if !self.modules.contains_key(&dep) {
                    error!(module = name, dependency = %dep, "dependency not registered");
                    return Err(SupervisorError::DependencyMissing {
                        module: name.to_string(),
                        dependency: dep,
                    });
                }
                if self.modules.get(&dep).map(|h| h.state()) != Some(ModuleState::Active) {
                    info!(module = name, dependency = %dep, "starting dependency first");
                    if let Err(e) = self.start_resolved(&dep, resolving) {
                        return Err(match e {
                            e @ (SupervisorError::CycleDetected { .. }
                            | SupervisorError::DependencyMissing { .. }) => e,
                            _ => SupervisorError::DependencyFailed {
                                module: name.to_string(),
                                dependency: dep,
                            },
                        });
                    }
                }
            }
        }
        resolving.pop();

        match self.modules.get_mut(name) {
            Some(handle) => handle.start(),
            None => Err(SupervisorError::ModuleNotFound(name.to_string())),
        }
    }

    /// Stop `name` under the default [`StopPolicy::WarnOnly`].
    pub fn stop_module(&mut self, name: &str) -> Result<(), SupervisorError> {
        self.stop_module_with(name, StopPolicy::WarnOnly)
    }

    /// Stop `name` under an explicit dependent-handling policy.
    pub fn stop_module_with(
        &mut self,
        name: &str,
        policy: StopPolicy,
    ) -> Result<(), SupervisorError> {
        if !self.modules.contains_key(name) {
            error!(module = name, "cannot stop: not registered");
            return Err(SupervisorError::ModuleNotFound(name.to_string()));
        }
        let dependents = self.active_dependents(name);
        match policy {
            StopPolicy::WarnOnly => {
                if !dependents.is_empty() {
                    warn!(
                        module = name,
                        dependents = ?dependents,
                        "active modules depend on this module; stopping anyway"
                    );
                }
            }
            StopPolicy::Cascade => {
                for dependent in dependents {
                    info!(module = name, dependent = %dependent, "cascade-stopping dependent");
                    self.stop_module_with(&dependent, StopPolicy::Cascade)?;
                }
            }
        }
        match self.modules.get_mut(name) {
            Some(handle) => handle.stop(),
            None => Err(SupervisorError::ModuleNotFound(name.to_string())),
        }
    }

    pub fn suspend_module(&mut self, name: &str) -> Result<(), SupervisorError> {
        self.handle_mut(name)?.suspend()
    }

    pub fn resume_module(&mut self, name: &str) -> Result<(), SupervisorError> {
        self.handle_mut(name)?.resume()
    }

    pub fn restart_module(&mut self, name: &str) -> Result<(), SupervisorError> {
        self.handle_mut(name)?.restart()
    }

    /// Merge `config` into the named module's `custom_info`.
    pub fn inject_config(
        &mut self,
        name: &str,
        config: BTreeMap<String, serde_json::Value>,
    ) -> Result<(), SupervisorError> {
        self.handle_mut(name)?.inject_config(config)
    }

    /// Diagnostics of a single module (override or default map).
    pub fn module_health(
        &self,
        name: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>, SupervisorError> {
        Ok(self.handle(name)?.health_check())
    }

    /// Status snapshot of a single module.
    pub fn module_status(&self, name: &str) -> Result<ModuleStatus, SupervisorError> {
        Ok(self.handle(name)?.status())
    }

    // ------------------------------------------------------------------
    // Batch operations
    // ------------------------------------------------------------------

    /// Start modules in the given sequence, or registration order when
    /// `order` is `None`.  Best-effort: one failure does not abort the
    /// batch.  Names in an explicit order that are not registered are
    /// skipped.  Returns per-item results in invocation order.
    pub fn start_all(&mut self, order: Option<&[String]>) -> BatchResults {
        let names: Vec<String> = match order {
            Some(o) => o.to_vec(),
            None => self.registration_order.clone(),
        };
        let mut results = BatchResults::new();
        for name in names {
            if !self.modules.contains_key(&name) {
                continue;
            }
            let result = self.start_module(&name);
            results.push((name, result));
            std::thread::sleep(self.stagger);
        }
        let ok = results.iter().filter(|(_, r)| r.is_ok()).count();
        info!(ok, total = results.len(), "batch start complete");
        results
    }

    /// Stop every registered module, in reverse registration order when
    /// `reverse` is set (the default operator choice).  Best-effort, with
    /// per-item results in invocation order.
    pub fn stop_all(&mut self, reverse: bool) -> BatchResults {
        let mut names = self.registration_order.clone();
        if reverse {
            names.reverse();
        }
        let mut results = BatchResults::new();
        for name in names {
            let result = self.stop_module(&name);
            results.push((name, result));
            std::thread::sleep(self.stagger);
        }
        let ok = results.iter().filter(|(_, r)| r.is_ok()).count();
        info!(ok, total = results.len(), "batch stop complete");
        results
    }

    /// Topological start order over the declared dependency graph:
    /// prerequisites before dependents, registration order as tie-break.
    /// Dangling prerequisites are ignored here; they surface at start time.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::CycleDetected`] naming the modules left over once
    /// no progress can be made.
    pub fn startup_order(&self) -> Result<Vec<String>, SupervisorError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for name in &self.registration_order {
            let degree = self
                .dependencies
                .get(name)
                .map(|deps| deps.iter().filter(|d| self.modules.contains_key(*d)).count())
                .unwrap_or(0);
            in_degree.insert(name.as_str(), degree);
        }

        let mut remaining = self.registration_order.clone();
        let mut order = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let next = remaining
                .iter()
                .position(|n| in_degree.get(n.as_str()) == Some(&0));
            let Some(idx) = next else {
                let chain = remaining.join(", ");
                error!(%chain, "circular dependency in startup order");
                return Err(SupervisorError::CycleDetected {
                    module: remaining[0].clone(),
                    chain,
                });
            };
            let name = remaining.remove(idx);
            for (dependent, deps) in &self.dependencies {
                if deps.iter().any(|d| *d == name) {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }
            order.push(name);
        }
        Ok(order)
    }

    // ------------------------------------------------------------------
    // Snapshots & persistence
    // ------------------------------------------------------------------

    /// Status of every registered module, assembled in one full iteration.
    pub fn all_status(&self) -> BTreeMap<String, ModuleStatus> {
        self.modules
            .iter()
            .map(|(name, handle)| (name.clone(), handle.status()))
            .collect()
    }

    /// Aggregate runtime snapshot with per-state counts, computed on
    /// demand and never cached.
    pub fn runtime_snapshot(&self) -> RuntimeSnapshot {
        let count_in = |state: ModuleState| {
            self.modules
                .values()
                .filter(|h| h.state() == state)
                .count()
        };
        RuntimeSnapshot {
            timestamp: Utc::now(),
            module_count: self.modules.len(),
            active_count: count_in(ModuleState::Active),
            suspended_count: count_in(ModuleState::Suspended),
            error_count: count_in(ModuleState::Error),
            modules: self.all_status(),
        }
    }

    /// Serialize the current snapshot to the runtime-state file.
    pub fn save_runtime_state(&self) -> Result<(), SupervisorError> {
        let snapshot = self.runtime_snapshot();
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| SupervisorError::Persistence(e.to_string()))?;
        std::fs::write(&self.state_path, json).map_err(|e| {
            SupervisorError::Persistence(format!(
                "write {}: {e}",
                self.state_path.display()
            ))
        })?;
        debug!(path = %self.state_path.display(), "runtime state saved");
        Ok(())
    }

    /// Read back the last persisted snapshot.
    ///
    /// The result is display data only – it never reconstructs live
    /// modules and is not a crash-recovery mechanism.
    pub fn load_runtime_state(&self) -> Result<RuntimeSnapshot, SupervisorError> {
        let raw = std::fs::read_to_string(&self.state_path).map_err(|e| {
            SupervisorError::Persistence(format!(
                "read {}: {e}",
                self.state_path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| SupervisorError::Persistence(e.to_string()))
    }

    // ------------------------------------------------------------------
    // Private helpers
    // ------------------------------------------------------------------

    fn handle(&self, name: &str) -> Result<&ModuleHandle, SupervisorError> {
        self.modules
            .get(name)
            .ok_or_else(|| SupervisorError::ModuleNotFound(name.to_string()))
    }

    fn handle_mut(&mut self, name: &str) -> Result<&mut ModuleHandle, SupervisorError> {
        self.modules
            .get_mut(name)
            .ok_or_else(|| SupervisorError::ModuleNotFound(name.to_string()))
    }

    /// Names of currently active modules that declare `name` as a
    /// prerequisite, sorted for deterministic handling.
    fn active_dependents(&self, name: &str) -> Vec<String> {
        let mut dependents: Vec<String> = self
            .dependencies
            .iter()
            .filter(|(dependent, deps)| {
                deps.iter().any(|d| d == name)
                    && self
                        .modules
                        .get(dependent.as_str())
                        .map(|h| h.state() == ModuleState::Active)
                        .unwrap_or(false)
            })
            .map(|(dependent, _)| dependent.clone())
            .collect();
        dependents.sort();
        dependents
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
