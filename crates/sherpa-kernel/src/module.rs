//! [`ModuleHandle`] – the per-module lifecycle state machine.
//!
//! Every supervised component (a speech engine, a vision detector, a
//! navigation planner) implements the [`Lifecycle`] capability and is
//! wrapped in a [`ModuleHandle`] owned by the registry.  The handle drives
//! the five-state machine and records faults:
//!
//! | From | Op | To (success) | To (failure) |
//! |---|---|---|---|
//! | registered/stopped/error | start | active | error |
//! | active/suspended/error | stop | stopped | error |
//! | active | suspend | suspended | rejected, unchanged |
//! | suspended | resume | active | rejected, unchanged |
//!
//! # Fault containment
//!
//! Any fault inside a hook – an `Err` return or a panic – is caught at the
//! handle boundary, converted into `state = error`, `error_count += 1` and
//! `last_error`, and reported as a [`SupervisorError::HookFault`].  Faults
//! never escape the handle.  There is no retry budget, no backoff and no
//! transient/permanent distinction: a faulted module stays in `error` until
//! an operator restarts it.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{error, info, warn};

use sherpa_types::{ModuleState, ModuleStatus, SupervisorError, health_score};

// ────────────────────────────────────────────────────────────────────────────
// Lifecycle capability
// ────────────────────────────────────────────────────────────────────────────

/// The capability every supervised component must provide.
///
/// `initialize` and `cleanup` are required; the remaining hooks have
/// defaults.  Hook errors are reported as plain strings – the supervisor
/// records them verbatim as the module's `last_error`.
pub trait Lifecycle: Send {
    /// Bring the component up.  Called on every (re)start.
    fn initialize(&mut self) -> Result<(), String>;

    /// Release the component's resources.  Called on stop, including from
    /// the error state, so a faulted component must still tolerate cleanup.
    fn cleanup(&mut self) -> Result<(), String>;

    /// Component-specific diagnostics, replacing the default health map.
    fn diagnostics(&self) -> Option<serde_json::Map<String, Value>> {
        None
    }

    /// Observe configuration before it is merged into `custom_info`.
    fn on_config(&mut self, _config: &BTreeMap<String, Value>) -> Result<(), String> {
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ModuleHandle
// ────────────────────────────────────────────────────────────────────────────

/// A single supervised module: one boxed [`Lifecycle`] plus its mutable
/// runtime attributes.  Owned exclusively by the registry entry that holds
/// it; never shared between modules.
pub struct ModuleHandle {
    name: String,
    version: String,
    state: ModuleState,
    start_time: Option<DateTime<Utc>>,
    error_count: u32,
    last_error: Option<String>,
    custom_info: BTreeMap<String, Value>,
    inner: Box<dyn Lifecycle>,
}

impl ModuleHandle {
    /// Wrap `inner` as a freshly registered module.
    pub fn new(name: impl Into<String>, version: impl Into<String>, inner: Box<dyn Lifecycle>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            state: ModuleState::Registered,
            start_time: None,
            error_count: 0,
            last_error: None,
            custom_info: BTreeMap::new(),
            inner,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    /// Start the module by running its `initialize` hook.
    ///
    /// A module that is already active is a logged no-op.  On success the
    /// state becomes [`ModuleState::Active`] and `start_time` is set.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::HookFault`] when `initialize` fails or panics;
    /// the module is left in [`ModuleState::Error`].
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        if self.state == ModuleState::Active {
            warn!(module = %self.name, "already active; start is a no-op");
            return Ok(());
        }
        info!(module = %self.name, version = %self.version, "starting module");
        self.run_hook("initialize", |m| m.initialize())?;
        self.state = ModuleState::Active;
        self.start_time = Some(Utc::now());
        info!(module = %self.name, "module started");
        Ok(())
    }

    /// Stop the module by running its `cleanup` hook.
    ///
    /// Cleanup is attempted from any non-stopped state, including
    /// [`ModuleState::Error`], so faulted modules do not leak resources.
    /// A module that is already stopped is a logged no-op.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::HookFault`] when `cleanup` fails or panics; the
    /// module is left in [`ModuleState::Error`] and a later stop may retry.
    pub fn stop(&mut self) -> Result<(), SupervisorError> {
        if self.state == ModuleState::Stopped {
            warn!(module = %self.name, "already stopped; stop is a no-op");
            return Ok(());
        }
        info!(module = %self.name, "stopping module");
        self.run_hook("cleanup", |m| m.cleanup())?;
        self.state = ModuleState::Stopped;
        self.start_time = None;
        info!(module = %self.name, "module stopped");
        Ok(())
    }

    /// Suspend an active module.  Rejected from any other state, leaving
    /// the state unchanged.
    pub fn suspend(&mut self) -> Result<(), SupervisorError> {
        if self.state != ModuleState::Active {
            warn!(module = %self.name, state = %self.state, "cannot suspend");
            return Err(SupervisorError::InvalidTransition {
                module: self.name.clone(),
                from: self.state,
                op: "suspend",
            });
        }
        self.state = ModuleState::Suspended;
        info!(module = %self.name, "module suspended");
        Ok(())
    }

    /// Resume a suspended module.  Rejected from any other state, leaving
    /// the state unchanged.
    pub fn resume(&mut self) -> Result<(), SupervisorError> {
        if self.state != ModuleState::Suspended {
            warn!(module = %self.name, state = %self.state, "cannot resume");
            return Err(SupervisorError::InvalidTransition {
                module: self.name.clone(),
                from: self.state,
                op: "resume",
            });
        }
        self.state = ModuleState::Active;
        info!(module = %self.name, "module resumed");
        Ok(())
    }

    /// Stop the module and, only if it was active immediately before,
    /// start it again.
    pub fn restart(&mut self) -> Result<(), SupervisorError> {
        info!(module = %self.name, "restarting module");
        let was_active = self.state == ModuleState::Active;
        let stopped = self.stop();
        if was_active {
            // Start is attempted even when cleanup faulted: the error state
            // permits start, and initialize may recover the component.
            return self.start();
        }
        stopped
    }

    /// Merge `config` into `custom_info`, never replacing existing entries
    /// wholesale.  The component's `on_config` hook observes the map first;
    /// a hook fault is contained like any other.
    pub fn inject_config(&mut self, config: BTreeMap<String, Value>) -> Result<(), SupervisorError> {
        self.run_hook("on_config", |m| m.on_config(&config))?;
        for (key, value) in config {
            self.custom_info.insert(key, value);
        }
        info!(module = %self.name, "config injected");
        Ok(())
    }

    /// Component diagnostics: the [`Lifecycle::diagnostics`] override when
    /// provided, otherwise the default `{active, error_count, uptime_secs}`
    /// map.
    pub fn health_check(&self) -> serde_json::Map<String, Value> {
        if let Some(map) = self.inner.diagnostics() {
            return map;
        }
        let uptime_secs = self
            .start_time
            .map(|t| (Utc::now() - t).num_seconds().max(0))
            .unwrap_or(0);
        let mut map = serde_json::Map::new();
        map.insert("active".to_string(), Value::Bool(self.state == ModuleState::Active));
        map.insert("error_count".to_string(), Value::from(self.error_count));
        map.insert("uptime_secs".to_string(), Value::from(uptime_secs));
        map
    }

    /// Immutable status snapshot with the live-computed health score.
    pub fn status(&self) -> ModuleStatus {
        ModuleStatus {
            name: self.name.clone(),
            state: self.state,
            version: self.version.clone(),
            start_time: self.start_time,
            last_update: Utc::now(),
            error_count: self.error_count,
            last_error: self.last_error.clone(),
            health_score: health_score(self.error_count),
            custom_info: self.custom_info.clone(),
        }
    }

    // Run one hook with full fault containment: an Err return or a panic
    // becomes state = error + recorded fault, reported as HookFault.
    fn run_hook(
        &mut self,
        op: &'static str,
        hook: impl FnOnce(&mut dyn Lifecycle) -> Result<(), String>,
    ) -> Result<(), SupervisorError> {
        let outcome = catch_unwind(AssertUnwindSafe(|| hook(self.inner.as_mut())));
        let details = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(details)) => details,
            Err(payload) => panic_message(payload),
        };
        self.state = ModuleState::Error;
        self.error_count += 1;
        self.last_error = Some(details.clone());
        error!(module = %self.name, op, fault = %details, "hook fault contained");
        Err(SupervisorError::HookFault {
            module: self.name.clone(),
            op,
            details,
        })
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic in module hook".to_string()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
