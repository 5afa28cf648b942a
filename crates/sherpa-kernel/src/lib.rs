//! `sherpa-kernel` – Module Supervision
//!
//! The supervision core of the Sherpa assistant device.  Every subsystem
//! (navigation, speech, vision, conversational memory) plugs in as a
//! [`Lifecycle`][module::Lifecycle] implementation and is driven through a
//! fixed five-state lifecycle by the registry.
//!
//! # Modules
//!
//! - [`module`] – [`ModuleHandle`][module::ModuleHandle]:
//!   the per-module state machine (registered → active → suspended /
//!   stopped / error) with hook fault containment, config injection and
//!   live-computed health scoring.
//! - [`registry`] – [`ModuleRegistry`][registry::ModuleRegistry]:
//!   the module directory; resolves declared dependencies depth-first with
//!   cycle detection, runs best-effort batch start/stop with structured
//!   per-item results, and persists runtime snapshots to a JSON state file.
//!
//! Everything in this crate is synchronous and blocking; the background
//! monitor lives in `sherpa-runtime` and shares a registry with callers
//! behind a single mutex.

pub mod module;
pub mod registry;

pub use module::{Lifecycle, ModuleHandle};
pub use registry::{BatchResults, ModuleRegistry, StopPolicy};
