//! `sherpa-runtime` – Operator Surface & Monitoring
//!
//! The composition layer of the Sherpa supervision core.  Wraps the
//! synchronous [`ModuleRegistry`][sherpa_kernel::ModuleRegistry] in the
//! [`SupervisionPlatform`][platform::SupervisionPlatform] façade, runs the
//! periodic background monitor, and renders the operator status report.
//!
//! # Modules
//!
//! - [`platform`] – [`SupervisionPlatform`][platform::SupervisionPlatform]:
//!   the one explicit composition point; delegates lifecycle operations to
//!   the registry behind a single mutex, classifies aggregate health, and
//!   owns the tokio monitor task (persist snapshot + health check per
//!   tick, cooperative cancellation with a bounded stop).
//! - [`report`] – plain-text operator report of aggregate and per-module
//!   health.
//! - [`telemetry`] – tracing subscriber setup
//!   ([`init_tracing`][telemetry::init_tracing]).

pub mod platform;
pub mod report;
pub mod telemetry;

pub use platform::{PlatformConfig, SupervisionPlatform};
