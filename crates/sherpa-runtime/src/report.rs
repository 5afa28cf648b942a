//! Operator status report rendering.
//!
//! Formats aggregate health plus per-module state into a plain-text dump
//! for logs and consoles.  Presentation only; nothing here is part of the
//! programmatic supervision contract.

use std::collections::BTreeMap;
use std::fmt::Write;

use sherpa_types::{ModuleStatus, SystemHealth};

const RULE: &str =
    "================================================================================";

/// Render the aggregate `health` and per-module `statuses` as a multi-line
/// report.
pub fn render(health: &SystemHealth, statuses: &BTreeMap<String, ModuleStatus>) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(
        out,
        "Sherpa module supervision report - {}",
        health.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "System health: {}", health.verdict.to_string().to_uppercase());
    let _ = writeln!(
        out,
        "  modules: {} total / {} active / {} suspended / {} stopped / {} error",
        health.total_modules,
        health.active_modules,
        health.suspended_modules,
        health.stopped_modules,
        health.error_modules
    );
    let _ = writeln!(
        out,
        "  average health score: {:.1}",
        health.average_health_score
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "Modules:");
    for (name, status) in statuses {
        let _ = writeln!(
            out,
            "  {:<24} {:<12} health {:>3}",
            name, status.state, status.health_score
        );
        if let Some(last_error) = &status.last_error {
            let _ = writeln!(out, "      last error: {last_error}");
        }
    }
    let _ = writeln!(out, "{RULE}");
    out
}
