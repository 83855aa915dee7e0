//! Structured observability hooks for build and pipeline lifecycle events.
//!
//! Events are emitted at `info!` level unless noted (filter with `RUST_LOG`).
//! For JSON output, pass `--json` to the binaries.

use tracing::{info, warn};

use crate::mode::EntryMode;
use crate::orchestrator::BuildPhase;

/// Span carrying `run_id` for every event of one pipeline run.
///
/// ```ignore
/// executor.run_inner(trigger).instrument(pipeline_span(&run_id)).await
/// ```
pub fn pipeline_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("kiln.pipeline", run_id = %run_id)
}

pub fn emit_mode_selected(mode: EntryMode) {
    info!(event = "entry.mode_selected", mode = ?mode);
}

pub fn emit_phase_started(phase: BuildPhase) {
    info!(event = "build.phase_started", phase = %phase);
}

pub fn emit_phase_finished(phase: BuildPhase, duration_ms: u64) {
    info!(event = "build.phase_finished", phase = %phase, duration_ms = duration_ms);
}

/// Phase failure (warning level). Tool diagnostics have already been
/// written by the tool itself; only phase context is added here.
pub fn emit_phase_failed(phase: BuildPhase, error: &dyn std::fmt::Display) {
    warn!(event = "build.phase_failed", phase = %phase, error = %error);
}

pub fn emit_node_resolved(node: &str, decision: &str) {
    info!(event = "pipeline.node_resolved", node = %node, decision = %decision);
}

pub fn emit_node_finished(node: &str, outcome: &str, duration_ms: u64) {
    info!(
        event = "pipeline.node_finished",
        node = %node,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

/// Soft failures are recorded but do not block dependents.
pub fn emit_soft_failure(node: &str, step: &str, exit_code: i32) {
    warn!(event = "pipeline.soft_failure", node = %node, step = %step, exit_code = exit_code);
}

pub fn emit_asset_published(tag: &str, asset: &str) {
    info!(event = "release.asset_published", tag = %tag, asset = %asset);
}

pub fn emit_publish_failed(tag: &str, target: &str, error: &dyn std::fmt::Display) {
    warn!(event = "release.publish_failed", tag = %tag, target = %target, error = %error);
}
