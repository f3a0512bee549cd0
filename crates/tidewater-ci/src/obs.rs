//! Structured observability hooks for pipeline lifecycle events.
//!
//! Every hook emits a single `tracing` event with a stable `event` field
//! (`run.started`, `stage.failed`, ...) so log pipelines can filter on it.
//! Verbosity follows `RUST_LOG`; see [`crate::telemetry::init_tracing`].

use tracing::{info, warn};

/// Span for a Run, for use with `Instrument` on spawned tasks.
pub fn run_span(run_id: &str, target: &str) -> tracing::Span {
    tracing::info_span!("tidewater.run", run_id = %run_id, target = %target)
}

pub fn emit_trigger_evaluated(event_kind: &str, branch: &str, accepted: bool) {
    info!(
        event = "trigger.evaluated",
        event_kind = %event_kind,
        branch = %branch,
        accepted = accepted,
    );
}

pub fn emit_run_started(run_id: &str, commit_ref: &str, target: &str) {
    info!(
        event = "run.started",
        run_id = %run_id,
        commit_ref = %commit_ref,
        target = %target,
    );
}

/// Emit event: run finished with its outcome and duration.
pub fn emit_run_finished(run_id: &str, outcome: &str, duration_ms: u64, total_events: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        outcome = %outcome,
        duration_ms = duration_ms,
        total_events = total_events,
    );
}

pub fn emit_stage_started(run_id: &str, stage: &str, seq: u64) {
    info!(event = "stage.started", run_id = %run_id, stage = %stage, seq = seq);
}

pub fn emit_stage_succeeded(run_id: &str, stage: &str, duration_ms: u64) {
    info!(
        event = "stage.succeeded",
        run_id = %run_id,
        stage = %stage,
        duration_ms = duration_ms,
    );
}

/// Failures are warnings; an aborted stage is reported the same way.
pub fn emit_stage_failed(run_id: &str, stage: &str, error: &dyn std::fmt::Display) {
    warn!(event = "stage.failed", run_id = %run_id, stage = %stage, error = %error);
}

pub fn emit_gate_evaluated(run_id: &str, passed: bool, violations: usize) {
    info!(
        event = "gate.evaluated",
        run_id = %run_id,
        passed = passed,
        violations = violations,
    );
}

/// Emit event: ledger write failed (warning level).
pub fn emit_ledger_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.ledger_error", run_id = %run_id, error = %error);
}
