//! Structured observability hooks for pipeline lifecycle events.
//!
//! Every helper logs one `tracing` event with a stable `event` field so log
//! pipelines can filter on it. Set `RUST_LOG` to tune verbosity.

use tracing::{info, warn};

use crate::model::{StageId, StageStatus};

/// Span covering one pipeline run; instrument the run future with it.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("promote.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, revision: &str, stages: usize) {
    info!(event = "run.started", run_id = %run_id, revision = %revision, stages = stages);
}

pub fn emit_stage_started(stage: &StageId, environment: &str) {
    info!(event = "stage.started", stage = %stage, environment = %environment);
}

pub fn emit_stage_finished(stage: &StageId, status: StageStatus, duration_ms: u64) {
    info!(
        event = "stage.finished",
        stage = %stage,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_action_failed(stage: &StageId, action: &str, error: &dyn std::fmt::Display) {
    warn!(event = "action.failed", stage = %stage, action = %action, error = %error);
}

pub fn emit_approval_requested(stage: &StageId, approvers: usize) {
    info!(event = "approval.requested", stage = %stage, approvers = approvers);
}

pub fn emit_approval_resolved(stage: &StageId, decision: &str, actor: &str) {
    info!(event = "approval.resolved", stage = %stage, decision = %decision, actor = %actor);
}

pub fn emit_run_finished(run_id: &str, status: &str, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        duration_ms = duration_ms,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _entered = run_span("test-run-id").entered();
        emit_stage_started(&StageId::new("dev"), "dev");
    }
}
