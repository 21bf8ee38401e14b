//! Structured lifecycle events for a backfill run.
//!
//! Every event carries an `event` field so log pipelines can filter on it,
//! e.g. `event=stage.failed`. Per-revision work runs inside [`revision_span`].

use tracing::{info, warn};

use crate::domain::RunStage;

/// Span for one revision's work; attach to futures with `Instrument`.
pub fn revision_span(revision: &str) -> tracing::Span {
    tracing::info_span!("backfill.revision", revision = %revision)
}

/// RAII guard that tags everything logged while it lives with the revision.
///
/// ```ignore
/// let _span = RevisionSpan::enter("a1b2c3d...");
/// ```
pub struct RevisionSpan {
    _span: tracing::span::EnteredSpan,
}

impl RevisionSpan {
    pub fn enter(revision: &str) -> Self {
        Self {
            _span: revision_span(revision).entered(),
        }
    }
}

pub fn emit_selection_finished(policy: &str, count: usize) {
    info!(event = "selection.finished", policy = %policy, count = count);
}

pub fn emit_run_started(run_id: &str, revisions: usize, stages: &str) {
    info!(event = "run.started", run_id = %run_id, revisions = revisions, stages = %stages);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, succeeded: usize, failed: usize) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        succeeded = succeeded,
        failed = failed,
    );
}

pub fn emit_revision_started(revision: &str, index: usize, total: usize) {
    info!(event = "revision.started", revision = %revision, index = index, total = total);
}

pub fn emit_revision_finished(revision: &str, success: bool) {
    info!(event = "revision.finished", revision = %revision, success = success);
}

/// Stage skipped because its artifacts already exist.
pub fn emit_stage_skipped(revision: &str, stage: RunStage, reason: &str) {
    info!(event = "stage.skipped", revision = %revision, stage = %stage, reason = %reason);
}

pub fn emit_stage_completed(revision: &str, stage: RunStage, duration_ms: u64) {
    info!(
        event = "stage.completed",
        revision = %revision,
        stage = %stage,
        duration_ms = duration_ms,
    );
}

pub fn emit_stage_failed(revision: &str, stage: RunStage, error: &dyn std::fmt::Display) {
    warn!(event = "stage.failed", revision = %revision, stage = %stage, error = %error);
}

/// One benchmark of the harness failed; the rest keep going.
pub fn emit_benchmark_failed(revision: &str, benchmark: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "benchmark.failed",
        revision = %revision,
        benchmark = %benchmark,
        error = %error,
    );
}

pub fn emit_upload_outcome(revision: &str, records: usize, outcome: &str) {
    info!(
        event = "upload.finished",
        revision = %revision,
        records = records,
        outcome = %outcome,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_span_create() {
        let _span = RevisionSpan::enter("0123456789abcdef");
        emit_stage_skipped("0123456789abcdef", RunStage::Build, "already built");
    }
}
