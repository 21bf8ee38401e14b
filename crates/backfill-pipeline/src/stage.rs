//! Per-revision stage states and reports.

use std::fmt;

use backfill_core::{RunStage, StageFailure};
use serde::{Deserialize, Serialize};

/// Where a revision is in its stage sequence.
///
/// `Failed` absorbs a revision's sequence for the current run; the pipeline
/// itself moves on to the next revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "stage")]
pub enum RevisionState {
    Pending,
    Building,
    Built,
    Benchmarking,
    Benchmarked,
    Archiving,
    Archived,
    Uploading,
    Done,
    Failed(RunStage),
}

impl RevisionState {
    /// State while `stage` is running.
    pub fn running(stage: RunStage) -> Self {
        match stage {
            RunStage::Build => RevisionState::Building,
            RunStage::Benchmark => RevisionState::Benchmarking,
            RunStage::Archive => RevisionState::Archiving,
            RunStage::Upload => RevisionState::Uploading,
        }
    }

    /// State once `stage` has completed or was already complete.
    pub fn finished(stage: RunStage) -> Self {
        match stage {
            RunStage::Build => RevisionState::Built,
            RunStage::Benchmark => RevisionState::Benchmarked,
            RunStage::Archive => RevisionState::Archived,
            RunStage::Upload => RevisionState::Done,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RevisionState::Failed(_))
    }
}

impl fmt::Display for RevisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevisionState::Pending => f.write_str("pending"),
            RevisionState::Building => f.write_str("building"),
            RevisionState::Built => f.write_str("built"),
            RevisionState::Benchmarking => f.write_str("benchmarking"),
            RevisionState::Benchmarked => f.write_str("benchmarked"),
            RevisionState::Archiving => f.write_str("archiving"),
            RevisionState::Archived => f.write_str("archived"),
            RevisionState::Uploading => f.write_str("uploading"),
            RevisionState::Done => f.write_str("done"),
            RevisionState::Failed(stage) => write!(f, "failed({stage})"),
        }
    }
}

/// How a single stage ended for a revision.
#[derive(Debug, Clone, PartialEq)]
pub enum StageStatus {
    Completed,
    /// Not executed; the reason is either existing output or an earlier failure.
    Skipped(String),
    Failed(StageFailure),
    NotRequested,
}

/// Report of one stage of one revision.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub stage: RunStage,
    pub status: StageStatus,
    pub duration_ms: u64,
}

impl StageReport {
    pub fn new(stage: RunStage, status: StageStatus, duration_ms: u64) -> Self {
        Self {
            stage,
            status,
            duration_ms,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, StageStatus::Failed(_))
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, StageStatus::Completed)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, StageStatus::Skipped(_))
    }
}
