//! Backfill Core Library
//!
//! Revision selection, result aggregation and dashboard upload for
//! backfilling compiler performance history.

pub mod aggregate;
pub mod ci_status;
pub mod config;
pub mod domain;
pub mod fakes;
pub mod git;
pub mod obs;
pub mod selector;
pub mod telemetry;
pub mod upload;

pub use domain::{
    AggregatedResult, BackfillError, BenchmarkRecord, BenchmarkSummary, BuildContext,
    CommitEntry, ParseFailure, Result, Revision, RunContext, RunStage, SelectionPolicy,
    StageFailure, StageSet, SHORT_ID_LEN,
};

pub use aggregate::{aggregate, aggregate_dir, load_records, summarize, RecordSet};
pub use ci_status::{CiStatusSource, GithubStatusClient};
pub use config::{
    BackfillConfig, CiStatusConfig, CollaboratorConfig, DashboardConfig, ExecutableSpec,
    FailurePolicy, RepoConfig, SelectionConfig,
};
pub use git::{GitLog, LogQuery, RevisionLog};
pub use selector::RevisionSelector;
pub use telemetry::init_tracing;
pub use upload::{DashboardRecord, DashboardUploader, ResultPublisher, UploadOutcome};

/// Crate version, reported in run contexts.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
