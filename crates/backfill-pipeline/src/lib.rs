//! Backfill Pipeline - per-revision stages
//!
//! Provides the stage pipeline that, for each selected revision:
//! - Builds the compiler unless a finished build exists
//! - Runs the benchmark harness into a timestamped result directory
//! - Archives results and uploads aggregated statistics to the dashboard

pub mod archive;
pub mod collaborator;
pub mod pipeline;
pub mod runner;
pub mod stage;
pub mod workspace;

// Re-export key types
pub use archive::{ArchiveReport, ArchiveTarget};
pub use collaborator::{BenchmarkHarness, BenchmarkRequest, BuildCollaborator, BuildRequest};
pub use pipeline::{BackfillPipeline, PipelineResult, RevisionOutcome};
pub use runner::{CommandHarness, ConfigureMakeBuilder, StepResult};
pub use stage::{RevisionState, StageReport, StageStatus};
pub use workspace::{RevisionWorkspace, UploadReceipt};
