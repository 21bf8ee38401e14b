//! Domain model for performance backfills.

pub mod error;
pub mod policy;
pub mod record;
pub mod revision;
pub mod stage;

pub use error::{BackfillError, ParseFailure, Result, StageFailure};
pub use policy::SelectionPolicy;
pub use record::{AggregatedResult, BenchmarkRecord, BenchmarkSummary, BuildContext, RunContext};
pub use revision::{CommitEntry, Revision, SHORT_ID_LEN};
pub use stage::{RunStage, StageSet};
