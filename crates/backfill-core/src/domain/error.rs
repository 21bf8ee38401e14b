//! Error taxonomy for backfill runs.
//!
//! `Configuration` and `SourceUnavailable` are fatal and abort a run before any
//! revision is processed. `StageFailure` and `ParseFailure` are caught at their
//! stage boundary, logged, and the run moves on.

use std::fmt;
use std::path::PathBuf;

use super::stage::RunStage;

/// A single stage failed for a single revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub revision: String,
    pub stage: RunStage,
    pub message: String,
    pub exit_code: Option<i32>,
    pub log_path: Option<PathBuf>,
}

impl StageFailure {
    pub fn new(revision: &str, stage: RunStage, message: impl Into<String>) -> Self {
        Self {
            revision: revision.to_string(),
            stage,
            message: message.into(),
            exit_code: None,
            log_path: None,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed for {}: {}", self.stage, self.revision, self.message)?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit code {code})")?;
        }
        if let Some(path) = &self.log_path {
            write!(f, " (see {})", path.display())?;
        }
        Ok(())
    }
}

impl std::error::Error for StageFailure {}

/// A raw result line or file could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot parse {}:{line}: {reason}", .path.display())]
pub struct ParseFailure {
    pub path: PathBuf,
    /// 1-based line number, 0 when the whole file is affected.
    pub line: usize,
    pub reason: String,
}

/// Backfill errors.
#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error(transparent)]
    Stage(#[from] StageFailure),

    #[error(transparent)]
    Parse(#[from] ParseFailure),

    #[error("http error: {0}")]
    Http(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackfillError {
    /// Fatal errors halt the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BackfillError::Configuration(_) | BackfillError::SourceUnavailable(_)
        )
    }
}

impl From<reqwest::Error> for BackfillError {
    fn from(err: reqwest::Error) -> Self {
        BackfillError::Http(err.to_string())
    }
}

/// Result type for backfill operations.
pub type Result<T> = std::result::Result<T, BackfillError>;
