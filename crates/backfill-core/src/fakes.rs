//! In-memory fakes for the collaborator traits (testing only)
//!
//! `MemoryLog`, `StaticStatusSource` and `RecordingPublisher` satisfy the
//! trait contracts without git, GitHub or a dashboard.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::ci_status::CiStatusSource;
use crate::domain::{BackfillError, CommitEntry, Result};
use crate::git::{LogQuery, RevisionLog};
use crate::upload::{DashboardRecord, ResultPublisher, UploadOutcome};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// MemoryLog
// ---------------------------------------------------------------------------

/// Revision log serving a fixed newest-first commit list.
#[derive(Debug, Default)]
pub struct MemoryLog {
    commits: Option<Vec<CommitEntry>>,
    queries: Mutex<Vec<LogQuery>>,
}

impl MemoryLog {
    /// `commits` is newest first, like `git log`.
    pub fn new(commits: Vec<CommitEntry>) -> Self {
        Self {
            commits: Some(commits),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// A log whose repository cannot be read.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Queries received so far.
    pub fn queries(&self) -> Vec<LogQuery> {
        lock(&self.queries).clone()
    }
}

#[async_trait]
impl RevisionLog for MemoryLog {
    async fn commits(&self, query: &LogQuery) -> Result<Vec<CommitEntry>> {
        lock(&self.queries).push(query.clone());
        self.commits
            .clone()
            .ok_or_else(|| BackfillError::SourceUnavailable("memory log is unavailable".into()))
    }
}

// ---------------------------------------------------------------------------
// StaticStatusSource
// ---------------------------------------------------------------------------

/// CI status source answering from a map; unknown revisions have no status.
#[derive(Debug, Default)]
pub struct StaticStatusSource {
    states: HashMap<String, String>,
    lookups: Mutex<Vec<String>>,
}

impl StaticStatusSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, revision: &str, state: &str) -> Self {
        self.states.insert(revision.to_string(), state.to_string());
        self
    }

    /// Revisions looked up, in call order.
    pub fn lookups(&self) -> Vec<String> {
        lock(&self.lookups).clone()
    }
}

#[async_trait]
impl CiStatusSource for StaticStatusSource {
    async fn status(&self, revision: &str) -> Option<String> {
        lock(&self.lookups).push(revision.to_string());
        self.states.get(revision).cloned()
    }
}

// ---------------------------------------------------------------------------
// RecordingPublisher
// ---------------------------------------------------------------------------

/// Publisher that stores every batch and answers with a canned outcome.
#[derive(Debug)]
pub struct RecordingPublisher {
    outcome: UploadOutcome,
    batches: Mutex<Vec<Vec<DashboardRecord>>>,
}

impl Default for RecordingPublisher {
    fn default() -> Self {
        Self::accepting()
    }
}

impl RecordingPublisher {
    pub fn accepting() -> Self {
        Self::answering(UploadOutcome::Accepted {
            body: "ok".to_string(),
        })
    }

    pub fn answering(outcome: UploadOutcome) -> Self {
        Self {
            outcome,
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn batches(&self) -> Vec<Vec<DashboardRecord>> {
        lock(&self.batches).clone()
    }
}

#[async_trait]
impl ResultPublisher for RecordingPublisher {
    async fn publish(&self, records: &[DashboardRecord]) -> UploadOutcome {
        if records.is_empty() {
            return UploadOutcome::Empty;
        }
        lock(&self.batches).push(records.to_vec());
        self.outcome.clone()
    }
}
