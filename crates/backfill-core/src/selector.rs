//! Revision selection.
//!
//! Turns a commit log plus a [`SelectionPolicy`] into the ordered list of
//! revisions a backfill processes, oldest first, capped to the newest
//! `max_count` entries.

use std::collections::HashSet;

use chrono::{DateTime, FixedOffset, Utc};
use tracing::{debug, info};

use crate::ci_status::{CiStatusSource, SUCCESS_STATE};
use crate::config::{RepoConfig, SelectionConfig};
use crate::domain::{BackfillError, CommitEntry, Result, Revision, SelectionPolicy};
use crate::git::{LogQuery, RevisionLog};
use crate::obs::emit_selection_finished;

/// Applies a selection policy to a revision log.
pub struct RevisionSelector<'a> {
    log: &'a dyn RevisionLog,
    ci_status: Option<&'a dyn CiStatusSource>,
    repo: &'a RepoConfig,
    selection: &'a SelectionConfig,
}

impl<'a> RevisionSelector<'a> {
    pub fn new(
        log: &'a dyn RevisionLog,
        repo: &'a RepoConfig,
        selection: &'a SelectionConfig,
    ) -> Self {
        Self {
            log,
            ci_status: None,
            repo,
            selection,
        }
    }

    /// Attach the CI status source used by `status_success`.
    pub fn with_ci_status(mut self, source: &'a dyn CiStatusSource) -> Self {
        self.ci_status = Some(source);
        self
    }

    /// Select revisions relative to the current time.
    pub async fn select(&self) -> Result<Vec<Revision>> {
        self.select_at(Utc::now().fixed_offset()).await
    }

    /// Select revisions relative to a fixed "now" (used for deterministic tests).
    pub async fn select_at(&self, now: DateTime<FixedOffset>) -> Result<Vec<Revision>> {
        let policy = &self.selection.policy;
        let branch = self.repo.branch.as_str();

        let selected = match policy {
            SelectionPolicy::VersionTags => {
                let commits = self.log.commits(&LogQuery::history(self.repo)).await?;
                version_tagged(&commits, &self.selection.version_marker, branch)
            }
            SelectionPolicy::CiStatusSuccess => {
                let source = self.ci_status.ok_or_else(|| {
                    BackfillError::Configuration(
                        "status_success selection needs a CI status source".to_string(),
                    )
                })?;
                let commits = self.log.commits(&LogQuery::range(self.repo)).await?;
                self.ci_successful(source, &commits).await
            }
            SelectionPolicy::ExplicitHashes(hashes) => {
                hashes.iter().map(|h| Revision::new(h, branch)).collect()
            }
            SelectionPolicy::TimeBatched(window) => {
                let window = chrono::Duration::from_std(*window).map_err(|_| {
                    BackfillError::Configuration(format!("delay {window:?} is out of range"))
                })?;
                let commits = self.log.commits(&LogQuery::range(self.repo)).await?;
                time_batched(&commits, window, now, branch)
            }
            SelectionPolicy::All => {
                let commits = self.log.commits(&LogQuery::range(self.repo)).await?;
                time_batched(&commits, chrono::Duration::zero(), now, branch)
            }
        };

        let revisions = finalize(selected, self.selection.max_count);
        emit_selection_finished(policy.name(), revisions.len());
        Ok(revisions)
    }

    /// One status lookup per candidate, oldest first.
    async fn ci_successful(
        &self,
        source: &dyn CiStatusSource,
        newest_first: &[CommitEntry],
    ) -> Vec<Revision> {
        let mut kept = Vec::new();
        for entry in newest_first.iter().rev() {
            let state = source.status(&entry.id).await;
            debug!(revision = %entry.id, state = ?state, "CI state");
            if state.as_deref() == Some(SUCCESS_STATE) {
                kept.push(Revision::from_entry(entry, &self.repo.branch));
            }
        }
        kept
    }
}

/// Commits whose subject carries both the marker and the branch name,
/// oldest first.
pub fn version_tagged(newest_first: &[CommitEntry], marker: &str, branch: &str) -> Vec<Revision> {
    newest_first
        .iter()
        .rev()
        .filter(|c| c.subject.contains(marker) && c.subject.contains(branch))
        .inspect(|c| debug!(revision = %c.id, subject = %c.subject, "version tag"))
        .map(|c| Revision::from_entry(c, branch))
        .collect()
}

/// Collapse bursts of commits to one representative each.
///
/// Walking oldest first, a commit is kept when its successor lands more than
/// `window` after it. The newest commit is kept once `window` has elapsed
/// since it, measured against `now`.
pub fn time_batched(
    newest_first: &[CommitEntry],
    window: chrono::Duration,
    now: DateTime<FixedOffset>,
    branch: &str,
) -> Vec<Revision> {
    let mut kept = Vec::new();
    let mut previous: Option<&CommitEntry> = None;

    for entry in newest_first.iter().rev() {
        if let Some(prev) = previous {
            if entry.timestamp - prev.timestamp > window {
                debug!(revision = %prev.id, timestamp = %prev.timestamp, "taking batch representative");
                kept.push(Revision::from_entry(prev, branch));
            }
        }
        previous = Some(entry);
    }

    if let Some(last) = previous {
        if now - last.timestamp >= window {
            debug!(revision = %last.id, timestamp = %last.timestamp, "taking final revision");
            kept.push(Revision::from_entry(last, branch));
        }
    }

    kept
}

/// Drop empty and repeated identifiers, then keep the newest `max_count`.
pub fn finalize(selected: Vec<Revision>, max_count: usize) -> Vec<Revision> {
    let mut seen = HashSet::new();
    let unique: Vec<Revision> = selected
        .into_iter()
        .filter(|r| !r.id.trim().is_empty())
        .filter(|r| seen.insert(r.id.clone()))
        .collect();

    let skip = unique.len().saturating_sub(max_count);
    if skip > 0 {
        info!(dropped = skip, max_count, "truncating selection to newest revisions");
    }
    unique.into_iter().skip(skip).collect()
}
