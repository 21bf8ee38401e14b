//! Version-control log access.
//!
//! [`RevisionLog`] is the read-only view of a commit history the selector
//! consumes. [`GitLog`] implements it with the `git` CLI.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::DateTime;
use tokio::process::Command;
use tracing::debug;

use crate::config::RepoConfig;
use crate::domain::{BackfillError, CommitEntry, Result};

/// Separator between `git log` format fields (ASCII unit separator).
const FIELD_SEP: char = '\u{1f}';

/// Parameters of one log query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogQuery {
    /// Branch (or any revision) whose history is listed.
    pub branch: String,
    /// When set, list `since..branch` instead of the whole history.
    pub since: Option<String>,
    pub first_parent: bool,
    pub after: Option<String>,
    pub before: Option<String>,
}

impl LogQuery {
    /// Whole history of the configured branch.
    pub fn history(repo: &RepoConfig) -> Self {
        Self {
            branch: repo.branch.clone(),
            since: None,
            first_parent: repo.first_parent,
            after: repo.commit_after.clone(),
            before: repo.commit_before.clone(),
        }
    }

    /// Commits on the branch that are not on the main branch; the whole
    /// history when both are the same branch.
    pub fn range(repo: &RepoConfig) -> Self {
        let since = (repo.main_branch != repo.branch).then(|| repo.main_branch.clone());
        Self {
            since,
            ..Self::history(repo)
        }
    }

    fn revision_arg(&self) -> String {
        match &self.since {
            Some(since) => format!("{since}..{}", self.branch),
            None => self.branch.clone(),
        }
    }
}

/// A queryable, ordered commit history.
#[async_trait]
pub trait RevisionLog: Send + Sync {
    /// Commits matching the query, newest first.
    async fn commits(&self, query: &LogQuery) -> Result<Vec<CommitEntry>>;
}

/// [`RevisionLog`] backed by a local git checkout.
pub struct GitLog {
    repo_dir: PathBuf,
}

impl GitLog {
    pub fn new(repo_dir: impl AsRef<Path>) -> Self {
        Self {
            repo_dir: repo_dir.as_ref().to_path_buf(),
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    /// Check out the branch and optionally pull before selection.
    pub async fn sync(&self, branch: &str, pull: bool) -> Result<()> {
        self.git(&["checkout", branch]).await?;
        if pull {
            self.git(&["pull"]).await?;
        }
        Ok(())
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        if !self.repo_dir.is_dir() {
            return Err(BackfillError::SourceUnavailable(format!(
                "repository {} does not exist",
                self.repo_dir.display()
            )));
        }

        debug!(repo = %self.repo_dir.display(), ?args, "running git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BackfillError::SourceUnavailable(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackfillError::SourceUnavailable(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl RevisionLog for GitLog {
    async fn commits(&self, query: &LogQuery) -> Result<Vec<CommitEntry>> {
        let format = format!("--pretty=format:%H{FIELD_SEP}%cI{FIELD_SEP}%s");
        let revision = query.revision_arg();

        let mut args: Vec<String> = vec!["log".to_string(), format];
        if query.first_parent {
            args.push("--first-parent".to_string());
        }
        if let Some(after) = &query.after {
            args.push(format!("--after={after}"));
        }
        if let Some(before) = &query.before {
            args.push(format!("--before={before}"));
        }
        args.push(revision);
        args.push("--".to_string());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.git(&arg_refs).await?;
        parse_log(&stdout)
    }
}

/// Parse `%H<US>%cI<US>%s` lines; blank lines are ignored.
pub fn parse_log(text: &str) -> Result<Vec<CommitEntry>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut fields = line.splitn(3, FIELD_SEP);
            let id = fields.next().unwrap_or_default().trim();
            let date = fields.next().unwrap_or_default().trim();
            let subject = fields.next().unwrap_or_default();
            let timestamp = DateTime::parse_from_rfc3339(date).map_err(|e| {
                BackfillError::SourceUnavailable(format!(
                    "unreadable commit date \"{date}\" for {id}: {e}"
                ))
            })?;
            Ok(CommitEntry::new(id, timestamp, subject))
        })
        .collect()
}
