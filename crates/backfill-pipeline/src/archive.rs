//! Copies finished result directories to archive roots.
//!
//! Destination below each root:
//! `{environment}/{project}__{branch}/{revision}/{executable}/{timestamp}/`.
//! Stage logs of the revision are copied into a `logs/` subdirectory.

use std::fs;
use std::path::{Path, PathBuf};

use backfill_core::Result;
use tracing::{debug, warn};

use crate::workspace::BUILD_CONTEXT_FILE;

/// Identifies where one result directory lands inside an archive root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveTarget {
    pub environment: String,
    pub project: String,
    pub branch: String,
    pub revision: String,
    pub executable: String,
    pub timestamp: String,
}

impl ArchiveTarget {
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.environment)
            .join(format!("{}__{}", self.project, self.branch))
            .join(&self.revision)
            .join(&self.executable)
            .join(&self.timestamp)
    }

    pub fn destination(&self, root: &Path) -> PathBuf {
        root.join(self.relative_path())
    }
}

/// What an archive pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    pub copied_to: Vec<PathBuf>,
    pub missing_roots: Vec<PathBuf>,
    /// Reachable roots where copying failed part way.
    pub failed_roots: Vec<PathBuf>,
    pub files_copied: usize,
}

impl ArchiveReport {
    pub fn is_complete(&self) -> bool {
        self.failed_roots.is_empty()
    }
}

/// Archived means at least one root is reachable and every reachable root
/// holds a copy with its build context.
pub fn is_archived(roots: &[PathBuf], target: &ArchiveTarget) -> bool {
    let mut reachable = roots.iter().filter(|root| root.is_dir()).peekable();
    reachable.peek().is_some()
        && reachable.all(|root| target.destination(root).join(BUILD_CONTEXT_FILE).is_file())
}

/// Copy `result_dir` and `logs` to every existing root. A root that cannot be
/// written is recorded in the report and the remaining roots are still tried.
pub fn archive_result_dir(
    result_dir: &Path,
    logs: &[PathBuf],
    roots: &[PathBuf],
    target: &ArchiveTarget,
) -> ArchiveReport {
    let mut report = ArchiveReport::default();

    for root in roots {
        if !root.is_dir() {
            warn!(root = %root.display(), "archive root missing, skipping");
            report.missing_roots.push(root.clone());
            continue;
        }

        let dest = target.destination(root);
        match copy_to_root(result_dir, logs, &dest) {
            Ok(files) => {
                debug!(dest = %dest.display(), files, "archived results");
                report.files_copied += files;
                report.copied_to.push(dest);
            }
            Err(e) => {
                warn!(root = %root.display(), error = %e, "archive copy failed");
                report.failed_roots.push(root.clone());
            }
        }
    }

    report
}

fn copy_to_root(result_dir: &Path, logs: &[PathBuf], dest: &Path) -> Result<usize> {
    let mut copied = copy_tree(result_dir, dest)?;
    if !logs.is_empty() {
        let log_dir = dest.join("logs");
        fs::create_dir_all(&log_dir)?;
        for log in logs {
            if let Some(name) = log.file_name() {
                fs::copy(log, log_dir.join(name))?;
                copied += 1;
            }
        }
    }
    Ok(copied)
}

/// Recursively copy `src` into `dst`, returning the number of files copied.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let path = entry?.path();
        let Some(name) = path.file_name() else {
            continue;
        };
        if path.is_dir() {
            copied += copy_tree(&path, &dst.join(name))?;
        } else {
            fs::copy(&path, dst.join(name))?;
            copied += 1;
        }
    }
    Ok(copied)
}
