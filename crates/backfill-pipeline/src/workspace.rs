//! On-disk state of one revision.
//!
//! ```text
//! {outdir}/{revision}/
//!     ocaml_build/               build output, complete once bin/ocaml exists
//!         build_context.json
//!         src/                   source checkout used by the builder
//!     results/{timestamp}/       one directory per benchmark run
//!         <benchmark>.bench
//!         build_context.json
//!         run_context.json       written last
//!         upload_receipt.json    written after a live upload
//!     {stage}_{timestamp}.log
//! ```
//!
//! The presence of these files is the only record of progress.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use backfill_core::{Result, RunStage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const BUILD_DIR: &str = "ocaml_build";
pub const SOURCE_DIR: &str = "src";
pub const RESULTS_DIR: &str = "results";
/// Relative to the build directory.
pub const BUILD_MARKER: &str = "bin/ocaml";
pub const BUILD_CONTEXT_FILE: &str = "build_context.json";
pub const RUN_CONTEXT_FILE: &str = "run_context.json";
pub const UPLOAD_RECEIPT_FILE: &str = "upload_receipt.json";
pub const LOG_EXTENSION: &str = "log";

/// Timestamp format of result directories and logs.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Written after the dashboard accepted a result directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub uploaded_at: String,
    pub records: usize,
    pub response: String,
}

/// Paths and completion checks for one revision.
#[derive(Debug, Clone)]
pub struct RevisionWorkspace {
    root: PathBuf,
    revision: String,
}

impl RevisionWorkspace {
    pub fn new(outdir: &Path, revision: &str) -> Self {
        Self {
            root: outdir.join(revision),
            revision: revision.to_string(),
        }
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the revision directory.
    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    pub fn build_dir(&self) -> PathBuf {
        self.root.join(BUILD_DIR)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.build_dir().join("bin")
    }

    pub fn source_dir(&self) -> PathBuf {
        self.build_dir().join(SOURCE_DIR)
    }

    pub fn build_marker(&self) -> PathBuf {
        self.build_dir().join(BUILD_MARKER)
    }

    pub fn build_context_path(&self) -> PathBuf {
        self.build_dir().join(BUILD_CONTEXT_FILE)
    }

    pub fn results_root(&self) -> PathBuf {
        self.root.join(RESULTS_DIR)
    }

    pub fn result_dir(&self, timestamp: &str) -> PathBuf {
        self.results_root().join(timestamp)
    }

    pub fn log_path(&self, stage: RunStage, timestamp: &str) -> PathBuf {
        self.root
            .join(format!("{}_{timestamp}.{LOG_EXTENSION}", stage.name()))
    }

    /// Build completed: the primary executable exists.
    ///
    /// Directory existence alone is not enough; an interrupted build leaves
    /// the directory behind without the marker.
    pub fn is_built(&self) -> bool {
        self.build_marker().is_file()
    }

    /// Result directories that finished, oldest first.
    pub fn completed_result_dirs(&self) -> Vec<(String, PathBuf)> {
        let Ok(entries) = fs::read_dir(self.results_root()) else {
            return Vec::new();
        };
        let mut dirs: Vec<(String, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| is_complete_result_dir(p))
            .filter_map(|p| {
                let name = p.file_name()?.to_str()?.to_string();
                Some((name, p))
            })
            .collect();
        dirs.sort();
        dirs
    }

    /// Newest finished result directory.
    pub fn latest_result_dir(&self) -> Option<PathBuf> {
        self.completed_result_dirs().pop().map(|(_, p)| p)
    }

    /// The pinned result directory if given, else the newest one.
    ///
    /// A pinned tag that does not name a finished directory yields `None`.
    pub fn select_result_dir(&self, pinned: Option<&str>) -> Option<PathBuf> {
        match pinned {
            Some(tag) => {
                let dir = self.result_dir(tag);
                is_complete_result_dir(&dir).then_some(dir)
            }
            None => self.latest_result_dir(),
        }
    }

    pub fn is_benchmarked(&self) -> bool {
        self.latest_result_dir().is_some()
    }

    /// Stage log files, sorted.
    pub fn log_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut logs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == LOG_EXTENSION))
            .collect();
        logs.sort();
        logs
    }
}

pub fn is_complete_result_dir(dir: &Path) -> bool {
    dir.join(RUN_CONTEXT_FILE).is_file()
}

pub fn is_uploaded(result_dir: &Path) -> bool {
    result_dir.join(UPLOAD_RECEIPT_FILE).is_file()
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
