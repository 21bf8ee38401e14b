//! External collaborators driven by the build and benchmark stages.
//!
//! The pipeline only talks to these traits; process-backed implementations
//! live in [`crate::runner`], tests inject their own.

use std::path::PathBuf;

use async_trait::async_trait;
use backfill_core::{ExecutableSpec, StageFailure};

/// Everything needed to build one revision.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub revision: String,
    pub branch: String,
    /// Install prefix; the build is complete once `bin/ocaml` exists below it.
    pub build_dir: PathBuf,
    /// Scratch directory for the source checkout.
    pub source_dir: PathBuf,
    pub executable: ExecutableSpec,
    /// All collaborator output is appended here.
    pub log_path: PathBuf,
}

/// Produces an installed compiler tree for a revision.
#[async_trait]
pub trait BuildCollaborator: Send + Sync {
    async fn build(&self, request: &BuildRequest) -> Result<(), StageFailure>;
}

/// One benchmark of one revision.
#[derive(Debug, Clone)]
pub struct BenchmarkRequest {
    pub revision: String,
    pub benchmark: String,
    pub bin_dir: PathBuf,
    /// Where the harness must leave its JSON-lines records.
    pub output: PathBuf,
    pub log_path: PathBuf,
}

/// Runs a single benchmark against a build.
#[async_trait]
pub trait BenchmarkHarness: Send + Sync {
    async fn run_benchmark(&self, request: &BenchmarkRequest) -> Result<(), StageFailure>;
}
