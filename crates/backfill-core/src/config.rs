//! Run configuration.
//!
//! A [`BackfillConfig`] is assembled once at the process boundary and passed
//! by reference to every component. Nothing in the library reads process-wide
//! defaults on its own.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::{BackfillError, SelectionPolicy, StageSet};

pub const DEFAULT_BRANCH: &str = "4.07";
pub const DEFAULT_MAIN_BRANCH: &str = "trunk";
pub const DEFAULT_ENVIRONMENT: &str = "macbook";
pub const DEFAULT_DASHBOARD_URL: &str = "http://localhost:8000/";
pub const DEFAULT_MAX_COUNT: usize = 1000;
pub const DEFAULT_VERSION_MARKER: &str = "VERSION";
pub const DEFAULT_CI_STATUS_API: &str = "https://api.github.com";
pub const DEFAULT_CI_STATUS_REPO: &str = "ocaml/ocaml";

/// Benchmarks run when no explicit list is configured.
pub const DEFAULT_BENCHMARKS: &[&str] = &[
    "almabench",
    "nucleic",
    "boyer",
    "kb",
    "num_analysis",
    "bigarray_rev",
    "fibonnaci",
    "lens",
    "kahan_sum",
    "hamming",
    "sieve",
    "list",
    "format",
    "fft",
    "bdd",
    "sequence",
    "nullable_array",
];

/// Executable variant: a dashboard name plus the configure arguments that
/// produce it. Textual form is `name:configure_args`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableSpec {
    pub name: String,
    pub configure_args: String,
}

impl ExecutableSpec {
    /// Human-readable description shown on the dashboard.
    pub fn description(&self) -> String {
        format!("./configure {}", self.configure_args)
    }

    /// Configure arguments split on whitespace.
    pub fn configure_argv(&self) -> Vec<String> {
        self.configure_args
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

impl Default for ExecutableSpec {
    fn default() -> Self {
        Self {
            name: "vanilla".to_string(),
            configure_args: String::new(),
        }
    }
}

impl FromStr for ExecutableSpec {
    type Err = BackfillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, args) = s.split_once(':').ok_or_else(|| {
            BackfillError::Configuration(format!(
                "executable spec \"{s}\" must have the form name:configure_args"
            ))
        })?;
        let name = name.trim();
        if name.is_empty() {
            return Err(BackfillError::Configuration(format!(
                "executable spec \"{s}\" has an empty name"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            configure_args: args.trim().to_string(),
        })
    }
}

impl fmt::Display for ExecutableSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.configure_args)
    }
}

/// What to do with the remaining stages of a revision after one fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip the remaining stages and move to the next revision.
    #[default]
    AbandonRevision,
    /// Still attempt the remaining stages of the same revision.
    ContinueStages,
}

/// Repository the revisions come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub path: PathBuf,
    pub branch: String,
    pub main_branch: String,
    /// Follow first parents only, which keeps date ordering sane on merges.
    pub first_parent: bool,
    /// Check out the branch and pull before reading the log.
    pub pull: bool,
    /// Only commits after this date (anything `git log --after` accepts).
    pub commit_after: Option<String>,
    /// Only commits before this date.
    pub commit_before: Option<String>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ocaml"),
            branch: DEFAULT_BRANCH.to_string(),
            main_branch: DEFAULT_MAIN_BRANCH.to_string(),
            first_parent: true,
            pull: false,
            commit_after: None,
            commit_before: None,
        }
    }
}

/// Revision selection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionConfig {
    pub policy: SelectionPolicy,
    /// Keep at most this many (the newest) revisions.
    pub max_count: usize,
    /// Subject substring identifying version bump commits.
    pub version_marker: String,
}

impl SelectionConfig {
    pub fn validate(&self) -> Result<(), BackfillError> {
        if self.max_count == 0 {
            return Err(BackfillError::Configuration(
                "max count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            policy: SelectionPolicy::default(),
            max_count: DEFAULT_MAX_COUNT,
            version_marker: DEFAULT_VERSION_MARKER.to_string(),
        }
    }
}

/// CI status lookup settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiStatusConfig {
    pub api_url: String,
    /// `owner/repo` slug.
    pub repo_slug: String,
    #[serde(skip_serializing)]
    pub token: Option<String>,
}

impl Default for CiStatusConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_CI_STATUS_API.to_string(),
            repo_slug: DEFAULT_CI_STATUS_REPO.to_string(),
            token: None,
        }
    }
}

/// Dashboard upload settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardConfig {
    pub url: String,
    pub dry_run: bool,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DASHBOARD_URL.to_string(),
            dry_run: false,
        }
    }
}

/// External programs driven by the build and benchmark stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    /// Number of parallel make jobs.
    pub build_jobs: usize,
    /// Benchmark harness executable.
    pub harness_program: PathBuf,
    /// Extra arguments passed to the harness before the per-benchmark ones.
    pub harness_args: Vec<String>,
    /// Wrapper prepended to each harness invocation (e.g. `taskset -c 2`).
    pub pre_exec: Vec<String>,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            build_jobs: 1,
            harness_program: PathBuf::from("run-benchmark"),
            harness_args: Vec::new(),
            pre_exec: Vec::new(),
        }
    }
}

/// Complete configuration of one backfill run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Root of all revision workspaces.
    pub outdir: PathBuf,
    pub repo: RepoConfig,
    pub selection: SelectionConfig,
    pub ci_status: CiStatusConfig,
    pub stages: StageSet,
    pub executable: ExecutableSpec,
    /// Environment tag recorded with every result.
    pub environment: String,
    /// Dashboard project; defaults to `ocaml_<branch>`.
    pub project_name: Option<String>,
    pub benchmarks: Vec<String>,
    pub archive_roots: Vec<PathBuf>,
    pub dashboard: DashboardConfig,
    /// Upload this result timestamp instead of the newest one.
    pub upload_date_tag: Option<String>,
    pub force_rebuild: bool,
    pub rerun_benchmarks: bool,
    pub reupload: bool,
    pub on_stage_failure: FailurePolicy,
    pub collaborators: CollaboratorConfig,
}

impl BackfillConfig {
    pub fn new(outdir: impl Into<PathBuf>) -> Self {
        Self {
            outdir: outdir.into(),
            repo: RepoConfig::default(),
            selection: SelectionConfig::default(),
            ci_status: CiStatusConfig::default(),
            stages: StageSet::default(),
            executable: ExecutableSpec::default(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            project_name: None,
            benchmarks: DEFAULT_BENCHMARKS.iter().map(|b| b.to_string()).collect(),
            archive_roots: Vec::new(),
            dashboard: DashboardConfig::default(),
            upload_date_tag: None,
            force_rebuild: false,
            rerun_benchmarks: false,
            reupload: false,
            on_stage_failure: FailurePolicy::default(),
            collaborators: CollaboratorConfig::default(),
        }
    }

    /// Dashboard project name for this run.
    pub fn project(&self) -> String {
        self.project_name
            .clone()
            .unwrap_or_else(|| format!("ocaml_{}", self.repo.branch))
    }

    /// Reject combinations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<(), BackfillError> {
        self.selection.validate()?;
        if self.stages.is_empty() {
            return Err(BackfillError::Configuration(
                "no stages requested".to_string(),
            ));
        }
        if self.environment.trim().is_empty() {
            return Err(BackfillError::Configuration(
                "environment tag must not be empty".to_string(),
            ));
        }
        if self.stages.contains(crate::domain::RunStage::Benchmark) && self.benchmarks.is_empty()
        {
            return Err(BackfillError::Configuration(
                "benchmark stage requested with an empty benchmark list".to_string(),
            ));
        }
        if self.repo.commit_after.as_deref().is_some_and(str::is_empty)
            || self.repo.commit_before.as_deref().is_some_and(str::is_empty)
        {
            return Err(BackfillError::Configuration(
                "commit date bounds must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
