//! Performance backfill CLI
//!
//! The `backfill` command selects compiler revisions, builds and benchmarks
//! each of them, and uploads the aggregated timings to a dashboard.
//!
//! ## Commands
//!
//! - `run`: select revisions and drive them through the stage pipeline
//! - `select`: print the revisions a run would process
//! - `aggregate`: print statistics for one result directory
//! - `upload`: post one result directory to the dashboard

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn, Level};

use backfill_core::aggregate::{aggregate, aggregate_dir, load_records};
use backfill_core::obs::RevisionSpan;
use backfill_core::{
    BackfillConfig, BuildContext, CiStatusConfig, CollaboratorConfig, DashboardConfig,
    DashboardRecord, DashboardUploader, ExecutableSpec, FailurePolicy, GitLog, GithubStatusClient,
    RepoConfig, ResultPublisher, Revision, RevisionSelector, RunContext, SelectionConfig,
    StageSet, UploadOutcome,
};
use backfill_pipeline::workspace::{read_json, BUILD_CONTEXT_FILE, RUN_CONTEXT_FILE};
use backfill_pipeline::{
    BackfillPipeline, CommandHarness, ConfigureMakeBuilder, PipelineResult, StageStatus,
};

#[derive(Parser)]
#[command(name = "backfill")]
#[command(author = "Backfill Maintainers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Backfill compiler performance history", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Select revisions and run the requested stages for each
    Run {
        /// Root directory of the per-revision workspaces
        outdir: PathBuf,

        #[command(flatten)]
        selection: SelectionArgs,

        #[command(flatten)]
        stages: StageArgs,

        #[command(flatten)]
        dashboard: DashboardArgs,
    },

    /// Print the selected revisions, oldest first
    Select {
        #[command(flatten)]
        selection: SelectionArgs,
    },

    /// Print aggregated statistics of a result directory as JSON
    Aggregate {
        /// Result directory holding `.bench` files
        result_dir: PathBuf,
    },

    /// Aggregate a result directory and post it to the dashboard
    Upload {
        /// Result directory holding `.bench` files and context snapshots
        result_dir: PathBuf,

        #[command(flatten)]
        dashboard: DashboardArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct SelectionArgs {
    /// Source repository
    #[arg(long, env = "BACKFILL_REPO", default_value = "ocaml")]
    repo: PathBuf,

    /// Branch to backfill
    #[arg(long, default_value = backfill_core::config::DEFAULT_BRANCH)]
    branch: String,

    /// Main branch the backfilled branch forked from
    #[arg(long, default_value = backfill_core::config::DEFAULT_MAIN_BRANCH)]
    main_branch: String,

    /// Follow all parents instead of first parents only
    #[arg(long)]
    no_first_parent: bool,

    /// Check out the branch and pull before selecting
    #[arg(long)]
    repo_pull: bool,

    /// Only commits after this date
    #[arg(long)]
    commit_after: Option<String>,

    /// Only commits before this date
    #[arg(long)]
    commit_before: Option<String>,

    /// version_tags, status_success, hash=<h1,h2,...>, delay=HH:MM:SS or all
    #[arg(long, default_value = "version_tags")]
    commit_choice: String,

    /// Keep at most this many (the newest) revisions
    #[arg(long, default_value_t = backfill_core::config::DEFAULT_MAX_COUNT)]
    max_hashes: usize,

    /// Subject substring marking version commits
    #[arg(long, default_value = backfill_core::config::DEFAULT_VERSION_MARKER)]
    version_marker: String,

    /// CI status API base URL
    #[arg(long, default_value = backfill_core::config::DEFAULT_CI_STATUS_API)]
    github_api: String,

    /// `owner/repo` queried for CI status
    #[arg(long, default_value = backfill_core::config::DEFAULT_CI_STATUS_REPO)]
    github_repo: String,

    /// Token for CI status lookups
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct StageArgs {
    /// Comma-separated stages: build, benchmark, archive, upload
    #[arg(long, default_value = "build,benchmark,upload")]
    run_stages: String,

    /// Executable variant as name:configure_args
    #[arg(long, default_value = "vanilla:")]
    executable_spec: String,

    /// Environment tag recorded with every result
    #[arg(long, default_value = backfill_core::config::DEFAULT_ENVIRONMENT)]
    environment: String,

    /// Dashboard project (default: ocaml_<branch>)
    #[arg(long)]
    project_name: Option<String>,

    /// Comma-separated benchmarks (default: the standard micro-benchmark list)
    #[arg(long, value_delimiter = ',')]
    benchmarks: Vec<String>,

    /// Archive root; may be repeated
    #[arg(long = "archive-dir")]
    archive_dirs: Vec<PathBuf>,

    /// Upload this result timestamp instead of the newest
    #[arg(long)]
    upload_date_tag: Option<String>,

    /// Rebuild even when a finished build exists
    #[arg(long)]
    force_rebuild: bool,

    /// Benchmark again even when results exist
    #[arg(long)]
    rerun_benchmarks: bool,

    /// Upload again even when results were already accepted
    #[arg(long)]
    reupload: bool,

    /// Keep running later stages of a revision after one fails
    #[arg(long)]
    continue_on_failure: bool,

    /// Parallel make jobs
    #[arg(short = 'j', long, default_value_t = 1)]
    jobs: usize,

    /// Benchmark harness program
    #[arg(long, default_value = "run-benchmark")]
    harness: PathBuf,

    /// Extra harness argument; may be repeated
    #[arg(long = "harness-arg", allow_hyphen_values = true)]
    harness_args: Vec<String>,

    /// Command prefixed to every harness run, e.g. "taskset -c 2"
    #[arg(long)]
    pre_exec: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct DashboardArgs {
    /// Dashboard base URL
    #[arg(long, env = "CODESPEED_URL", default_value = backfill_core::config::DEFAULT_DASHBOARD_URL)]
    codespeed_url: String,

    /// Print the upload request instead of sending it
    #[arg(long)]
    dry_run: bool,
}

impl SelectionArgs {
    fn repo_config(&self) -> RepoConfig {
        RepoConfig {
            path: self.repo.clone(),
            branch: self.branch.clone(),
            main_branch: self.main_branch.clone(),
            first_parent: !self.no_first_parent,
            pull: self.repo_pull,
            commit_after: self.commit_after.clone(),
            commit_before: self.commit_before.clone(),
        }
    }

    fn selection_config(&self) -> Result<SelectionConfig> {
        let selection = SelectionConfig {
            policy: self.commit_choice.parse()?,
            max_count: self.max_hashes,
            version_marker: self.version_marker.clone(),
        };
        selection.validate()?;
        Ok(selection)
    }

    fn ci_status_config(&self) -> CiStatusConfig {
        CiStatusConfig {
            api_url: self.github_api.clone(),
            repo_slug: self.github_repo.clone(),
            token: self.github_token.clone(),
        }
    }
}

impl DashboardArgs {
    fn config(&self) -> DashboardConfig {
        DashboardConfig {
            url: self.codespeed_url.clone(),
            dry_run: self.dry_run,
        }
    }
}

/// Assemble and validate the configuration of a run.
fn build_config(
    outdir: &Path,
    selection: &SelectionArgs,
    stages: &StageArgs,
    dashboard: &DashboardArgs,
) -> Result<BackfillConfig> {
    let mut config = BackfillConfig::new(outdir);
    config.repo = selection.repo_config();
    config.selection = selection.selection_config()?;
    config.ci_status = selection.ci_status_config();
    config.stages = stages.run_stages.parse::<StageSet>()?;
    config.executable = stages.executable_spec.parse::<ExecutableSpec>()?;
    config.environment = stages.environment.clone();
    config.project_name = stages.project_name.clone();
    if !stages.benchmarks.is_empty() {
        config.benchmarks = stages
            .benchmarks
            .iter()
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .collect();
    }
    config.archive_roots = stages.archive_dirs.clone();
    config.dashboard = dashboard.config();
    config.upload_date_tag = stages.upload_date_tag.clone();
    config.force_rebuild = stages.force_rebuild;
    config.rerun_benchmarks = stages.rerun_benchmarks;
    config.reupload = stages.reupload;
    config.on_stage_failure = if stages.continue_on_failure {
        FailurePolicy::ContinueStages
    } else {
        FailurePolicy::AbandonRevision
    };
    config.collaborators = CollaboratorConfig {
        build_jobs: stages.jobs,
        harness_program: stages.harness.clone(),
        harness_args: stages.harness_args.clone(),
        pre_exec: stages
            .pre_exec
            .as_deref()
            .map(|p| p.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
    };

    config.validate()?;
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    backfill_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            outdir,
            selection,
            stages,
            dashboard,
        } => {
            let config = build_config(&outdir, &selection, &stages, &dashboard)?;
            cmd_run(config).await
        }
        Commands::Select { selection } => cmd_select(&selection).await,
        Commands::Aggregate { result_dir } => cmd_aggregate(&result_dir),
        Commands::Upload {
            result_dir,
            dashboard,
        } => cmd_upload(&result_dir, &dashboard.config()).await,
    }
}

async fn select_revisions(
    repo: &RepoConfig,
    selection: &SelectionConfig,
    ci_status: &CiStatusConfig,
) -> Result<Vec<Revision>> {
    let log = GitLog::new(&repo.path);
    if repo.pull {
        log.sync(&repo.branch, true)
            .await
            .context("Failed to update repository")?;
    }

    let ci = GithubStatusClient::new(ci_status.clone());
    let revisions = RevisionSelector::new(&log, repo, selection)
        .with_ci_status(&ci)
        .select()
        .await
        .context("Failed to select revisions")?;
    Ok(revisions)
}

async fn cmd_select(args: &SelectionArgs) -> Result<()> {
    let repo = args.repo_config();
    let selection = args.selection_config()?;
    let revisions = select_revisions(&repo, &selection, &args.ci_status_config()).await?;
    for revision in &revisions {
        println!("{}", revision.id);
    }
    Ok(())
}

async fn cmd_run(config: BackfillConfig) -> Result<()> {
    let revisions =
        select_revisions(&config.repo, &config.selection, &config.ci_status).await?;
    if revisions.is_empty() {
        warn!("no revisions selected");
        println!("No revisions selected.");
        return Ok(());
    }

    println!("Backfilling {} revision(s) of {}", revisions.len(), config.repo.branch);
    println!("Stages: {}", config.stages);
    println!("Executable: {}", config.executable);
    println!("Output: {}", config.outdir.display());
    println!();

    let builder = ConfigureMakeBuilder::new(config.repo.path.clone(), config.collaborators.build_jobs);
    let harness = CommandHarness::from_config(&config.collaborators);
    let uploader = DashboardUploader::new(config.dashboard.clone());
    let pipeline = BackfillPipeline::new(
        config,
        Arc::new(builder),
        Arc::new(harness),
        Arc::new(uploader),
    );

    let result = pipeline
        .run(&revisions)
        .await
        .context("Backfill run failed to start")?;

    print_summary(&result);

    if result.success() {
        println!("\n✓ All revisions processed");
        Ok(())
    } else {
        anyhow::bail!("{} revision(s) failed", result.failed_count())
    }
}

fn print_summary(result: &PipelineResult) {
    println!("Run ID: {}", result.run_id);
    println!("Timestamp: {}", result.run_timestamp);
    println!("Duration: {}ms", result.duration_ms);
    println!();

    for outcome in &result.revisions {
        let mark = if outcome.success() { "✓" } else { "✗" };
        println!("  {} {} ({})", mark, outcome.revision, outcome.state);
        for report in &outcome.stages {
            match &report.status {
                StageStatus::Completed => {
                    println!("      {}: completed ({}ms)", report.stage, report.duration_ms)
                }
                StageStatus::Skipped(reason) => println!("      {}: skipped, {}", report.stage, reason),
                StageStatus::Failed(failure) => println!("      {}: {}", report.stage, failure),
                StageStatus::NotRequested => {}
            }
        }
    }

    println!();
    println!(
        "Summary: {}/{} revisions succeeded",
        result.succeeded_count(),
        result.revisions.len()
    );
}

fn cmd_aggregate(result_dir: &Path) -> Result<()> {
    let set = load_records(result_dir)
        .with_context(|| format!("Failed to read {}", result_dir.display()))?;
    if !set.failures.is_empty() {
        warn!(count = set.failures.len(), "some lines could not be parsed");
    }
    let summaries = aggregate(&set.records);
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

/// Dashboard records for a result directory, using its context snapshots.
fn result_dir_records(result_dir: &Path) -> Result<Vec<DashboardRecord>> {
    let build: BuildContext = read_json(&result_dir.join(BUILD_CONTEXT_FILE))
        .with_context(|| format!("No build context in {}", result_dir.display()))?;
    let run: RunContext = read_json(&result_dir.join(RUN_CONTEXT_FILE))
        .with_context(|| format!("No run context in {}", result_dir.display()))?;

    let _span = RevisionSpan::enter(&build.commit_id);
    let results = aggregate_dir(result_dir, &build, &run)?;
    info!(results = results.len(), "aggregated result directory");
    Ok(results.iter().map(DashboardRecord::from_result).collect())
}

async fn cmd_upload(result_dir: &Path, dashboard: &DashboardConfig) -> Result<()> {
    let records = result_dir_records(result_dir)?;
    if records.is_empty() {
        anyhow::bail!("No parseable benchmark records in {}", result_dir.display());
    }

    let uploader = DashboardUploader::new(dashboard.clone());
    match uploader.publish(&records).await {
        UploadOutcome::DryRun { url, payload } => {
            println!("Dry run, would POST to {url}");
            println!("json={payload}");
            Ok(())
        }
        UploadOutcome::Accepted { body } => {
            println!("✓ Uploaded {} result(s): {}", records.len(), body);
            Ok(())
        }
        UploadOutcome::Rejected { status, body } => {
            println!("✗ Dashboard answered {status}");
            println!("{body}");
            Ok(())
        }
        UploadOutcome::Unreachable { error } => {
            println!("✗ Dashboard unreachable: {error}");
            Ok(())
        }
        UploadOutcome::Empty => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backfill_core::{RunStage, SelectionPolicy};
    use std::fs;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("arguments should parse")
    }

    fn run_config(args: &[&str]) -> Result<BackfillConfig> {
        let mut argv = vec!["backfill", "run", "/tmp/out"];
        argv.extend_from_slice(args);
        match parse(&argv).command {
            Commands::Run {
                outdir,
                selection,
                stages,
                dashboard,
            } => build_config(&outdir, &selection, &stages, &dashboard),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_run_defaults() {
        let config = run_config(&[]).unwrap();
        assert_eq!(config.outdir, PathBuf::from("/tmp/out"));
        assert_eq!(config.repo.branch, "4.07");
        assert_eq!(config.repo.main_branch, "trunk");
        assert!(config.repo.first_parent);
        assert_eq!(config.selection.policy, SelectionPolicy::VersionTags);
        assert_eq!(config.selection.max_count, 1000);
        assert_eq!(config.stages, StageSet::default());
        assert_eq!(config.executable, ExecutableSpec::default());
        assert_eq!(config.environment, "macbook");
        assert_eq!(config.project(), "ocaml_4.07");
        assert_eq!(config.benchmarks.len(), 17);
        assert_eq!(config.dashboard.url, "http://localhost:8000/");
        assert_eq!(config.on_stage_failure, FailurePolicy::AbandonRevision);
    }

    #[test]
    fn test_run_overrides() {
        let config = run_config(&[
            "--branch",
            "trunk",
            "--commit-choice",
            "delay=01:00:00",
            "--max-hashes",
            "5",
            "--run-stages",
            "operf,upload,build",
            "--executable-spec",
            "flambda:-flambda",
            "--benchmarks",
            "kb,almabench",
            "--archive-dir",
            "/mnt/a",
            "--archive-dir",
            "/mnt/b",
            "--pre-exec",
            "taskset -c 2",
            "--harness-arg",
            "--iterations=3",
            "--continue-on-failure",
            "--dry-run",
        ])
        .unwrap();

        assert_eq!(
            config.selection.policy,
            SelectionPolicy::TimeBatched(std::time::Duration::from_secs(3600))
        );
        assert_eq!(config.selection.max_count, 5);
        let stages: Vec<RunStage> = config.stages.iter().collect();
        assert_eq!(stages, vec![RunStage::Build, RunStage::Benchmark, RunStage::Upload]);
        assert_eq!(config.executable.name, "flambda");
        assert_eq!(config.benchmarks, vec!["kb", "almabench"]);
        assert_eq!(config.archive_roots.len(), 2);
        assert_eq!(config.collaborators.pre_exec, vec!["taskset", "-c", "2"]);
        assert_eq!(config.collaborators.harness_args, vec!["--iterations=3"]);
        assert_eq!(config.on_stage_failure, FailurePolicy::ContinueStages);
        assert_eq!(config.project(), "ocaml_trunk");
        assert!(config.dashboard.dry_run);
    }

    #[test]
    fn test_bad_spec_strings_are_rejected() {
        assert!(run_config(&["--commit-choice", "nightly"]).is_err());
        assert!(run_config(&["--executable-spec", "flambda"]).is_err());
        assert!(run_config(&["--run-stages", "build,deploy"]).is_err());
        assert!(run_config(&["--max-hashes", "0"]).is_err());
    }

    #[test]
    fn test_select_rejects_zero_max_hashes() {
        let Commands::Select { selection } =
            parse(&["backfill", "select", "--max-hashes", "0"]).command
        else {
            unreachable!()
        };
        let err = selection.selection_config().unwrap_err();
        assert!(err.to_string().contains("max count"));
    }

    #[tokio::test]
    async fn test_upload_dry_run_from_result_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(BUILD_CONTEXT_FILE),
            r#"{"commitid":"abcdef0","commitid_long":"abcdef0123","branch":"trunk","project":"ocaml_trunk","executable":"vanilla","executable_description":"./configure "}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join(RUN_CONTEXT_FILE),
            r#"{"environment":"macbook","run_timestamp":"20190101_000000"}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("kb.bench"),
            "{\"name\":\"kb\",\"time_secs\":1.0}\n{\"name\":\"kb\",\"time_secs\":2.0}\n",
        )
        .unwrap();

        let records = result_dir_records(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mean, 1.5);

        let dashboard = DashboardConfig {
            url: "http://127.0.0.1:1/".to_string(),
            dry_run: true,
        };
        cmd_upload(dir.path(), &dashboard).await.unwrap();
    }

    #[test]
    fn test_upload_needs_context() {
        let dir = tempfile::tempdir().unwrap();
        assert!(result_dir_records(dir.path()).is_err());
    }
}
