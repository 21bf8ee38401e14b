//! Stage pipeline orchestration.
//!
//! Revisions are processed one at a time and their stages strictly in
//! `build → benchmark → archive → upload` order. A stage is skipped when its
//! output already exists in the revision workspace, so re-running against the
//! same output directory resumes where the previous run stopped.

use std::fmt::Display;
use std::fs;
use std::sync::Arc;
use std::time::Instant;

use backfill_core::aggregate::{aggregate_dir, RAW_RESULT_EXTENSION};
use backfill_core::obs::{
    emit_benchmark_failed, emit_revision_finished, emit_revision_started, emit_run_finished,
    emit_run_started, emit_stage_completed, emit_stage_failed, emit_stage_skipped,
    emit_upload_outcome, revision_span,
};
use backfill_core::{
    BackfillConfig, BuildContext, DashboardRecord, FailurePolicy, ResultPublisher, Result,
    Revision, RunContext, RunStage, StageFailure, UploadOutcome,
};
use chrono::Local;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::archive::{archive_result_dir, is_archived, ArchiveTarget};
use crate::collaborator::{BenchmarkHarness, BenchmarkRequest, BuildCollaborator, BuildRequest};
use crate::stage::{RevisionState, StageReport, StageStatus};
use crate::workspace::{
    is_uploaded, read_json, write_json, RevisionWorkspace, UploadReceipt, BUILD_CONTEXT_FILE,
    RUN_CONTEXT_FILE, TIMESTAMP_FORMAT, UPLOAD_RECEIPT_FILE,
};

/// Everything that happened to one revision.
#[derive(Debug, Clone)]
pub struct RevisionOutcome {
    pub revision: String,
    pub state: RevisionState,
    /// One report per stage, in stage order.
    pub stages: Vec<StageReport>,
}

impl RevisionOutcome {
    pub fn success(&self) -> bool {
        !self.state.is_failed()
    }

    pub fn report(&self, stage: RunStage) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    pub fn failures(&self) -> Vec<&StageFailure> {
        self.stages
            .iter()
            .filter_map(|r| match &r.status {
                StageStatus::Failed(f) => Some(f),
                _ => None,
            })
            .collect()
    }
}

/// Result of a complete backfill run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub run_id: String,

    /// Timestamp naming this run's result directories and logs.
    pub run_timestamp: String,

    pub revisions: Vec<RevisionOutcome>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        self.revisions.iter().all(RevisionOutcome::success)
    }

    /// Number of revisions without a failed stage.
    pub fn succeeded_count(&self) -> usize {
        self.revisions.iter().filter(|r| r.success()).count()
    }

    /// Number of revisions with at least one failed stage.
    pub fn failed_count(&self) -> usize {
        self.revisions.iter().filter(|r| !r.success()).count()
    }

    pub fn outcome(&self, revision: &str) -> Option<&RevisionOutcome> {
        self.revisions.iter().find(|r| r.revision == revision)
    }
}

fn stage_failure(revision: &str, stage: RunStage, err: impl Display) -> StageFailure {
    StageFailure::new(revision, stage, err.to_string())
}

/// Drives revisions through the requested stages.
pub struct BackfillPipeline {
    config: BackfillConfig,
    builder: Arc<dyn BuildCollaborator>,
    harness: Arc<dyn BenchmarkHarness>,
    publisher: Arc<dyn ResultPublisher>,
    run_id: String,
    run_timestamp: String,
}

impl BackfillPipeline {
    pub fn new(
        config: BackfillConfig,
        builder: Arc<dyn BuildCollaborator>,
        harness: Arc<dyn BenchmarkHarness>,
        publisher: Arc<dyn ResultPublisher>,
    ) -> Self {
        Self {
            config,
            builder,
            harness,
            publisher,
            run_id: Uuid::new_v4().to_string(),
            run_timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    /// Use a fixed run timestamp instead of the current time.
    pub fn with_run_timestamp(mut self, timestamp: &str) -> Self {
        self.run_timestamp = timestamp.to_string();
        self
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    pub fn run_timestamp(&self) -> &str {
        &self.run_timestamp
    }

    pub fn workspace(&self, revision: &str) -> RevisionWorkspace {
        RevisionWorkspace::new(&self.config.outdir, revision)
    }

    /// Process every revision in order.
    ///
    /// Only an invalid configuration is an error; stage failures are
    /// recorded in the result and the run moves on.
    pub async fn run(&self, revisions: &[Revision]) -> Result<PipelineResult> {
        self.config.validate()?;
        let start = Instant::now();
        emit_run_started(&self.run_id, revisions.len(), &self.config.stages.to_string());

        let mut outcomes = Vec::with_capacity(revisions.len());
        for (index, revision) in revisions.iter().enumerate() {
            let outcome = self
                .process_revision(index, revisions.len(), revision)
                .instrument(revision_span(&revision.id))
                .await;
            outcomes.push(outcome);
        }

        let result = PipelineResult {
            run_id: self.run_id.clone(),
            run_timestamp: self.run_timestamp.clone(),
            revisions: outcomes,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        emit_run_finished(
            &result.run_id,
            result.duration_ms,
            result.succeeded_count(),
            result.failed_count(),
        );
        Ok(result)
    }

    async fn process_revision(
        &self,
        index: usize,
        total: usize,
        revision: &Revision,
    ) -> RevisionOutcome {
        emit_revision_started(&revision.id, index + 1, total);
        let ws = self.workspace(&revision.id);

        let mut state = RevisionState::Pending;
        let mut first_failure: Option<RunStage> = None;
        let mut reports = Vec::with_capacity(RunStage::ORDER.len());

        for stage in RunStage::ORDER {
            if !self.config.stages.contains(stage) {
                reports.push(StageReport::new(stage, StageStatus::NotRequested, 0));
                continue;
            }

            if let Some(failed) = first_failure {
                if self.config.on_stage_failure == FailurePolicy::AbandonRevision {
                    let reason = format!("{failed} failed earlier");
                    emit_stage_skipped(&revision.id, stage, &reason);
                    reports.push(StageReport::new(stage, StageStatus::Skipped(reason), 0));
                    continue;
                }
            }

            if let Some(reason) = self.skip_reason(&ws, stage) {
                emit_stage_skipped(&revision.id, stage, &reason);
                state = RevisionState::finished(stage);
                reports.push(StageReport::new(stage, StageStatus::Skipped(reason), 0));
                continue;
            }

            state = RevisionState::running(stage);
            info!(stage = %stage, state = %state, "executing stage");
            let start = Instant::now();
            let result = self.execute(stage, &ws, revision).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            let status = match result {
                Ok(()) => {
                    emit_stage_completed(&revision.id, stage, duration_ms);
                    state = RevisionState::finished(stage);
                    StageStatus::Completed
                }
                Err(failure) => {
                    emit_stage_failed(&revision.id, stage, &failure);
                    first_failure.get_or_insert(stage);
                    StageStatus::Failed(failure)
                }
            };
            reports.push(StageReport::new(stage, status, duration_ms));
        }

        let state = match first_failure {
            Some(stage) => RevisionState::Failed(stage),
            None if state == RevisionState::Pending => state,
            None => RevisionState::Done,
        };
        emit_revision_finished(&revision.id, !state.is_failed());

        RevisionOutcome {
            revision: revision.id.clone(),
            state,
            stages: reports,
        }
    }

    /// Whether the output of `stage` already exists for `revision`.
    ///
    /// Decided from workspace contents alone; force flags are not consulted.
    pub fn is_stage_complete(&self, revision: &str, stage: RunStage) -> bool {
        let ws = self.workspace(revision);
        match stage {
            RunStage::Build => ws.is_built(),
            RunStage::Benchmark => ws.is_benchmarked(),
            RunStage::Archive => ws
                .latest_result_dir()
                .and_then(|dir| self.archive_target(revision, &dir))
                .is_some_and(|target| is_archived(&self.config.archive_roots, &target)),
            RunStage::Upload => ws
                .select_result_dir(self.config.upload_date_tag.as_deref())
                .is_some_and(|dir| is_uploaded(&dir)),
        }
    }

    fn skip_reason(&self, ws: &RevisionWorkspace, stage: RunStage) -> Option<String> {
        let forced = match stage {
            RunStage::Build => self.config.force_rebuild,
            RunStage::Benchmark => self.config.rerun_benchmarks,
            RunStage::Archive => false,
            RunStage::Upload => self.config.reupload,
        };
        if stage == RunStage::Archive && self.config.archive_roots.is_empty() {
            return Some("no archive roots configured".to_string());
        }
        if forced || !self.is_stage_complete(ws.revision(), stage) {
            return None;
        }
        let reason = match stage {
            RunStage::Build => "build artifact present",
            RunStage::Benchmark => "results present",
            RunStage::Archive => "already archived",
            RunStage::Upload => "already uploaded",
        };
        Some(reason.to_string())
    }

    async fn execute(
        &self,
        stage: RunStage,
        ws: &RevisionWorkspace,
        revision: &Revision,
    ) -> std::result::Result<(), StageFailure> {
        match stage {
            RunStage::Build => self.build(ws, revision).await,
            RunStage::Benchmark => self.benchmark(ws, revision).await,
            RunStage::Archive => self.archive(ws, revision),
            RunStage::Upload => self.upload(ws, revision).await,
        }
    }

    /// Identifying metadata recorded with a build and its results.
    pub fn build_context(&self, revision: &Revision) -> BuildContext {
        BuildContext {
            commit_id_short: revision.short_id().to_string(),
            commit_id: revision.id.clone(),
            branch: revision.branch.clone(),
            project: self.config.project(),
            executable: self.config.executable.name.clone(),
            executable_description: self.config.executable.description(),
        }
    }

    async fn build(
        &self,
        ws: &RevisionWorkspace,
        revision: &Revision,
    ) -> std::result::Result<(), StageFailure> {
        let rev = revision.id.as_str();
        let log_path = ws.log_path(RunStage::Build, &self.run_timestamp);
        let fail = |e: &dyn Display| stage_failure(rev, RunStage::Build, e).with_log(&log_path);

        let build_dir = ws.build_dir();
        if build_dir.exists() {
            warn!(dir = %build_dir.display(), "removing unfinished or forced build directory");
            fs::remove_dir_all(&build_dir).map_err(|e| fail(&e))?;
        }
        ws.ensure().map_err(|e| fail(&e))?;

        let request = BuildRequest {
            revision: revision.id.clone(),
            branch: revision.branch.clone(),
            build_dir: build_dir.clone(),
            source_dir: ws.source_dir(),
            executable: self.config.executable.clone(),
            log_path: log_path.clone(),
        };
        self.builder.build(&request).await?;

        if !ws.is_built() {
            return Err(fail(&format!(
                "build finished without producing {}",
                ws.build_marker().display()
            )));
        }
        write_json(&ws.build_context_path(), &self.build_context(revision)).map_err(|e| fail(&e))
    }

    async fn benchmark(
        &self,
        ws: &RevisionWorkspace,
        revision: &Revision,
    ) -> std::result::Result<(), StageFailure> {
        let rev = revision.id.as_str();
        let log_path = ws.log_path(RunStage::Benchmark, &self.run_timestamp);
        let fail = |e: &dyn Display| stage_failure(rev, RunStage::Benchmark, e).with_log(&log_path);

        if !ws.is_built() {
            return Err(fail(&"no finished build to benchmark"));
        }

        let result_dir = ws.result_dir(&self.run_timestamp);
        if result_dir.exists() {
            fs::remove_dir_all(&result_dir).map_err(|e| fail(&e))?;
        }
        fs::create_dir_all(&result_dir).map_err(|e| fail(&e))?;

        let mut succeeded = 0;
        for benchmark in &self.config.benchmarks {
            let request = BenchmarkRequest {
                revision: revision.id.clone(),
                benchmark: benchmark.clone(),
                bin_dir: ws.bin_dir(),
                output: result_dir.join(format!("{benchmark}.{RAW_RESULT_EXTENSION}")),
                log_path: log_path.clone(),
            };
            match self.harness.run_benchmark(&request).await {
                Ok(()) => succeeded += 1,
                Err(failure) => {
                    emit_benchmark_failed(rev, benchmark, &failure);
                    // Partial output of a failed benchmark must not be aggregated.
                    if request.output.exists() {
                        fs::remove_file(&request.output).map_err(|e| fail(&e))?;
                    }
                }
            }
        }

        if succeeded == 0 {
            return Err(fail(&format!(
                "all {} benchmarks failed",
                self.config.benchmarks.len()
            )));
        }
        info!(
            succeeded,
            failed = self.config.benchmarks.len() - succeeded,
            dir = %result_dir.display(),
            "benchmarks finished"
        );

        let build_context = read_json::<BuildContext>(&ws.build_context_path())
            .unwrap_or_else(|_| self.build_context(revision));
        write_json(&result_dir.join(BUILD_CONTEXT_FILE), &build_context).map_err(|e| fail(&e))?;

        let run_context = RunContext {
            environment: self.config.environment.clone(),
            run_timestamp: self.run_timestamp.clone(),
        };
        write_json(&result_dir.join(RUN_CONTEXT_FILE), &run_context).map_err(|e| fail(&e))
    }

    fn archive_target(&self, revision: &str, result_dir: &std::path::Path) -> Option<ArchiveTarget> {
        let timestamp = result_dir.file_name()?.to_str()?.to_string();
        Some(ArchiveTarget {
            environment: self.config.environment.clone(),
            project: self.config.project(),
            branch: self.config.repo.branch.clone(),
            revision: revision.to_string(),
            executable: self.config.executable.name.clone(),
            timestamp,
        })
    }

    fn archive(
        &self,
        ws: &RevisionWorkspace,
        revision: &Revision,
    ) -> std::result::Result<(), StageFailure> {
        let rev = revision.id.as_str();
        let fail = |e: &dyn Display| stage_failure(rev, RunStage::Archive, e);

        let Some(result_dir) = ws.latest_result_dir() else {
            return Err(fail(&"no finished result directory to archive"));
        };
        let Some(target) = self.archive_target(rev, &result_dir) else {
            return Err(fail(&format!(
                "result directory {} has no usable name",
                result_dir.display()
            )));
        };

        let report = archive_result_dir(
            &result_dir,
            &ws.log_files(),
            &self.config.archive_roots,
            &target,
        );
        info!(
            roots = report.copied_to.len(),
            missing = report.missing_roots.len(),
            failed = report.failed_roots.len(),
            files = report.files_copied,
            "archive finished"
        );
        if !report.is_complete() {
            let roots: Vec<String> = report
                .failed_roots
                .iter()
                .map(|root| root.display().to_string())
                .collect();
            return Err(fail(&format!(
                "copy failed for archive roots: {}",
                roots.join(", ")
            )));
        }
        Ok(())
    }

    async fn upload(
        &self,
        ws: &RevisionWorkspace,
        revision: &Revision,
    ) -> std::result::Result<(), StageFailure> {
        let rev = revision.id.as_str();
        let fail = |e: &dyn Display| stage_failure(rev, RunStage::Upload, e);

        let pinned = self.config.upload_date_tag.as_deref();
        let Some(result_dir) = ws.select_result_dir(pinned) else {
            return Err(match pinned {
                Some(tag) => fail(&format!("no finished result directory tagged {tag}")),
                None => fail(&"no finished result directory to upload"),
            });
        };

        let build: BuildContext =
            read_json(&result_dir.join(BUILD_CONTEXT_FILE)).map_err(|e| fail(&e))?;
        let run: RunContext = read_json(&result_dir.join(RUN_CONTEXT_FILE)).map_err(|e| fail(&e))?;
        let results = aggregate_dir(&result_dir, &build, &run).map_err(|e| fail(&e))?;
        if results.is_empty() {
            return Err(fail(&format!(
                "no parseable benchmark records in {}",
                result_dir.display()
            )));
        }

        let records: Vec<DashboardRecord> = results
            .iter()
            .map(|result| {
                let record = DashboardRecord::from_result(result);
                match revision.timestamp {
                    Some(date) => record.with_revision_date(date),
                    None => record,
                }
            })
            .collect();

        let outcome = self.publisher.publish(&records).await;
        emit_upload_outcome(rev, records.len(), outcome.kind());

        match outcome {
            UploadOutcome::Accepted { body } => {
                let receipt = UploadReceipt {
                    uploaded_at: self.run_timestamp.clone(),
                    records: records.len(),
                    response: body,
                };
                write_json(&result_dir.join(UPLOAD_RECEIPT_FILE), &receipt).map_err(|e| fail(&e))
            }
            UploadOutcome::DryRun { .. } => Ok(()),
            UploadOutcome::Rejected { status, body } => Err(fail(&format!(
                "dashboard rejected upload with status {status}: {body}"
            ))),
            UploadOutcome::Unreachable { error } => {
                Err(fail(&format!("dashboard unreachable: {error}")))
            }
            UploadOutcome::Empty => Err(fail(&"nothing was uploaded")),
        }
    }
}
