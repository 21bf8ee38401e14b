//! Integration tests for the stage pipeline with fake collaborators.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use backfill_core::fakes::RecordingPublisher;
use backfill_core::{
    BackfillConfig, BackfillError, DashboardConfig, DashboardUploader, FailurePolicy, Revision,
    RunStage, StageFailure, StageSet, UploadOutcome,
};
use backfill_pipeline::workspace::{BUILD_CONTEXT_FILE, RUN_CONTEXT_FILE, UPLOAD_RECEIPT_FILE};
use backfill_pipeline::{
    BackfillPipeline, BenchmarkHarness, BenchmarkRequest, BuildCollaborator, BuildRequest,
    RevisionState, StageStatus, UploadReceipt,
};
use chrono::DateTime;
use tempfile::TempDir;

/// Builder that installs a fake `bin/ocaml`, or fails for chosen revisions.
#[derive(Default)]
struct FakeBuilder {
    failing: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl FakeBuilder {
    fn failing_for(revision: &str) -> Self {
        Self {
            failing: HashSet::from([revision.to_string()]),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildCollaborator for FakeBuilder {
    async fn build(&self, request: &BuildRequest) -> Result<(), StageFailure> {
        self.calls.lock().unwrap().push(request.revision.clone());
        fs::write(&request.log_path, "make world\n").unwrap();
        if self.failing.contains(&request.revision) {
            return Err(
                StageFailure::new(&request.revision, RunStage::Build, "`make world` failed")
                    .with_exit_code(2)
                    .with_log(&request.log_path),
            );
        }
        let bin = request.build_dir.join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("ocaml"), "#!/bin/sh\n").unwrap();
        Ok(())
    }
}

/// Harness writing two iterations (1.0s and 3.0s) per benchmark.
#[derive(Default)]
struct FakeHarness {
    failing: HashSet<String>,
    writes_before_failing: bool,
    runs: Mutex<Vec<(String, String)>>,
}

impl FakeHarness {
    fn failing_on(benchmarks: &[&str]) -> Self {
        Self {
            failing: benchmarks.iter().map(|b| b.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Failing benchmarks leave a well-formed line behind before crashing.
    fn crashing_after_output(benchmarks: &[&str]) -> Self {
        Self {
            writes_before_failing: true,
            ..Self::failing_on(benchmarks)
        }
    }

    fn runs(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

#[async_trait]
impl BenchmarkHarness for FakeHarness {
    async fn run_benchmark(&self, request: &BenchmarkRequest) -> Result<(), StageFailure> {
        self.runs
            .lock()
            .unwrap()
            .push((request.revision.clone(), request.benchmark.clone()));
        if self.failing.contains(&request.benchmark) {
            if self.writes_before_failing {
                fs::write(
                    &request.output,
                    format!("{{\"name\":\"{}\",\"time_secs\":1.0}}\n", request.benchmark),
                )
                .unwrap();
            }
            return Err(StageFailure::new(
                &request.revision,
                RunStage::Benchmark,
                format!("{} crashed", request.benchmark),
            ));
        }
        assert!(request.bin_dir.join("ocaml").is_file());
        let name = &request.benchmark;
        fs::write(
            &request.output,
            format!(
                "{{\"name\":\"{name}\",\"time_secs\":1.0,\"user_time_secs\":0.9,\"gc\":{{\"minor_collections\":4}}}}\n\
                 {{\"name\":\"{name}\",\"time_secs\":3.0,\"user_time_secs\":2.9,\"gc\":{{\"minor_collections\":4}}}}\n"
            ),
        )
        .unwrap();
        Ok(())
    }
}

struct Fixture {
    tmp: TempDir,
    config: BackfillConfig,
    builder: Arc<FakeBuilder>,
    harness: Arc<FakeHarness>,
    publisher: Arc<RecordingPublisher>,
}

impl Fixture {
    fn new() -> Self {
        Self::with(FakeBuilder::default(), FakeHarness::default())
    }

    fn with(builder: FakeBuilder, harness: FakeHarness) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = BackfillConfig::new(tmp.path().join("out"));
        config.repo.branch = "trunk".to_string();
        config.benchmarks = vec!["almabench".to_string(), "kb".to_string()];
        Self {
            tmp,
            config,
            builder: Arc::new(builder),
            harness: Arc::new(harness),
            publisher: Arc::new(RecordingPublisher::accepting()),
        }
    }

    fn root(&self) -> &Path {
        self.tmp.path()
    }

    fn pipeline(&self, timestamp: &str) -> BackfillPipeline {
        BackfillPipeline::new(
            self.config.clone(),
            self.builder.clone(),
            self.harness.clone(),
            self.publisher.clone(),
        )
        .with_run_timestamp(timestamp)
    }
}

fn rev(id: &str) -> Revision {
    Revision::new(id, "trunk")
}

const T1: &str = "20190101_100000";
const T2: &str = "20190101_110000";
const T3: &str = "20190101_120000";

#[tokio::test]
async fn test_full_run_uploads_aggregates() {
    let fx = Fixture::new();
    let result = fx
        .pipeline(T1)
        .run(&[rev("0123456789abcdef")])
        .await
        .expect("run failed");

    assert!(result.success());
    assert_eq!(result.succeeded_count(), 1);
    assert_eq!(result.run_timestamp, T1);
    assert!(!result.run_id.is_empty());

    let outcome = &result.revisions[0];
    assert_eq!(outcome.state, RevisionState::Done);
    let statuses: Vec<&StageStatus> = outcome.stages.iter().map(|s| &s.status).collect();
    assert_eq!(
        statuses,
        vec![
            &StageStatus::Completed,
            &StageStatus::Completed,
            &StageStatus::NotRequested,
            &StageStatus::Completed,
        ]
    );

    let result_dir = fx.config.outdir.join("0123456789abcdef/results").join(T1);
    assert!(result_dir.join("almabench.bench").is_file());
    assert!(result_dir.join(BUILD_CONTEXT_FILE).is_file());
    assert!(result_dir.join(RUN_CONTEXT_FILE).is_file());
    let receipt: UploadReceipt =
        serde_json::from_str(&fs::read_to_string(result_dir.join(UPLOAD_RECEIPT_FILE)).unwrap())
            .unwrap();
    assert_eq!(receipt.records, 2);

    let batches = fx.publisher.batches();
    assert_eq!(batches.len(), 1);
    let kb = batches[0].iter().find(|r| r.benchmark == "kb").unwrap();
    assert_eq!(kb.mean, 2.0);
    assert_eq!(kb.min, 1.0);
    assert_eq!(kb.max, 3.0);
    assert_eq!(kb.commit_id_short, "0123456");
    assert_eq!(kb.commit_id, "0123456789abcdef");
    assert_eq!(kb.project, "ocaml_trunk");
    assert_eq!(kb.environment, "macbook");
    assert_eq!(kb.executable, "vanilla");
}

#[tokio::test]
async fn test_build_runs_once_across_runs() {
    let mut fx = Fixture::new();
    fx.config.stages = StageSet::new([RunStage::Build]);

    let first = fx.pipeline(T1).run(&[rev("aaa")]).await.unwrap();
    let second = fx.pipeline(T2).run(&[rev("aaa")]).await.unwrap();

    assert_eq!(fx.builder.calls(), vec!["aaa"]);
    assert!(first.revisions[0]
        .report(RunStage::Build)
        .unwrap()
        .is_completed());
    assert!(second.revisions[0]
        .report(RunStage::Build)
        .unwrap()
        .is_skipped());
    assert_eq!(second.revisions[0].state, RevisionState::Done);
}

#[tokio::test]
async fn test_force_rebuild_builds_again() {
    let mut fx = Fixture::new();
    fx.config.stages = StageSet::new([RunStage::Build]);
    fx.pipeline(T1).run(&[rev("aaa")]).await.unwrap();

    fx.config.force_rebuild = true;
    fx.pipeline(T2).run(&[rev("aaa")]).await.unwrap();
    assert_eq!(fx.builder.calls(), vec!["aaa", "aaa"]);
}

#[tokio::test]
async fn test_unfinished_build_dir_is_rebuilt() {
    let mut fx = Fixture::new();
    fx.config.stages = StageSet::new([RunStage::Build]);
    let build_dir = fx.config.outdir.join("aaa").join("ocaml_build");
    fs::create_dir_all(build_dir.join("bin")).unwrap();
    fs::write(build_dir.join("leftover.o"), "junk").unwrap();

    let pipeline = fx.pipeline(T1);
    assert!(!pipeline.is_stage_complete("aaa", RunStage::Build));
    let result = pipeline.run(&[rev("aaa")]).await.unwrap();

    assert!(result.success());
    assert_eq!(fx.builder.calls(), vec!["aaa"]);
    assert!(!build_dir.join("leftover.o").exists());
    assert!(build_dir.join(BUILD_CONTEXT_FILE).is_file());
    assert!(pipeline.is_stage_complete("aaa", RunStage::Build));
}

#[tokio::test]
async fn test_failed_build_does_not_stop_next_revision() {
    let fx = Fixture::with(FakeBuilder::failing_for("bad"), FakeHarness::default());
    let result = fx
        .pipeline(T1)
        .run(&[rev("bad"), rev("good")])
        .await
        .unwrap();

    assert_eq!(result.failed_count(), 1);
    assert_eq!(result.succeeded_count(), 1);
    assert_eq!(fx.builder.calls(), vec!["bad", "good"]);

    let bad = result.outcome("bad").unwrap();
    assert_eq!(bad.state, RevisionState::Failed(RunStage::Build));
    let failure = bad.failures()[0];
    assert_eq!(failure.exit_code, Some(2));
    assert!(failure
        .log_path
        .as_ref()
        .unwrap()
        .ends_with(format!("build_{T1}.log")));
    assert!(bad.report(RunStage::Benchmark).unwrap().is_skipped());
    assert!(bad.report(RunStage::Upload).unwrap().is_skipped());

    assert_eq!(result.outcome("good").unwrap().state, RevisionState::Done);
    assert_eq!(fx.harness.runs(), 2);
    assert_eq!(fx.publisher.batches().len(), 1);
}

#[tokio::test]
async fn test_continue_stages_attempts_later_stages() {
    let mut fx = Fixture::with(FakeBuilder::failing_for("bad"), FakeHarness::default());
    fx.config.on_stage_failure = FailurePolicy::ContinueStages;

    let result = fx.pipeline(T1).run(&[rev("bad")]).await.unwrap();
    let bad = &result.revisions[0];

    assert_eq!(bad.state, RevisionState::Failed(RunStage::Build));
    assert!(bad.report(RunStage::Benchmark).unwrap().is_failed());
    assert!(bad.report(RunStage::Upload).unwrap().is_failed());
    assert_eq!(bad.failures().len(), 3);
    assert_eq!(fx.harness.runs(), 0);
}

#[tokio::test]
async fn test_benchmarks_skipped_unless_rerun() {
    let mut fx = Fixture::new();
    fx.pipeline(T1).run(&[rev("aaa")]).await.unwrap();
    assert_eq!(fx.harness.runs(), 2);

    let second = fx.pipeline(T2).run(&[rev("aaa")]).await.unwrap();
    assert_eq!(fx.harness.runs(), 2);
    let reports = &second.revisions[0];
    assert!(reports.report(RunStage::Benchmark).unwrap().is_skipped());
    assert!(reports.report(RunStage::Upload).unwrap().is_skipped());

    fx.config.rerun_benchmarks = true;
    let third = fx.pipeline(T3).run(&[rev("aaa")]).await.unwrap();
    assert_eq!(fx.harness.runs(), 4);
    assert!(third.revisions[0]
        .report(RunStage::Upload)
        .unwrap()
        .is_completed());

    let ws = fx.pipeline(T3).workspace("aaa");
    let dirs: Vec<String> = ws
        .completed_result_dirs()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(dirs, vec![T1.to_string(), T3.to_string()]);
    assert_eq!(fx.publisher.batches().len(), 2);
}

#[tokio::test]
async fn test_partial_benchmark_failure_keeps_the_rest() {
    let mut fx = Fixture::with(FakeBuilder::default(), FakeHarness::failing_on(&["broken"]));
    fx.config.benchmarks = vec!["almabench".to_string(), "broken".to_string(), "kb".to_string()];

    let result = fx.pipeline(T1).run(&[rev("aaa")]).await.unwrap();

    assert!(result.success());
    assert_eq!(fx.harness.runs(), 3);
    let result_dir = fx.config.outdir.join("aaa/results").join(T1);
    assert!(result_dir.join("almabench.bench").is_file());
    assert!(!result_dir.join("broken.bench").exists());
    assert!(result_dir.join("kb.bench").is_file());

    let batch = &fx.publisher.batches()[0];
    let names: Vec<&str> = batch.iter().map(|r| r.benchmark.as_str()).collect();
    assert_eq!(names, vec!["almabench", "kb"]);
}

#[tokio::test]
async fn test_output_of_failed_benchmark_is_not_uploaded() {
    let mut fx = Fixture::with(
        FakeBuilder::default(),
        FakeHarness::crashing_after_output(&["bad"]),
    );
    fx.config.benchmarks = vec!["bad".to_string(), "good".to_string()];

    let result = fx.pipeline(T1).run(&[rev("aaa")]).await.unwrap();

    assert!(result.success());
    let result_dir = fx.config.outdir.join("aaa/results").join(T1);
    assert!(!result_dir.join("bad.bench").exists());
    assert!(result_dir.join("good.bench").is_file());

    let batch = &fx.publisher.batches()[0];
    let names: Vec<&str> = batch.iter().map(|r| r.benchmark.as_str()).collect();
    assert_eq!(names, vec!["good"]);
}

#[tokio::test]
async fn test_all_benchmarks_failing_fails_stage() {
    let fx = Fixture::with(
        FakeBuilder::default(),
        FakeHarness::failing_on(&["almabench", "kb"]),
    );
    let result = fx.pipeline(T1).run(&[rev("aaa")]).await.unwrap();

    let outcome = &result.revisions[0];
    assert_eq!(outcome.state, RevisionState::Failed(RunStage::Benchmark));
    assert!(outcome.failures()[0].message.contains("all 2 benchmarks failed"));
    assert!(!fx.pipeline(T1).is_stage_complete("aaa", RunStage::Benchmark));
    assert!(fx.publisher.batches().is_empty());
}

#[tokio::test]
async fn test_upload_without_results_is_stage_failure() {
    let mut fx = Fixture::new();
    fx.config.stages = StageSet::new([RunStage::Upload]);

    let result = fx.pipeline(T1).run(&[rev("aaa"), rev("bbb")]).await.unwrap();

    assert_eq!(result.failed_count(), 2);
    for outcome in &result.revisions {
        assert_eq!(outcome.state, RevisionState::Failed(RunStage::Upload));
        assert!(outcome.failures()[0].message.contains("no finished result directory"));
    }
    assert!(fx.publisher.batches().is_empty());
}

#[tokio::test]
async fn test_upload_pinned_result_dir() {
    let mut fx = Fixture::new();
    fx.config.stages = StageSet::new([RunStage::Build, RunStage::Benchmark]);
    fx.config.rerun_benchmarks = true;
    fx.pipeline(T1).run(&[rev("aaa")]).await.unwrap();
    fx.pipeline(T2).run(&[rev("aaa")]).await.unwrap();

    fx.config.stages = StageSet::new([RunStage::Upload]);
    fx.config.upload_date_tag = Some(T1.to_string());
    let result = fx.pipeline(T3).run(&[rev("aaa")]).await.unwrap();
    assert!(result.success());

    let results = fx.config.outdir.join("aaa/results");
    assert!(results.join(T1).join(UPLOAD_RECEIPT_FILE).is_file());
    assert!(!results.join(T2).join(UPLOAD_RECEIPT_FILE).exists());

    fx.config.upload_date_tag = Some("19990101_000000".to_string());
    let missing = fx.pipeline(T3).run(&[rev("aaa")]).await.unwrap();
    assert!(missing.revisions[0].failures()[0]
        .message
        .contains("19990101_000000"));
}

#[tokio::test]
async fn test_rejected_upload_is_reported_and_retried() {
    let mut fx = Fixture::new();
    fx.publisher = Arc::new(RecordingPublisher::answering(UploadOutcome::Rejected {
        status: 500,
        body: "database locked".to_string(),
    }));

    let result = fx.pipeline(T1).run(&[rev("aaa")]).await.unwrap();
    let outcome = &result.revisions[0];
    assert_eq!(outcome.state, RevisionState::Failed(RunStage::Upload));
    assert!(outcome.failures()[0].message.contains("database locked"));
    assert!(!fx.pipeline(T1).is_stage_complete("aaa", RunStage::Upload));

    fx.publisher = Arc::new(RecordingPublisher::accepting());
    let retry = fx.pipeline(T2).run(&[rev("aaa")]).await.unwrap();
    assert!(retry.success());
    assert!(retry.revisions[0]
        .report(RunStage::Upload)
        .unwrap()
        .is_completed());
}

#[tokio::test]
async fn test_reupload_ignores_receipt() {
    let mut fx = Fixture::new();
    fx.pipeline(T1).run(&[rev("aaa")]).await.unwrap();
    fx.config.reupload = true;
    fx.pipeline(T2).run(&[rev("aaa")]).await.unwrap();
    assert_eq!(fx.publisher.batches().len(), 2);
}

#[tokio::test]
async fn test_dry_run_upload_leaves_no_receipt() {
    let fx = Fixture::new();
    let uploader = Arc::new(DashboardUploader::new(DashboardConfig {
        url: "http://127.0.0.1:1/".to_string(),
        dry_run: true,
    }));
    let pipeline = BackfillPipeline::new(
        fx.config.clone(),
        fx.builder.clone(),
        fx.harness.clone(),
        uploader,
    )
    .with_run_timestamp(T1);

    let result = pipeline.run(&[rev("aaa")]).await.unwrap();
    assert!(result.success());
    assert!(!pipeline.is_stage_complete("aaa", RunStage::Upload));
    assert!(!fx
        .config
        .outdir
        .join("aaa/results")
        .join(T1)
        .join(UPLOAD_RECEIPT_FILE)
        .exists());
}

#[tokio::test]
async fn test_archive_skips_missing_roots() {
    let mut fx = Fixture::new();
    let present = fx.root().join("archive");
    fs::create_dir_all(&present).unwrap();
    let absent = fx.root().join("unmounted");
    fx.config.archive_roots = vec![absent.clone(), present.clone()];
    fx.config.stages = StageSet::all();
    fx.config.environment = "bench-box".to_string();

    let result = fx.pipeline(T1).run(&[rev("aaa")]).await.unwrap();
    assert!(result.success());
    assert!(result.revisions[0]
        .report(RunStage::Archive)
        .unwrap()
        .is_completed());

    let dest = present
        .join("bench-box")
        .join("ocaml_trunk__trunk")
        .join("aaa")
        .join("vanilla")
        .join(T1);
    assert!(dest.join("kb.bench").is_file());
    assert!(dest.join(BUILD_CONTEXT_FILE).is_file());
    assert!(dest.join("logs").join(format!("build_{T1}.log")).is_file());
    assert!(!absent.exists());

    let again = fx.pipeline(T2).run(&[rev("aaa")]).await.unwrap();
    assert!(again.revisions[0]
        .report(RunStage::Archive)
        .unwrap()
        .is_skipped());
}

#[tokio::test]
async fn test_archive_copy_failure_is_isolated_per_root() {
    let mut fx = Fixture::new();
    let blocked = fx.root().join("blocked");
    fs::create_dir_all(&blocked).unwrap();
    fs::write(blocked.join("macbook"), "not a directory").unwrap();
    let good = fx.root().join("good");
    fs::create_dir_all(&good).unwrap();
    fx.config.archive_roots = vec![blocked, good.clone()];
    fx.config.stages = StageSet::all();

    let result = fx.pipeline(T1).run(&[rev("aaa")]).await.unwrap();
    let outcome = &result.revisions[0];

    assert_eq!(outcome.state, RevisionState::Failed(RunStage::Archive));
    assert!(outcome.failures()[0].message.contains("blocked"));
    let dest = good
        .join("macbook")
        .join("ocaml_trunk__trunk")
        .join("aaa")
        .join("vanilla")
        .join(T1);
    assert!(dest.join(BUILD_CONTEXT_FILE).is_file());
    assert!(!fx.pipeline(T2).is_stage_complete("aaa", RunStage::Archive));
}

#[tokio::test]
async fn test_archive_without_roots_is_skipped() {
    let mut fx = Fixture::new();
    fx.config.stages = StageSet::all();
    let result = fx.pipeline(T1).run(&[rev("aaa")]).await.unwrap();
    assert!(result.success());
    assert_eq!(
        result.revisions[0].report(RunStage::Archive).unwrap().status,
        StageStatus::Skipped("no archive roots configured".to_string())
    );
}

#[tokio::test]
async fn test_revision_date_reaches_dashboard() {
    let fx = Fixture::new();
    let mut revision = rev("aaa");
    revision.timestamp = Some(DateTime::parse_from_rfc3339("2018-07-10T08:09:10+00:00").unwrap());

    fx.pipeline(T1).run(&[revision]).await.unwrap();
    let batch = &fx.publisher.batches()[0];
    assert!(batch
        .iter()
        .all(|r| r.revision_date.as_deref() == Some("2018-07-10 08:09:10")));
}

#[tokio::test]
async fn test_invalid_config_aborts_before_any_revision() {
    let mut fx = Fixture::new();
    fx.config.benchmarks.clear();

    let err = fx.pipeline(T1).run(&[rev("aaa")]).await.unwrap_err();
    assert!(matches!(err, BackfillError::Configuration(_)));
    assert!(fx.builder.calls().is_empty());
}
