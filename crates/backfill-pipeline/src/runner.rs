//! Process-backed collaborators.
//!
//! Every command's stdout and stderr are appended to the stage log, preceded
//! by a `$ command` line, so a failed stage can be diagnosed offline.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use backfill_core::{CollaboratorConfig, RunStage, StageFailure};
use tokio::process::Command;
use tracing::debug;

use crate::collaborator::{BenchmarkHarness, BenchmarkRequest, BuildCollaborator, BuildRequest};

/// Result of one logged command.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub command: String,

    /// Exit code (-1 when killed by a signal).
    pub exit_code: i32,

    pub duration_ms: u64,

    pub success: bool,
}

impl StepResult {
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }
}

/// Run `argv` with output appended to `log_path`.
pub async fn run_logged(argv: &[String], cwd: Option<&Path>, log_path: &Path) -> io::Result<StepResult> {
    let start = Instant::now();
    let Some((exe, args)) = argv.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
    };
    let command = argv.join(" ");

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut log = OpenOptions::new().create(true).append(true).open(log_path)?;
    writeln!(log, "$ {command}")?;
    let stderr = log.try_clone()?;

    let mut cmd = Command::new(exe);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr));
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    debug!(command = %command, "running");
    let status = cmd.status().await?;

    Ok(StepResult {
        command,
        exit_code: status.code().unwrap_or(-1),
        duration_ms: start.elapsed().as_millis() as u64,
        success: status.success(),
    })
}

/// Run a command for `stage`, turning any problem into a [`StageFailure`].
async fn run_step(
    revision: &str,
    stage: RunStage,
    argv: Vec<String>,
    cwd: Option<&Path>,
    log_path: &Path,
) -> Result<StepResult, StageFailure> {
    let command = argv.join(" ");
    let result = run_logged(&argv, cwd, log_path).await.map_err(|e| {
        StageFailure::new(revision, stage, format!("cannot run `{command}`: {e}")).with_log(log_path)
    })?;
    if !result.passed() {
        return Err(StageFailure::new(revision, stage, format!("`{command}` failed"))
            .with_exit_code(result.exit_code)
            .with_log(log_path));
    }
    Ok(result)
}

fn strings<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Builds a revision from a fresh clone with `configure` and `make`.
pub struct ConfigureMakeBuilder {
    source_repo: PathBuf,
    jobs: usize,
}

impl ConfigureMakeBuilder {
    pub fn new(source_repo: impl Into<PathBuf>, jobs: usize) -> Self {
        Self {
            source_repo: source_repo.into(),
            jobs: jobs.max(1),
        }
    }

    /// Command lines in execution order, with the directory each runs in.
    pub fn steps(&self, request: &BuildRequest) -> Vec<(Vec<String>, Option<PathBuf>)> {
        let src = request.source_dir.clone();
        let jobs = self.jobs.to_string();

        let mut configure = vec![
            "./configure".to_string(),
            "--prefix".to_string(),
            request.build_dir.to_string_lossy().to_string(),
        ];
        configure.extend(request.executable.configure_argv());

        vec![
            (
                vec![
                    "git".to_string(),
                    "clone".to_string(),
                    "--quiet".to_string(),
                    self.source_repo.to_string_lossy().to_string(),
                    src.to_string_lossy().to_string(),
                ],
                None,
            ),
            (
                strings(["git", "checkout", "--quiet", request.revision.as_str()]),
                Some(src.clone()),
            ),
            (configure, Some(src.clone())),
            (strings(["make", "-j", jobs.as_str(), "world"]), Some(src.clone())),
            (strings(["make", "-j", jobs.as_str(), "world.opt"]), Some(src.clone())),
            (strings(["make", "install"]), Some(src)),
        ]
    }
}

#[async_trait]
impl BuildCollaborator for ConfigureMakeBuilder {
    async fn build(&self, request: &BuildRequest) -> Result<(), StageFailure> {
        let rev = request.revision.as_str();
        let io_failure = |e: io::Error| {
            StageFailure::new(rev, RunStage::Build, format!("cannot prepare source tree: {e}"))
                .with_log(&request.log_path)
        };

        if request.source_dir.exists() {
            fs::remove_dir_all(&request.source_dir).map_err(io_failure)?;
        }
        if let Some(parent) = request.source_dir.parent() {
            fs::create_dir_all(parent).map_err(io_failure)?;
        }

        for (argv, cwd) in self.steps(request) {
            run_step(rev, RunStage::Build, argv, cwd.as_deref(), &request.log_path).await?;
        }
        Ok(())
    }
}

/// Runs a benchmark harness program once per benchmark.
///
/// Invocation: `[pre_exec...] <program> [args...] --bin-dir <bin> --output <file> <benchmark>`.
pub struct CommandHarness {
    program: PathBuf,
    args: Vec<String>,
    pre_exec: Vec<String>,
}

impl CommandHarness {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            pre_exec: Vec::new(),
        }
    }

    pub fn from_config(config: &CollaboratorConfig) -> Self {
        Self {
            program: config.harness_program.clone(),
            args: config.harness_args.clone(),
            pre_exec: config.pre_exec.clone(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_pre_exec(mut self, pre_exec: Vec<String>) -> Self {
        self.pre_exec = pre_exec;
        self
    }

    pub fn argv(&self, request: &BenchmarkRequest) -> Vec<String> {
        let mut argv = self.pre_exec.clone();
        argv.push(self.program.to_string_lossy().to_string());
        argv.extend(self.args.iter().cloned());
        argv.push("--bin-dir".to_string());
        argv.push(request.bin_dir.to_string_lossy().to_string());
        argv.push("--output".to_string());
        argv.push(request.output.to_string_lossy().to_string());
        argv.push(request.benchmark.clone());
        argv
    }
}

#[async_trait]
impl BenchmarkHarness for CommandHarness {
    async fn run_benchmark(&self, request: &BenchmarkRequest) -> Result<(), StageFailure> {
        let argv = self.argv(request);
        run_step(
            &request.revision,
            RunStage::Benchmark,
            argv,
            None,
            &request.log_path,
        )
        .await?;

        if !request.output.is_file() {
            return Err(StageFailure::new(
                &request.revision,
                RunStage::Benchmark,
                format!(
                    "{} produced no output at {}",
                    request.benchmark,
                    request.output.display()
                ),
            )
            .with_log(&request.log_path));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backfill_core::ExecutableSpec;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_step_result_passed() {
        let result = StepResult {
            command: "make world".to_string(),
            exit_code: 0,
            duration_ms: 100,
            success: true,
        };
        assert!(result.passed());

        let failed = StepResult {
            exit_code: 2,
            success: false,
            ..result
        };
        assert!(!failed.passed());
    }

    #[tokio::test]
    async fn test_output_goes_to_log() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("logs").join("build.log");

        let result = run_logged(&sh("echo hello; echo oops >&2"), None, &log)
            .await
            .unwrap();
        assert!(result.passed());

        let text = fs::read_to_string(&log).unwrap();
        assert!(text.starts_with("$ sh -c"));
        assert!(text.contains("hello"));
        assert!(text.contains("oops"));
    }

    #[tokio::test]
    async fn test_failing_command_exit_code() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("x.log");
        let result = run_logged(&sh("exit 3"), None, &log).await.unwrap();
        assert!(!result.passed());
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = run_logged(&[], None, &tmp.path().join("x.log"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    fn build_request(tmp: &Path) -> BuildRequest {
        BuildRequest {
            revision: "deadbeef".to_string(),
            branch: "trunk".to_string(),
            build_dir: tmp.join("ocaml_build"),
            source_dir: tmp.join("ocaml_build").join("src"),
            executable: "flambda:-flambda -no-naked-pointers".parse::<ExecutableSpec>().unwrap(),
            log_path: tmp.join("build.log"),
        }
    }

    #[test]
    fn test_build_steps() {
        let tmp = TempDir::new().unwrap();
        let request = build_request(tmp.path());
        let builder = ConfigureMakeBuilder::new("/repos/ocaml", 4);
        let steps = builder.steps(&request);
        let commands: Vec<String> = steps.iter().map(|(argv, _)| argv.join(" ")).collect();

        assert_eq!(steps.len(), 6);
        assert!(commands[0].starts_with("git clone --quiet /repos/ocaml "));
        assert_eq!(commands[1], "git checkout --quiet deadbeef");
        assert!(commands[2].ends_with("-flambda -no-naked-pointers"));
        assert!(commands[2].starts_with("./configure --prefix "));
        assert_eq!(commands[3], "make -j 4 world");
        assert_eq!(commands[4], "make -j 4 world.opt");
        assert_eq!(commands[5], "make install");
        assert!(steps[1..].iter().all(|(_, cwd)| cwd.as_deref() == Some(request.source_dir.as_path())));
    }

    #[tokio::test]
    async fn test_build_failure_reports_log() {
        let tmp = TempDir::new().unwrap();
        let request = build_request(tmp.path());
        let builder = ConfigureMakeBuilder::new(tmp.path().join("no-such-repo"), 1);

        let failure = builder.build(&request).await.unwrap_err();
        assert_eq!(failure.stage, RunStage::Build);
        assert_eq!(failure.revision, "deadbeef");
        assert_eq!(failure.log_path.as_deref(), Some(request.log_path.as_path()));
        assert!(failure.exit_code.is_some_and(|code| code != 0));
        assert!(request.log_path.is_file());
    }

    fn bench_request(tmp: &Path, name: &str) -> BenchmarkRequest {
        BenchmarkRequest {
            revision: "deadbeef".to_string(),
            benchmark: name.to_string(),
            bin_dir: tmp.join("bin"),
            output: tmp.join(format!("{name}.bench")),
            log_path: tmp.join("benchmark.log"),
        }
    }

    #[test]
    fn test_harness_argv() {
        let harness = CommandHarness::new("operf-micro")
            .with_args(vec!["--iterations".to_string(), "3".to_string()])
            .with_pre_exec(vec!["taskset".to_string(), "-c".to_string(), "2".to_string()]);
        let request = bench_request(Path::new("/w"), "kb");
        assert_eq!(
            harness.argv(&request).join(" "),
            "taskset -c 2 operf-micro --iterations 3 --bin-dir /w/bin --output /w/kb.bench kb"
        );
    }

    #[tokio::test]
    async fn test_harness_writes_output() {
        let tmp = TempDir::new().unwrap();
        // $4 is the output path and $5 the benchmark name.
        let script = r#"printf '{"name":"%s","time_secs":1.5}\n' "$5" > "$4""#;
        let harness = CommandHarness::new("sh").with_args(vec![
            "-c".to_string(),
            script.to_string(),
            "harness".to_string(),
        ]);
        let request = bench_request(tmp.path(), "kb");

        harness.run_benchmark(&request).await.unwrap();
        let text = fs::read_to_string(&request.output).unwrap();
        assert_eq!(text.trim(), r#"{"name":"kb","time_secs":1.5}"#);
    }

    #[tokio::test]
    async fn test_harness_without_output_fails() {
        let tmp = TempDir::new().unwrap();
        let harness = CommandHarness::new("true");
        let request = bench_request(tmp.path(), "kb");

        let failure = harness.run_benchmark(&request).await.unwrap_err();
        assert_eq!(failure.stage, RunStage::Benchmark);
        assert!(failure.message.contains("no output"));
    }

    #[tokio::test]
    async fn test_harness_exit_code_reported() {
        let tmp = TempDir::new().unwrap();
        let harness = CommandHarness::new("false");
        let request = bench_request(tmp.path(), "kb");

        let failure = harness.run_benchmark(&request).await.unwrap_err();
        assert_eq!(failure.exit_code, Some(1));
    }
}
