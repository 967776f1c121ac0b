pub mod guard;
pub mod output;

use crate::diagnostics::{Diagnostics, HookContext, HostSignal};
use crate::planner::{
    self, ArtifactLocation, BenchmarkId, ExecutionTargetVariant, LaunchPlan,
};
use guard::{ProcessGuard, Tuning};
use output::{OutputSynchronizer, ARCH_MISMATCH_HINT};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use tracing_unwrap::OptionExt;

/// Hard wall-clock ceiling for one benchmark launch. Process-wide on
/// purpose: every run is reclaimed the same way, no matter which target
/// variant produced it.
// TODO: fold into per-request configuration if the scheduler ever grows
// per-benchmark deadlines
pub const PROCESS_EXIT_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("OS refused to start the benchmark process")]
    Spawn(#[from] std::io::Error),
}

/// One launch of one benchmark under a resolved target variant.
pub struct ExecutionRequest<'a> {
    pub benchmark: BenchmarkId,
    pub variant: ExecutionTargetVariant,
    pub artifact: ArtifactLocation,
    /// Pre-rendered benchmark-identity argument tail from the configuration
    /// collaborator, appended verbatim to the launch plan.
    pub args_tail: String,
    pub acknowledgments: bool,
    pub affinity: Option<Vec<usize>>,
    pub env: Vec<(String, String)>,
    pub diagnostics: &'a dyn Diagnostics,
    pub launch_index: u32,
}

/// Outcome of one launch. A timed-out or signal-killed child is a *success*
/// with an absent exit code; only a missing artifact yields `success: false`.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub process_id: Option<u32>,
    pub results: Vec<String>,
    pub auxiliary: Vec<String>,
    pub diagnostic_hint: Option<String>,
    pub launch_index: u32,
}

impl ExecutionResult {
    fn failed(launch_index: u32) -> Self {
        Self {
            success: false,
            exit_code: None,
            process_id: None,
            results: Vec::new(),
            auxiliary: Vec::new(),
            diagnostic_hint: None,
            launch_index,
        }
    }
}

// fires AfterProcessExit exactly once on every path out of `execute`,
// including spawn errors and panics; the guard lives in a narrower scope, so
// the tree is already reclaimed when the hook runs
struct AfterExitHook<'a> {
    diagnostics: &'a dyn Diagnostics,
    benchmark: &'a BenchmarkId,
    process_id: Option<u32>,
}

impl Drop for AfterExitHook<'_> {
    fn drop(&mut self) {
        self.diagnostics.handle(
            HostSignal::AfterProcessExit,
            &HookContext {
                benchmark: self.benchmark,
                process_id: self.process_id,
            },
        );
    }
}

/// Drives one guarded benchmark process per request: plan, hook, spawn, tune,
/// drain concurrently, wait up to the fixed ceiling, kill on expiry, fold
/// everything into an [`ExecutionResult`].
pub struct Executor {
    exit_timeout: Duration,
}

impl Default for Executor {
    fn default() -> Self {
        Self {
            exit_timeout: PROCESS_EXIT_TIMEOUT,
        }
    }
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_exit_timeout(exit_timeout: Duration) -> Self {
        Self { exit_timeout }
    }

    /// Ordinary runtime failures of the benchmarked process never surface as
    /// errors here, they are folded into the result. Only an OS spawn refusal
    /// propagates.
    #[instrument(level = "info", skip_all, fields(benchmark = %request.benchmark, launch = request.launch_index))]
    pub fn execute(
        &self,
        request: &ExecutionRequest<'_>,
    ) -> Result<ExecutionResult, ExecutorError> {
        if !request.artifact.executable.is_file() {
            warn!(
                path = %request.artifact.executable.display(),
                "Benchmark artifact does not exist, nothing was started"
            );
            return Ok(ExecutionResult::failed(request.launch_index));
        }

        let plan = planner::plan(
            &request.variant,
            &request.artifact,
            &request.args_tail,
            &request.env,
        );
        let handshake = request.acknowledgments && request.variant.supports_acknowledgments();

        request.diagnostics.handle(
            HostSignal::BeforeProcessStart,
            &HookContext {
                benchmark: &request.benchmark,
                process_id: None,
            },
        );
        let mut after_exit = AfterExitHook {
            diagnostics: request.diagnostics,
            benchmark: &request.benchmark,
            process_id: None,
        };

        self.run(request, &plan, handshake, &mut after_exit)
    }

    fn run(
        &self,
        request: &ExecutionRequest<'_>,
        plan: &LaunchPlan,
        handshake: bool,
        after_exit: &mut AfterExitHook<'_>,
    ) -> Result<ExecutionResult, ExecutorError> {
        info!(
            "Execute: {} {} in {}",
            plan.file_name.display(),
            plan.arguments,
            plan.working_dir
                .as_deref()
                .map(|directory| directory.display().to_string())
                .unwrap_or_else(|| "the current directory".to_owned())
        );

        let mut guard = ProcessGuard::start(plan, handshake)?;
        let process_id = guard.id();
        after_exit.process_id = Some(process_id);

        match guard.raise_priority() {
            Tuning::Applied => debug!(pid = process_id, "Raised the benchmark process priority"),
            Tuning::UnsupportedOnPlatform => {
                warn!(pid = process_id, "Platform refused to raise the benchmark process priority")
            }
        }
        if let Some(cpus) = &request.affinity {
            match guard.set_affinity(cpus) {
                Tuning::Applied => debug!(pid = process_id, cpus = ?cpus, "Pinned the benchmark process"),
                Tuning::UnsupportedOnPlatform => {
                    warn!(pid = process_id, cpus = ?cpus, "Platform refused the affinity mask")
                }
            }
        }

        let stdout = guard.take_stdout().unwrap_or_log();
        let stdin = if handshake { guard.take_stdin() } else { None };
        let synchronizer = OutputSynchronizer::new(
            stdout,
            stdin,
            request.diagnostics,
            &request.benchmark,
            process_id,
        );

        let (status, transcript) = std::thread::scope(|scope| {
            let drainer = scope.spawn(move || synchronizer.drain());

            let status = match guard.wait_until_exit_or_timeout(self.exit_timeout) {
                Ok(status) => status,
                Err(wait_error) => {
                    warn!(error = ?wait_error, "Failed waiting for the benchmark process");
                    None
                }
            };
            if status.is_none() {
                info!("The benchmark process did not quit on time, force killing the whole process tree");
                guard.kill_tree();
            }

            let transcript = match drainer.join() {
                Ok(transcript) => transcript,
                Err(_) => {
                    error!("The output drain thread panicked, the capture is lost");
                    output::Transcript::default()
                }
            };
            (status, transcript)
        });

        Ok(ExecutionResult {
            success: true,
            exit_code: status.and_then(|status| status.code()),
            process_id: Some(process_id),
            results: transcript.results(),
            auxiliary: transcript.auxiliary(),
            diagnostic_hint: transcript.arch_mismatch.then(|| ARCH_MISMATCH_HINT.to_owned()),
            launch_index: request.launch_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::NullDiagnostics;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    struct Recording {
        signals: Mutex<Vec<(HostSignal, Option<u32>)>>,
    }

    impl Recording {
        fn new() -> Self {
            Self {
                signals: Mutex::new(Vec::new()),
            }
        }

        fn signals(&self) -> Vec<HostSignal> {
            self.signals
                .lock()
                .unwrap()
                .iter()
                .map(|(signal, _)| *signal)
                .collect()
        }
    }

    impl Diagnostics for Recording {
        fn handle(&self, signal: HostSignal, context: &HookContext<'_>) {
            self.signals
                .lock()
                .unwrap()
                .push((signal, context.process_id));
        }
    }

    fn script(directory: &Path, body: &str) -> PathBuf {
        let path = directory.join("fake-bench.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn request<'a>(
        artifact_path: PathBuf,
        diagnostics: &'a dyn Diagnostics,
    ) -> ExecutionRequest<'a> {
        let binaries_dir = artifact_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        ExecutionRequest {
            benchmark: BenchmarkId::new("suite/bench"),
            variant: ExecutionTargetVariant::DirectNative,
            artifact: ArtifactLocation {
                executable: artifact_path,
                binaries_dir,
                program_name: "fake-bench".to_owned(),
            },
            args_tail: String::new(),
            acknowledgments: true,
            affinity: None,
            env: Vec::new(),
            diagnostics,
            launch_index: 1,
        }
    }

    #[test]
    fn missing_artifact_short_circuits() {
        let directory = tempfile::tempdir().unwrap();
        let recording = Recording::new();
        let request = request(directory.path().join("not-built"), &recording);

        let result = Executor::new().execute(&request).unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.process_id, None);
        assert!(result.results.is_empty());
        assert!(result.auxiliary.is_empty());
        // no process, no hooks
        assert!(recording.signals().is_empty());
    }

    #[test]
    fn captured_output_is_partitioned_in_order() {
        let directory = tempfile::tempdir().unwrap();
        let path = script(
            directory.path(),
            "echo '// warmup'\necho '10.1 ns/op'\necho '20.2 ns/op'",
        );
        let request = request(path, &NullDiagnostics);

        let result = Executor::new().execute(&request).unwrap();

        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.process_id.is_some());
        assert_eq!(result.results, vec!["10.1 ns/op", "20.2 ns/op"]);
        assert_eq!(result.auxiliary, vec!["// warmup"]);
        assert_eq!(result.diagnostic_hint, None);
    }

    #[test]
    fn handshake_paces_the_engine() {
        let directory = tempfile::tempdir().unwrap();
        // the fake engine refuses to report unless each signal is acknowledged
        let path = script(
            directory.path(),
            concat!(
                "echo '// BeforeActualRun'\n",
                "read ack || exit 1\n",
                "test \"$ack\" = 'Acknowledged' || exit 1\n",
                "echo '10.1 ns/op'\n",
                "echo '// AfterAll'\n",
                "read ack || exit 1",
            ),
        );
        let recording = Recording::new();
        let request = request(path, &recording);

        let result = Executor::with_exit_timeout(Duration::from_secs(20))
            .execute(&request)
            .unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.results, vec!["10.1 ns/op"]);
        assert_eq!(
            recording.signals(),
            vec![
                HostSignal::BeforeProcessStart,
                HostSignal::BeforeActualRun,
                HostSignal::AfterAll,
                HostSignal::AfterProcessExit,
            ]
        );
    }

    #[test]
    fn timeout_downgrades_to_an_absent_exit_code() {
        let directory = tempfile::tempdir().unwrap();
        let path = script(directory.path(), "sleep 30 &\nsleep 30");
        let recording = Recording::new();
        let request = request(path, &recording);

        let result = Executor::with_exit_timeout(Duration::from_millis(200))
            .execute(&request)
            .unwrap();

        assert!(result.success);
        assert_eq!(result.exit_code, None);
        let pid = result.process_id.expect("child was spawned");
        // whole tree is gone, grandchild included
        for _ in 0..200 {
            if nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pid as i32), None).is_err() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pid as i32), None).is_err());
        // hooks still fired exactly once each, in order
        assert_eq!(
            recording.signals(),
            vec![HostSignal::BeforeProcessStart, HostSignal::AfterProcessExit]
        );
    }

    #[test]
    fn spawn_failure_still_fires_both_hooks() {
        let directory = tempfile::tempdir().unwrap();
        let path = script(directory.path(), "exit 0");
        let recording = Recording::new();
        let mut request = request(path, &recording);
        // artifact exists, but the planned VM engine does not
        request.variant = ExecutionTargetVariant::AlternateVm {
            engine: directory.path().join("no-such-vm"),
            jit: Default::default(),
            extra_args: Vec::new(),
        };

        let outcome = Executor::new().execute(&request);

        assert!(matches!(outcome, Err(ExecutorError::Spawn(_))));
        assert_eq!(
            recording.signals(),
            vec![HostSignal::BeforeProcessStart, HostSignal::AfterProcessExit]
        );
        // after-exit carried no pid because no process ever existed
        assert_eq!(recording.signals.lock().unwrap()[1].1, None);
    }

    #[test]
    fn arch_mismatch_yields_exactly_one_hint() {
        let directory = tempfile::tempdir().unwrap();
        let path = script(
            directory.path(),
            "echo 'app: cannot execute: Exec format error'\necho 'wrong ELF class: ELFCLASS32'",
        );
        let request = request(path, &NullDiagnostics);

        let result = Executor::new().execute(&request).unwrap();

        assert_eq!(result.diagnostic_hint.as_deref(), Some(ARCH_MISMATCH_HINT));
        assert_eq!(result.results.len(), 2);
    }

    #[test]
    fn environment_overlay_reaches_the_child() {
        let directory = tempfile::tempdir().unwrap();
        let path = script(directory.path(), "echo \"$STINT_PROBE\"");
        let mut request = request(path, &NullDiagnostics);
        request.env = vec![("STINT_PROBE".to_owned(), "overlay-value".to_owned())];

        let result = Executor::new().execute(&request).unwrap();

        assert_eq!(result.results, vec!["overlay-value"]);
    }

    #[test]
    fn signal_killed_children_report_no_exit_code() {
        let directory = tempfile::tempdir().unwrap();
        let path = script(directory.path(), "kill -9 $$");
        let request = request(path, &NullDiagnostics);

        let result = Executor::new().execute(&request).unwrap();

        assert!(result.success);
        assert_eq!(result.exit_code, None);
    }
}
