use crate::planner::{split_arguments, LaunchPlan};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::time::Duration;
use tracing::debug;
use wait_timeout::ChildExt;

// niceness the benchmark child is moved to before measuring
const HIGH_PRIORITY_NICENESS: nix::libc::c_int = -10;

/// Outcome of a best-effort OS tuning call. Refusals are logged by the
/// caller, never escalated into an execution failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tuning {
    Applied,
    UnsupportedOnPlatform,
}

/// Scoped ownership of one benchmark child process.
///
/// The child is spawned into its own process group so the whole tree can be
/// reclaimed at once; dropping the guard force-kills anything still running,
/// so no exit path can leak a process.
pub struct ProcessGuard {
    child: Child,
}

impl ProcessGuard {
    /// Spawn the planned process. Stdout is always captured. Stdin is only
    /// piped when the acknowledgment handshake is on; otherwise the child
    /// runs unpaced on the inherited stream. Stderr is deliberately not
    /// captured: a child that floods it would deadlock against an unread
    /// pipe buffer, diagnostic text goes to the inherited stream instead.
    pub fn start(plan: &LaunchPlan, redirect_stdin: bool) -> std::io::Result<Self> {
        let mut command = Command::new(&plan.file_name);
        command
            .args(split_arguments(&plan.arguments))
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .stdin(if redirect_stdin {
                Stdio::piped()
            } else {
                Stdio::inherit()
            })
            .process_group(0);
        if let Some(directory) = &plan.working_dir {
            command.current_dir(directory);
        }
        command.envs(plan.env.iter().map(|(name, value)| (name, value)));

        Ok(Self {
            child: command.spawn()?,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Wait for a natural exit up to `ceiling`. `Ok(None)` means the ceiling
    /// expired and the child is still running.
    pub fn wait_until_exit_or_timeout(
        &mut self,
        ceiling: Duration,
    ) -> std::io::Result<Option<ExitStatus>> {
        self.child.wait_timeout(ceiling)
    }

    /// Force-kill the entire process group, then reap the direct child.
    pub fn kill_tree(&mut self) {
        let group = Pid::from_raw(self.child.id() as i32);
        match killpg(group, Signal::SIGKILL) {
            Ok(()) => debug!(pid = self.child.id(), "Killed the benchmark process group"),
            Err(errno) => {
                debug!(pid = self.child.id(), errno = ?errno, "Process group was already gone")
            }
        }
        let _ = self.child.wait();
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Move the child to a high scheduling priority. Unprivileged harnesses
    /// are routinely refused the negative niceness, hence best-effort.
    pub fn raise_priority(&mut self) -> Tuning {
        // setpriority(2); the `which` argument type differs between libcs
        let rc = unsafe {
            nix::libc::setpriority(
                nix::libc::PRIO_PROCESS as _,
                self.child.id() as _,
                HIGH_PRIORITY_NICENESS,
            )
        };
        if rc == 0 {
            Tuning::Applied
        } else {
            Tuning::UnsupportedOnPlatform
        }
    }

    /// Pin the child to the requested CPUs.
    pub fn set_affinity(&mut self, cpus: &[usize]) -> Tuning {
        let mut set = nix::sched::CpuSet::new();
        for &cpu in cpus {
            if set.set(cpu).is_err() {
                return Tuning::UnsupportedOnPlatform;
            }
        }

        match nix::sched::sched_setaffinity(Pid::from_raw(self.child.id() as i32), &set) {
            Ok(()) => Tuning::Applied,
            Err(_) => Tuning::UnsupportedOnPlatform,
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if self.is_running() {
            self.kill_tree();
        }
    }
}
