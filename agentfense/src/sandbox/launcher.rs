//! The pluggable runtime capability (spec §9 "Pluggable runtime"): the
//! lifecycle manager and session registry never spawn processes directly,
//! they go through a `RuntimeLauncher`. Mirrors the seam the teacher draws
//! between `jailer` (namespace sandboxing) and `vmm` (the VM backend) —
//! different launch mechanisms behind one contract.

use crate::config::ResourceLimits;
use crate::errors::{AgentFenseError, AgentFenseResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// Everything needed to launch one command against a mounted overlay.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// The overlay mount the command's working directory is rooted at.
    pub mount: PathBuf,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Passed opaquely to the launcher; a native process launcher ignores
    /// it, a namespace/container launcher would apply it as cgroup limits.
    pub limits: ResourceLimits,
}

/// A live handle to a launched process: stdio pipes plus `wait`/`kill`.
pub struct LaunchedProcess {
    child: Child,
}

impl LaunchedProcess {
    fn new(child: Child) -> Self {
        Self { child }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    pub async fn wait(&mut self) -> AgentFenseResult<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    pub async fn kill(&mut self) -> AgentFenseResult<()> {
        Ok(self.child.kill().await?)
    }

    /// Send a unix signal to the process group leader. Used by the lifecycle
    /// manager's graceful-stop path (signal, grace period, then kill).
    #[cfg(unix)]
    pub fn signal(&self, sig: nix::sys::signal::Signal) -> AgentFenseResult<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig)
            .map_err(|err| AgentFenseError::Io(err.to_string()))
    }
}

/// Launches a command against an overlay mount and hands back a live
/// handle. Two implementations ship; both honor the same contract (spec §9).
#[async_trait]
pub trait RuntimeLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> AgentFenseResult<LaunchedProcess>;
}

/// Runs the command as a native child process rooted at the overlay mount.
///
/// This is the "third, in-memory launcher that just runs commands against
/// the mount directly" spec §9 says the test suite uses, and doubles as the
/// default launcher for embedding contexts that haven't wired up a
/// namespace or container backend.
pub struct LocalProcessLauncher;

#[async_trait]
impl RuntimeLauncher for LocalProcessLauncher {
    async fn launch(&self, spec: LaunchSpec) -> AgentFenseResult<LaunchedProcess> {
        std::fs::create_dir_all(&spec.mount)?;
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.mount)
            .env_clear()
            .envs(spec.env.iter().cloned())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|err| AgentFenseError::Io(err.to_string()))?;
        tracing::debug!(program = %spec.program, pid = ?child.id(), "spawned local process");
        Ok(LaunchedProcess::new(child))
    }
}

/// Seam for a Linux namespace/jailer-style launcher (bubblewrap, landlock,
/// or a container engine), mirroring the teacher's `jailer`/`vmm` module
/// boundary without re-implementing that VM stack — out of scope per spec
/// §1 ("the choice of underlying isolation mechanism... pluggable
/// capability"). Not wired to a real sandboxing backend in this build.
#[cfg(target_os = "linux")]
pub struct NamespaceLauncher;

#[cfg(target_os = "linux")]
#[async_trait]
impl RuntimeLauncher for NamespaceLauncher {
    async fn launch(&self, _spec: LaunchSpec) -> AgentFenseResult<LaunchedProcess> {
        Err(AgentFenseError::Internal(
            "namespace launcher has no jailer backend wired into this build".to_string(),
        ))
    }
}

/// The overlay mount directory a launched process should see as its root,
/// given a sandbox's scratch directory.
pub fn mount_dir_for(scratch_dir: &Path) -> PathBuf {
    scratch_dir.join("mount")
}
