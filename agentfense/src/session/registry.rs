//! Per-sandbox shell sessions (spec §4.5): persistent working directory and
//! environment across multiple `exec` calls, idle-timeout garbage
//! collection, and both buffered and streaming execution.

use crate::errors::{AgentFenseError, AgentFenseResult};
use crate::ids::SessionId;
use crate::sandbox::launcher::{LaunchSpec, RuntimeLauncher};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One chunk of an in-progress execution, as consumed by `ExecStream` (spec
/// §6) and internally by the buffered `exec` path.
#[derive(Debug, Clone)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(ExitInfo),
}

#[derive(Debug, Clone)]
pub struct ExitInfo {
    pub exit_code: i32,
    pub duration: Duration,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// A request to run a command in a session.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub stdin: Option<Vec<u8>>,
    pub env_overrides: HashMap<String, String>,
    pub workdir_override: Option<String>,
    pub timeout: Duration,
    pub limits: crate::config::ResourceLimits,
}

/// The result of a completed (non-timed-out, non-cancelled) execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub duration: Duration,
}

/// How an `exec` call ended (spec §5: "on expiry... the caller receives a
/// timeout result with whatever stdout/stderr was buffered").
#[derive(Debug, Clone)]
pub enum ExecOutcome {
    Completed(ExecResult),
    TimedOut { stdout: Vec<u8>, stderr: Vec<u8> },
    Cancelled { stdout: Vec<u8>, stderr: Vec<u8> },
}

/// A persistent shell context bound to a running sandbox.
pub struct Session {
    id: SessionId,
    cwd: Mutex<String>,
    env: Mutex<HashMap<String, String>>,
    last_used: Mutex<DateTime<Utc>>,
}

impl Session {
    fn new() -> Self {
        Self {
            id: SessionId::new(),
            cwd: Mutex::new(".".to_string()),
            env: Mutex::new(HashMap::new()),
            last_used: Mutex::new(Utc::now()),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn cwd(&self) -> String {
        self.cwd.lock().clone()
    }

    pub fn set_env(&self, key: impl Into<String>, value: impl Into<String>) {
        self.env.lock().insert(key.into(), value.into());
    }

    fn touch(&self) {
        *self.last_used.lock() = Utc::now();
    }

    fn idle_for(&self) -> chrono::Duration {
        Utc::now() - *self.last_used.lock()
    }

    /// Run `request.command` to completion, buffering stdout/stderr.
    pub async fn exec(
        self: &Arc<Self>,
        launcher: &dyn RuntimeLauncher,
        mount: &Path,
        request: ExecRequest,
        cancellation: CancellationToken,
    ) -> AgentFenseResult<ExecOutcome> {
        self.touch();
        let mut rx = self.exec_stream(launcher, mount, request, cancellation).await?;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit: Option<ExitInfo> = None;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                OutputChunk::Stdout(bytes) => stdout.extend(bytes),
                OutputChunk::Stderr(bytes) => stderr.extend(bytes),
                OutputChunk::Exit(info) => exit = Some(info),
            }
        }
        let exit = exit.ok_or_else(|| AgentFenseError::Internal("exec stream ended without an exit event".into()))?;
        if exit.cancelled {
            return Ok(ExecOutcome::Cancelled { stdout, stderr });
        }
        if exit.timed_out {
            return Ok(ExecOutcome::TimedOut { stdout, stderr });
        }
        Ok(ExecOutcome::Completed(ExecResult {
            stdout,
            stderr,
            exit_code: exit.exit_code,
            duration: exit.duration,
        }))
    }

    /// Run `request.command`, streaming output chunks as they arrive.
    ///
    /// The command runs as `sh -c "cd <cwd> && { command; }"`; on success the
    /// wrapped script also emits the post-command working directory on
    /// stderr, framed by a per-call random marker, so that a `cd` inside the
    /// agent's command persists into the session's next `exec` the way a
    /// real interactive shell would. Because the marker can only be located
    /// once the full stream is in hand, stderr is buffered and emitted as a
    /// single chunk after the process exits; stdout streams live.
    pub async fn exec_stream(
        self: &Arc<Self>,
        launcher: &dyn RuntimeLauncher,
        mount: &Path,
        request: ExecRequest,
        cancellation: CancellationToken,
    ) -> AgentFenseResult<mpsc::UnboundedReceiver<OutputChunk>> {
        self.touch();
        tracing::trace!(session_id = %self.id, command = %request.command, "exec_stream starting");
        let cwd = request.workdir_override.clone().unwrap_or_else(|| self.cwd());
        let mut env: Vec<(String, String)> = self.env.lock().clone().into_iter().collect();
        env.extend(request.env_overrides.clone());

        let nonce = random_nonce();
        let begin = format!("__AGENTFENSE_CWD_BEGIN_{nonce}__");
        let end = format!("__AGENTFENSE_CWD_END_{nonce}__");
        let script = format!(
            "cd {cwd} 2>/dev/null || exit 97\n{{\n{command}\n}}\n__agentfense_status=$?\nprintf '\\n{begin}%s{end}' \"$(pwd)\" 1>&2\nexit $__agentfense_status\n",
            cwd = shell_quote(&cwd),
            command = request.command,
            begin = begin,
            end = end,
        );

        let spec = LaunchSpec {
            mount: mount.to_path_buf(),
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script],
            env,
            limits: request.limits,
        };

        let mut process = launcher.launch(spec).await?;
        let stdin_handle = process.stdin();
        let stdout_reader = process.stdout();
        let stderr_reader = process.stderr();

        let (tx, rx) = mpsc::unbounded_channel();
        let stdin_bytes = request.stdin;
        let timeout = request.timeout;
        let session = self.clone();

        tokio::spawn(async move {
            if let (Some(mut stdin), Some(bytes)) = (stdin_handle, stdin_bytes) {
                use tokio::io::AsyncWriteExt;
                let _ = stdin.write_all(&bytes).await;
            }

            let stdout_task = stdout_reader.map(|reader| tokio::spawn(forward_stdout(reader, tx.clone())));
            let stderr_task = stderr_reader.map(|reader| tokio::spawn(collect_stderr(reader)));

            let started = Instant::now();
            let end_kind = tokio::select! {
                biased;
                _ = cancellation.cancelled() => RunEnd::Cancelled,
                _ = tokio::time::sleep(timeout) => RunEnd::TimedOut,
                status = process.wait() => RunEnd::Completed(status),
            };
            if !matches!(end_kind, RunEnd::Completed(_)) {
                let _ = process.kill().await;
            }

            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            let stderr_bytes = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => Vec::new(),
            };

            let (clean_stderr, new_cwd) = extract_marker(&stderr_bytes, &begin, &end);
            if !clean_stderr.is_empty() {
                let _ = tx.send(OutputChunk::Stderr(clean_stderr));
            }
            if let Some(cwd) = new_cwd {
                if matches!(end_kind, RunEnd::Completed(_)) {
                    *session.cwd.lock() = cwd;
                }
            }

            let duration = started.elapsed();
            let (exit_code, timed_out, cancelled) = match end_kind {
                RunEnd::Completed(Ok(status)) => (status.code().unwrap_or(-1), false, false),
                RunEnd::Completed(Err(_)) => (-1, false, false),
                RunEnd::TimedOut => (-1, true, false),
                RunEnd::Cancelled => (-1, false, true),
            };
            let _ = tx.send(OutputChunk::Exit(ExitInfo { exit_code, duration, timed_out, cancelled }));
        });

        Ok(rx)
    }

}

enum RunEnd {
    Completed(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

async fn forward_stdout(mut reader: tokio::process::ChildStdout, tx: mpsc::UnboundedSender<OutputChunk>) {
    use tokio::io::AsyncReadExt;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(OutputChunk::Stdout(chunk[..n].to_vec())).is_err() {
                    break;
                }
            }
        }
    }
}

async fn collect_stderr(mut reader: tokio::process::ChildStderr) -> Vec<u8> {
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    buf
}

fn extract_marker(buf: &[u8], begin: &str, end: &str) -> (Vec<u8>, Option<String>) {
    let text = String::from_utf8_lossy(buf);
    if let Some(start_idx) = text.find(begin) {
        if let Some(end_rel) = text[start_idx..].find(end) {
            let end_idx = start_idx + end_rel + end.len();
            let cwd = text[start_idx + begin.len()..start_idx + end_rel].to_string();
            let mut cleaned = String::with_capacity(text.len());
            cleaned.push_str(&text[..start_idx]);
            cleaned.push_str(&text[end_idx..]);
            let cleaned = cleaned.trim_end_matches('\n').to_string();
            return (cleaned.into_bytes(), Some(cwd));
        }
    }
    (buf.to_vec(), None)
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn random_nonce() -> u64 {
    rand::rng().next_u64()
}

/// Per-sandbox registry of named sessions, with idle-timeout garbage
/// collection (spec §4.5).
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> Arc<Session> {
        let session = Arc::new(Session::new());
        self.sessions.insert(session.id().clone(), session.clone());
        session
    }

    pub fn get(&self, id: &SessionId) -> AgentFenseResult<Arc<Session>> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AgentFenseError::not_found(id.to_string()))
    }

    pub fn destroy(&self, id: &SessionId) {
        self.sessions.remove(id);
    }

    /// Drop all sessions whose sandbox has stopped — sessions do not
    /// outlive a `running` sandbox (spec §3).
    pub fn clear(&self) {
        self.sessions.clear();
    }

    /// Evict sessions idle longer than `idle_timeout`.
    pub fn collect_idle(&self, idle_timeout: Duration) {
        let idle_timeout = chrono::Duration::from_std(idle_timeout).unwrap_or(chrono::Duration::zero());
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() >= idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();
        for id in stale {
            self.sessions.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimits;
    use crate::sandbox::launcher::LocalProcessLauncher;

    fn request(command: &str) -> ExecRequest {
        ExecRequest {
            command: command.to_string(),
            stdin: None,
            env_overrides: HashMap::new(),
            workdir_override: None,
            timeout: Duration::from_secs(5),
            limits: ResourceLimits::default(),
        }
    }

    #[tokio::test]
    async fn exec_captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let session = registry.create();
        let launcher = LocalProcessLauncher;
        let outcome = session
            .exec(&launcher, dir.path(), request("echo hello"), CancellationToken::new())
            .await
            .unwrap();
        match outcome {
            ExecOutcome::Completed(result) => {
                assert_eq!(String::from_utf8_lossy(&result.stdout).trim(), "hello");
                assert_eq!(result.exit_code, 0);
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exec_reports_nonzero_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let session = registry.create();
        let launcher = LocalProcessLauncher;
        let outcome = session
            .exec(&launcher, dir.path(), request("exit 7"), CancellationToken::new())
            .await
            .unwrap();
        match outcome {
            ExecOutcome::Completed(result) => assert_eq!(result.exit_code, 7),
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exec_times_out_on_slow_command() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let session = registry.create();
        let launcher = LocalProcessLauncher;
        let mut req = request("sleep 5");
        req.timeout = Duration::from_millis(100);
        let outcome = session
            .exec(&launcher, dir.path(), req, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, ExecOutcome::TimedOut { .. }));
    }

    #[tokio::test]
    async fn exec_honors_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let session = registry.create();
        let launcher = LocalProcessLauncher;
        let token = CancellationToken::new();
        token.cancel();
        let outcome = session.exec(&launcher, dir.path(), request("sleep 5"), token).await.unwrap();
        assert!(matches!(outcome, ExecOutcome::Cancelled { .. }));
    }

    #[tokio::test]
    async fn cd_persists_into_next_exec_on_same_session() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let registry = SessionRegistry::new();
        let session = registry.create();
        let launcher = LocalProcessLauncher;
        session.exec(&launcher, dir.path(), request("cd sub"), CancellationToken::new()).await.unwrap();
        assert_eq!(session.cwd(), "sub");
        let outcome = session
            .exec(&launcher, dir.path(), request("pwd"), CancellationToken::new())
            .await
            .unwrap();
        match outcome {
            ExecOutcome::Completed(result) => {
                assert!(String::from_utf8_lossy(&result.stdout).trim().ends_with("/sub"));
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    impl std::fmt::Debug for ExecOutcome {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                ExecOutcome::Completed(r) => write!(f, "Completed({r:?})"),
                ExecOutcome::TimedOut { .. } => write!(f, "TimedOut"),
                ExecOutcome::Cancelled { .. } => write!(f, "Cancelled"),
            }
        }
    }
}
