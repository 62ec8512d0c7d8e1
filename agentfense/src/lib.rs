//! AgentFense: a permissioned, copy-on-write sandbox runtime for running
//! untrusted agent commands against a codebase without ever mutating it.
//!
//! The crate is organized the way the teacher's `boxlite` is: a thin facade
//! ([`SandboxEngine`]) over independently-testable subsystems —
//! [`codebase`] (the immutable lower layer and its registry), [`permissions`]
//! (the path-level rule engine), [`delta`] (the per-sandbox upper layer),
//! [`overlay`] (the two composed into one filesystem view, plus physical
//! mount materialization for the process launcher), [`sandbox`] (the
//! lifecycle state machine and runtime launcher), and [`session`] (exec
//! sessions with persisted cwd/env).

pub mod codebase;
pub mod config;
pub mod delta;
pub mod errors;
pub mod ids;
pub mod overlay;
pub mod permissions;
mod retry;
pub mod sandbox;
pub mod session;

use crate::codebase::{Codebase, CodebaseMetadata, CodebaseRegistry, CodebaseSource};
use crate::config::SandboxEngineOptions;
use crate::errors::{AgentFenseError, AgentFenseResult};
use crate::ids::{CodebaseId, SandboxId, SessionId};
use crate::permissions::PermissionRule;
use crate::sandbox::{LocalProcessLauncher, RuntimeLauncher, SandboxInfo, SandboxManager, SandboxSpec, SandboxStatus};
use crate::session::{ExecOutcome, ExecRequest};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Top-level entry point into the sandbox runtime (spec §6), mirroring the
/// teacher's `BoxliteRuntime`: a facade over a codebase registry and a
/// sandbox manager, with a process-wide default instance reachable via
/// [`SandboxEngine::default_engine`].
pub struct SandboxEngine {
    codebases: Arc<CodebaseRegistry>,
    sandboxes: Arc<SandboxManager>,
    ttl_scheduler: tokio::task::JoinHandle<()>,
}

static DEFAULT_ENGINE: OnceLock<Arc<SandboxEngine>> = OnceLock::new();

impl SandboxEngine {
    /// Build a new engine with an explicit launcher backend and options.
    pub fn new(launcher: Arc<dyn RuntimeLauncher>, options: SandboxEngineOptions) -> Arc<Self> {
        let codebases = Arc::new(CodebaseRegistry::new());
        let sandboxes = SandboxManager::new(codebases.clone(), launcher, options);
        let ttl_scheduler = sandboxes.spawn_ttl_scheduler();
        Arc::new(Self {
            codebases,
            sandboxes,
            ttl_scheduler,
        })
    }

    /// Build a new engine using the local-process launcher backend, the
    /// one available without a Linux namespace jailer.
    pub fn with_defaults(options: SandboxEngineOptions) -> Arc<Self> {
        Self::new(Arc::new(LocalProcessLauncher), options)
    }

    /// The process-wide default engine, lazily built from
    /// [`SandboxEngineOptions::default`] on first access.
    pub fn default_engine() -> Arc<Self> {
        DEFAULT_ENGINE
            .get_or_init(|| Self::with_defaults(SandboxEngineOptions::default()))
            .clone()
    }

    // -- codebases ---------------------------------------------------

    pub fn create_codebase(&self, name: String, owner_id: String, source: Arc<dyn CodebaseSource>) -> Arc<Codebase> {
        self.codebases.create(name, owner_id, source)
    }

    pub fn get_codebase(&self, id: &CodebaseId) -> AgentFenseResult<Arc<Codebase>> {
        self.codebases.get(id)
    }

    pub fn list_codebases(&self) -> Vec<CodebaseMetadata> {
        self.codebases.list()
    }

    pub fn delete_codebase(&self, id: &CodebaseId) -> AgentFenseResult<()> {
        self.codebases.delete(id)
    }

    // -- sandboxes ----------------------------------------------------

    pub async fn create_sandbox(
        &self,
        codebase_id: CodebaseId,
        rules: Vec<PermissionRule>,
        labels: HashMap<String, String>,
        ttl: Duration,
    ) -> AgentFenseResult<SandboxInfo> {
        let limits = self.sandboxes.default_limits();
        self.create_sandbox_full(codebase_id, rules, labels, ttl, "local".to_string(), None, limits).await
    }

    /// Full-control variant of [`create_sandbox`](Self::create_sandbox)
    /// exposing runtime kind, image, and resource limits (spec §4.1,
    /// §4.6).
    #[allow(clippy::too_many_arguments)]
    pub async fn create_sandbox_full(
        &self,
        codebase_id: CodebaseId,
        rules: Vec<PermissionRule>,
        labels: HashMap<String, String>,
        ttl: Duration,
        runtime_kind: String,
        image: Option<String>,
        limits: crate::config::ResourceLimits,
    ) -> AgentFenseResult<SandboxInfo> {
        let spec = SandboxSpec {
            codebase_id,
            rules,
            labels,
            ttl,
            runtime_kind,
            image,
            limits,
        };
        let sandbox = self.sandboxes.create(spec)?;
        Ok(sandbox.info().await)
    }

    pub async fn get_sandbox(&self, id: &SandboxId) -> AgentFenseResult<SandboxInfo> {
        Ok(self.sandboxes.get(id)?.info().await)
    }

    pub async fn list_sandboxes(&self, codebase_id: Option<&CodebaseId>) -> Vec<SandboxInfo> {
        let mut infos = Vec::new();
        for sandbox in self.sandboxes.list(codebase_id) {
            infos.push(sandbox.info().await);
        }
        infos
    }

    pub async fn start_sandbox(&self, id: &SandboxId) -> AgentFenseResult<()> {
        self.sandboxes.start(id).await
    }

    pub async fn stop_sandbox(&self, id: &SandboxId) -> AgentFenseResult<()> {
        self.sandboxes.stop(id).await
    }

    pub async fn destroy_sandbox(&self, id: &SandboxId) -> AgentFenseResult<()> {
        self.sandboxes.destroy(id).await
    }

    // -- exec -----------------------------------------------------------

    /// One-shot command execution (spec §4.5 `Exec`): runs against an
    /// ephemeral session that is discarded immediately after.
    pub async fn exec(&self, id: &SandboxId, request: ExecRequest, cancellation: CancellationToken) -> AgentFenseResult<ExecOutcome> {
        let sandbox = self.sandboxes.get(id)?;
        let mount = sandbox.mount_path().await?;
        let session = sandbox.sessions.create();
        let outcome = session.exec(self.sandboxes.launcher().as_ref(), &mount, request, cancellation).await;
        sandbox.sessions.destroy(session.id());
        outcome
    }

    /// Create a persisted session whose cwd/env survive across calls to
    /// [`session_exec`](Self::session_exec) (spec §4.5 `CreateSession`).
    pub fn create_session(&self, id: &SandboxId) -> AgentFenseResult<SessionId> {
        let sandbox = self.sandboxes.get(id)?;
        Ok(sandbox.sessions.create().id().clone())
    }

    pub async fn session_exec(
        &self,
        id: &SandboxId,
        session_id: &SessionId,
        request: ExecRequest,
        cancellation: CancellationToken,
    ) -> AgentFenseResult<ExecOutcome> {
        let sandbox = self.sandboxes.get(id)?;
        if !matches!(sandbox.status().await, SandboxStatus::Running) {
            return Err(AgentFenseError::InvalidStatus(format!("sandbox {} is not running", sandbox.id())));
        }
        let session = sandbox.sessions.get(session_id)?;
        let mount = sandbox.mount_path().await?;
        session.exec(self.sandboxes.launcher().as_ref(), &mount, request, cancellation).await
    }

    pub fn destroy_session(&self, id: &SandboxId, session_id: &SessionId) -> AgentFenseResult<()> {
        let sandbox = self.sandboxes.get(id)?;
        sandbox.sessions.destroy(session_id);
        Ok(())
    }
}

impl Drop for SandboxEngine {
    fn drop(&mut self) {
        self.ttl_scheduler.abort();
    }
}
