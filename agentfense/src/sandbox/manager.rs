//! The sandbox lifecycle state machine (spec §4.6): allocates a delta store
//! and permission engine at creation, mounts/unmounts the overlay and
//! launches the runtime on start/stop, enforces TTL expiry, and tears
//! everything down on destroy.
//!
//! Grounded on the teacher's `BoxliteRuntime`/`BoxManager` split
//! (`runtime/core.rs`, `management/manager.rs`): a concurrent registry of
//! handles (`DashMap`, matching the codebase registry's choice) owned by a
//! manager, each handle wrapping its own state behind a lock scoped to just
//! that entity rather than one big runtime-wide lock — the natural shape
//! once lifecycle operations are per-sandbox rather than per-runtime.

use crate::codebase::CodebaseRegistry;
use crate::config::{ResourceLimits, SandboxEngineOptions};
use crate::delta::DeltaStore;
use crate::errors::{AgentFenseError, AgentFenseResult};
use crate::ids::{CodebaseId, SandboxId};
use crate::overlay::{OverlayFilesystem, OverlayMount};
use crate::permissions::{PermissionEngine, PermissionRule, RuleSet};
use crate::retry::with_retry;
use crate::sandbox::launcher::{mount_dir_for, RuntimeLauncher};
use crate::session::SessionRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// Lifecycle state of a sandbox (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Pending,
    Running,
    Stopped,
    Error,
}

/// Caller-supplied parameters for [`SandboxManager::create`].
pub struct SandboxSpec {
    pub codebase_id: CodebaseId,
    pub rules: Vec<PermissionRule>,
    pub labels: HashMap<String, String>,
    pub ttl: Duration,
    pub runtime_kind: String,
    pub image: Option<String>,
    pub limits: ResourceLimits,
}

/// Point-in-time snapshot of a sandbox's public attributes, for
/// `GetSandbox`/`ListSandboxes` (spec §6) without exposing internal locks.
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    pub id: SandboxId,
    pub codebase_id: CodebaseId,
    pub status: SandboxStatus,
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub limits: ResourceLimits,
    pub runtime_kind: String,
    pub image: Option<String>,
}

/// A single sandbox's lifecycle state plus everything it owns: the
/// permission engine (immutable for the sandbox's life), the delta store
/// (ephemeral, survives stop/start, discarded on destroy), and the mount
/// materialized while running.
pub struct Sandbox {
    id: SandboxId,
    codebase_id: CodebaseId,
    labels: HashMap<String, String>,
    created_at: DateTime<Utc>,
    limits: ResourceLimits,
    runtime_kind: String,
    image: Option<String>,

    status: AsyncMutex<SandboxStatus>,
    expires_at: AsyncMutex<DateTime<Utc>>,
    /// Serializes lifecycle transitions on this sandbox (spec §5: "at-most-one
    /// concurrent lifecycle operation per sandbox").
    lifecycle_lock: AsyncMutex<()>,

    engine: Arc<PermissionEngine>,
    delta: Arc<DeltaStore>,
    overlay: Arc<OverlayFilesystem>,
    mount: AsyncMutex<Option<OverlayMount>>,
    scratch_dir: std::path::PathBuf,

    pub sessions: SessionRegistry,
}

impl Sandbox {
    pub fn id(&self) -> &SandboxId {
        &self.id
    }

    pub fn overlay(&self) -> &Arc<OverlayFilesystem> {
        &self.overlay
    }

    pub async fn status(&self) -> SandboxStatus {
        *self.status.lock().await
    }

    pub async fn expires_at(&self) -> DateTime<Utc> {
        *self.expires_at.lock().await
    }

    pub async fn info(&self) -> SandboxInfo {
        SandboxInfo {
            id: self.id.clone(),
            codebase_id: self.codebase_id.clone(),
            status: self.status().await,
            labels: self.labels.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at().await,
            limits: self.limits,
            runtime_kind: self.runtime_kind.clone(),
            image: self.image.clone(),
        }
    }

    /// The mount directory a launched command's working directory is
    /// rooted at, valid only while `running`.
    pub async fn mount_path(&self) -> AgentFenseResult<std::path::PathBuf> {
        let mount = self.mount.lock().await;
        match mount.as_ref() {
            Some(m) => Ok(m.path().to_path_buf()),
            None => Err(AgentFenseError::InvalidStatus(format!("sandbox {} is not running", self.id))),
        }
    }

    /// `pending|stopped -> running`: materialize the overlay mount and mark
    /// running. No-op-success is NOT granted here (spec: only `stop` and
    /// `destroy` are idempotent); starting an already-running sandbox is
    /// `invalid_status`.
    pub async fn start(self: &Arc<Self>, launcher: &dyn RuntimeLauncher) -> AgentFenseResult<()> {
        let _guard = self.lifecycle_lock.lock().await;
        let current = *self.status.lock().await;
        if !matches!(current, SandboxStatus::Pending | SandboxStatus::Stopped) {
            return Err(AgentFenseError::InvalidStatus(format!(
                "cannot start sandbox {} from state {current:?}",
                self.id
            )));
        }
        tracing::debug!(sandbox_id = %self.id, from = ?current, "mounting overlay");
        let mount_dir = mount_dir_for(&self.scratch_dir);
        let overlay = self.overlay.clone();
        match with_retry(|| OverlayMount::materialize(&overlay, &mount_dir)).await {
            Ok(mount) => {
                *self.mount.lock().await = Some(mount);
                *self.status.lock().await = SandboxStatus::Running;
                let _ = launcher;
                tracing::debug!(sandbox_id = %self.id, "sandbox running");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(sandbox_id = %self.id, error = %err, "mount failed after retries, sandbox entering error state");
                *self.status.lock().await = SandboxStatus::Error;
                Err(err)
            }
        }
    }

    /// `running -> stopped`: reconcile the mount back into the delta store,
    /// unmount, drop sessions. `stopped -> stopped` is a no-op success
    /// (spec invariant 8); any other state is `invalid_status`.
    pub async fn stop(self: &Arc<Self>) -> AgentFenseResult<()> {
        let _guard = self.lifecycle_lock.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(self: &Arc<Self>) -> AgentFenseResult<()> {
        let current = *self.status.lock().await;
        match current {
            SandboxStatus::Stopped => return Ok(()),
            SandboxStatus::Running => {}
            other => {
                return Err(AgentFenseError::InvalidStatus(format!(
                    "cannot stop sandbox {} from state {other:?}",
                    self.id
                )))
            }
        }
        let mount = self.mount.lock().await.take();
        if let Some(mount) = mount {
            tracing::debug!(sandbox_id = %self.id, "reconciling and unmounting overlay");
            let overlay = self.overlay.clone();
            if let Err(err) = with_retry(|| mount.reconcile(&overlay)).await {
                tracing::warn!(sandbox_id = %self.id, error = %err, "unmount failed after retries, sandbox entering error state");
                *self.status.lock().await = SandboxStatus::Error;
                return Err(err);
            }
            mount.discard().await;
        }
        self.sessions.clear();
        *self.status.lock().await = SandboxStatus::Stopped;
        tracing::debug!(sandbox_id = %self.id, "sandbox stopped");
        Ok(())
    }

    /// Internal-fault transition: any state -> error, unmounting
    /// best-effort without reconciling (the fault means we can no longer
    /// trust the mount's content).
    pub async fn mark_error(&self, reason: &str) {
        tracing::warn!(sandbox_id = %self.id, reason, "sandbox transitioned to error");
        let mount = self.mount.lock().await.take();
        if let Some(mount) = mount {
            let _ = tokio::fs::remove_dir_all(mount.path()).await;
        }
        *self.status.lock().await = SandboxStatus::Error;
    }

    /// `any -> ttl-expire -> stopped`. Pending/error sandboxes flip status
    /// directly (nothing mounted to reconcile); running sandboxes go
    /// through the same path as an explicit `stop`.
    async fn ttl_expire(self: &Arc<Self>) {
        let current = *self.status.lock().await;
        match current {
            SandboxStatus::Running => {
                if self.stop().await.is_err() {
                    self.mark_error("ttl-expire stop failed").await;
                }
            }
            SandboxStatus::Pending => {
                *self.status.lock().await = SandboxStatus::Stopped;
            }
            SandboxStatus::Stopped | SandboxStatus::Error => {}
        }
    }
}

/// Owns the codebase registry, the live sandbox table, the configured
/// runtime launcher, and the TTL scheduler.
pub struct SandboxManager {
    codebases: Arc<CodebaseRegistry>,
    sandboxes: DashMap<SandboxId, Arc<Sandbox>>,
    launcher: Arc<dyn RuntimeLauncher>,
    options: SandboxEngineOptions,
}

impl SandboxManager {
    pub fn new(codebases: Arc<CodebaseRegistry>, launcher: Arc<dyn RuntimeLauncher>, options: SandboxEngineOptions) -> Arc<Self> {
        Arc::new(Self {
            codebases,
            sandboxes: DashMap::new(),
            launcher,
            options,
        })
    }

    /// `– -> pending`: allocate the delta store and permission engine; no
    /// mount is materialized until `start`.
    pub fn create(&self, spec: SandboxSpec) -> AgentFenseResult<Arc<Sandbox>> {
        let codebase = self.codebases.acquire(&spec.codebase_id)?;
        let rule_set = RuleSet::new(spec.rules)?;
        let engine = Arc::new(PermissionEngine::new(rule_set, self.options.permission_cache_capacity()));
        let id = SandboxId::new();
        let delta = Arc::new(DeltaStore::create(&self.options.scratch_dir())?);
        let scratch_dir = delta.scratch_dir().to_path_buf();
        let overlay = Arc::new(OverlayFilesystem::new(codebase, delta.clone(), engine.clone()));
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(spec.ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));

        let sandbox = Arc::new(Sandbox {
            id: id.clone(),
            codebase_id: spec.codebase_id,
            labels: spec.labels,
            created_at: now,
            limits: spec.limits,
            runtime_kind: spec.runtime_kind,
            image: spec.image,
            status: AsyncMutex::new(SandboxStatus::Pending),
            expires_at: AsyncMutex::new(expires_at),
            lifecycle_lock: AsyncMutex::new(()),
            engine,
            delta,
            overlay,
            mount: AsyncMutex::new(None),
            scratch_dir,
            sessions: SessionRegistry::new(),
        });
        self.sandboxes.insert(id, sandbox.clone());
        Ok(sandbox)
    }

    pub fn get(&self, id: &SandboxId) -> AgentFenseResult<Arc<Sandbox>> {
        self.sandboxes
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AgentFenseError::not_found(id.to_string()))
    }

    pub fn list(&self, codebase_id: Option<&CodebaseId>) -> Vec<Arc<Sandbox>> {
        self.sandboxes
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|sandbox| match codebase_id {
                Some(cb) => &sandbox.codebase_id == cb,
                None => true,
            })
            .collect()
    }

    pub async fn start(&self, id: &SandboxId) -> AgentFenseResult<()> {
        self.get(id)?.start(self.launcher.as_ref()).await
    }

    pub async fn stop(&self, id: &SandboxId) -> AgentFenseResult<()> {
        self.get(id)?.stop().await
    }

    /// `any -> destroy -> (removed)`: ensure stopped, discard the delta
    /// store, release the codebase refcount, drop the map entry.
    pub async fn destroy(&self, id: &SandboxId) -> AgentFenseResult<()> {
        let sandbox = self.get(id)?;
        if matches!(sandbox.status().await, SandboxStatus::Running) {
            sandbox.stop().await?;
        }
        self.sandboxes.remove(id);
        self.codebases.release(&sandbox.codebase_id);
        Ok(())
    }

    pub fn launcher(&self) -> &Arc<dyn RuntimeLauncher> {
        &self.launcher
    }

    pub fn default_limits(&self) -> ResourceLimits {
        self.options.default_limits()
    }

    /// Scan every tracked sandbox and fire `ttl-expire` for those whose
    /// `expires_at <= now` (spec §4.6 "TTL enforcement"). Intended to be
    /// driven by a periodic task at `options.ttl_scan_interval()`.
    pub async fn scan_ttl(&self) {
        let now = Utc::now();
        let expired: Vec<Arc<Sandbox>> = self
            .sandboxes
            .iter()
            .filter(|entry| entry.value().expires_at.try_lock().map(|g| *g).unwrap_or(now) <= now)
            .map(|entry| entry.value().clone())
            .collect();
        for sandbox in expired {
            sandbox.ttl_expire().await;
        }
    }

    /// Spawn the TTL scheduler as a background task on the current tokio
    /// runtime, scanning every `ttl_scan_interval`. Returns a handle the
    /// embedder can abort on shutdown.
    pub fn spawn_ttl_scheduler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let interval = self.options.ttl_scan_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                manager.scan_ttl().await;
            }
        })
    }
}
