//! Shared fixtures for `agentfense`'s test suites: a scratch engine wired to
//! the local-process launcher, a codebase preloaded with fixture files, and
//! a running sandbox ready for `exec`. Kept in its own crate, as a
//! dev-dependency of `agentfense`, so integration tests under
//! `agentfense/tests/` can share the same setup code as the crate's own
//! `#[cfg(test)]` modules without a circular path dependency.

use agentfense::codebase::InMemoryCodebaseStore;
use agentfense::config::SandboxEngineOptions;
use agentfense::errors::AgentFenseResult;
use agentfense::ids::{CodebaseId, SandboxId};
use agentfense::permissions::{Permission, PermissionRule};
use agentfense::sandbox::SandboxInfo;
use agentfense::SandboxEngine;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Whether a process with the given pid still exists, via a null signal
/// (`libc::kill(pid, 0)`) — used to assert that a killed or dropped
/// [`LaunchedProcess`](agentfense::sandbox::LaunchedProcess) is actually
/// reaped rather than left as a zombie.
pub fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Run a batch of futures concurrently and collect their outputs in order —
/// for exercising invariants that only matter under concurrent access (e.g.
/// two sandboxes writing through the same codebase's lower layer must not
/// observe each other's upper-layer writes).
pub async fn run_concurrently<F: Future>(futs: Vec<F>) -> Vec<F::Output> {
    futures::future::join_all(futs).await
}

/// Thread-safe counter for asserting how many times a concurrent operation
/// actually ran, without pulling in an atomics import at every call site.
#[derive(Default)]
pub struct CallCounter(parking_lot::Mutex<u64>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        *self.0.lock() += 1;
    }

    pub fn get(&self) -> u64 {
        *self.0.lock()
    }
}

/// A fresh engine rooted at its own temp directory, plus the directory so
/// the caller can keep it alive for the test's duration.
pub fn test_engine() -> (TempDir, Arc<SandboxEngine>) {
    let home = tempfile::tempdir().expect("create temp home dir");
    let options = SandboxEngineOptions::new(home.path())
        .with_ttl_scan_interval(Duration::from_millis(50))
        .with_permission_cache_capacity(256);
    (home, SandboxEngine::with_defaults(options))
}

/// Register a codebase with the given fixture files (`rel_path -> content`).
pub fn seed_codebase(engine: &SandboxEngine, files: &[(&str, &[u8])]) -> CodebaseId {
    let store = InMemoryCodebaseStore::new();
    for (path, contents) in files {
        store.put(path, contents.to_vec());
    }
    engine
        .create_codebase("fixture".to_string(), "test-owner".to_string(), Arc::new(store))
        .metadata()
        .id
        .clone()
}

/// The permission rule set used by most fixtures: full read-write
/// everywhere unless the caller overrides specific paths.
pub fn permissive_rules() -> Vec<PermissionRule> {
    vec![PermissionRule::glob("**", Permission::Write, 0)]
}

/// Create and start a sandbox against `codebase_id` with `rules`, returning
/// its info once it's running.
pub async fn running_sandbox(
    engine: &SandboxEngine,
    codebase_id: CodebaseId,
    rules: Vec<PermissionRule>,
) -> AgentFenseResult<SandboxInfo> {
    let info = engine
        .create_sandbox(codebase_id, rules, HashMap::new(), Duration::from_secs(300))
        .await?;
    engine.start_sandbox(&info.id).await?;
    engine.get_sandbox(&info.id).await
}

/// Convenience wrapper bundling engine, codebase, and a started sandbox —
/// the shape most end-to-end scenario tests start from.
pub struct SandboxFixture {
    pub home: TempDir,
    pub engine: Arc<SandboxEngine>,
    pub codebase_id: CodebaseId,
    pub sandbox: SandboxInfo,
}

impl SandboxFixture {
    pub async fn new(files: &[(&str, &[u8])], rules: Vec<PermissionRule>) -> Self {
        let (home, engine) = test_engine();
        let codebase_id = seed_codebase(&engine, files);
        let sandbox = running_sandbox(&engine, codebase_id.clone(), rules)
            .await
            .expect("start fixture sandbox");
        Self {
            home,
            engine,
            codebase_id,
            sandbox,
        }
    }

    pub fn sandbox_id(&self) -> &SandboxId {
        &self.sandbox.id
    }
}

/// Generates one named constant per permission tier
/// (`NONE`/`VIEW`/`READ`/`WRITE`), so scenario tests that build a
/// tier-by-tier rule table (spec §3's four-tier model) can refer to
/// `permission_tier!(write)` instead of the fully-qualified enum path.
#[macro_export]
macro_rules! permission_tier {
    (none) => {
        agentfense::permissions::Permission::None
    };
    (view) => {
        agentfense::permissions::Permission::View
    };
    (read) => {
        agentfense::permissions::Permission::Read
    };
    (write) => {
        agentfense::permissions::Permission::Write
    };
}

/// Builds one `#[tokio::test]` per permission tier against a single body,
/// for assertions that must hold identically across all four tiers (e.g.
/// "stat always succeeds regardless of permission"). Backed by `paste` to
/// synthesize the per-tier test function names.
#[macro_export]
macro_rules! for_each_permission_tier {
    ($test_name:ident, |$perm:ident| $body:expr) => {
        paste::paste! {
            #[tokio::test]
            async fn [<$test_name _none>]() {
                let $perm = $crate::permission_tier!(none);
                $body
            }

            #[tokio::test]
            async fn [<$test_name _view>]() {
                let $perm = $crate::permission_tier!(view);
                $body
            }

            #[tokio::test]
            async fn [<$test_name _read>]() {
                let $perm = $crate::permission_tier!(read);
                $body
            }

            #[tokio::test]
            async fn [<$test_name _write>]() {
                let $perm = $crate::permission_tier!(write);
                $body
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixture_sandbox_starts_running() {
        let fixture = SandboxFixture::new(&[("a.txt", b"alpha")], permissive_rules()).await;
        assert_eq!(fixture.sandbox.status, agentfense::sandbox::SandboxStatus::Running);
    }

    for_each_permission_tier!(tier_macro_resolves_to_matching_variant, |perm| {
        let _: agentfense::permissions::Permission = perm;
    });

    #[test]
    fn process_alive_true_for_self() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn process_alive_false_for_bogus_pid() {
        assert!(!process_alive(u32::MAX - 1));
    }

    #[tokio::test]
    async fn run_concurrently_preserves_order_and_counts_calls() {
        let counter = Arc::new(CallCounter::new());
        let futs: Vec<_> = (0..5)
            .map(|i| {
                let counter = counter.clone();
                async move {
                    counter.increment();
                    i
                }
            })
            .collect();
        let results = run_concurrently(futs).await;
        assert_eq!(results, vec![0, 1, 2, 3, 4]);
        assert_eq!(counter.get(), 5);
    }
}
