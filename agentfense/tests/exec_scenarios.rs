//! Cross-module scenarios driven entirely through the public
//! [`agentfense::SandboxEngine`] facade — the shape of exercise the real
//! gRPC/REST transport (out of scope per spec §1) would put it through.
//!
//! Complements the inline unit tests in `overlay::fs`, `permissions::engine`,
//! and `sandbox::manager`, which already cover scenarios 1-4, 7, and
//! invariants 1-5, 7, 9 directly against the permission engine and overlay
//! filesystem. These tests instead exercise the seeded suite's scenarios
//! that only show up once exec, lifecycle, and reconciliation are wired
//! together end to end (spec §8 scenarios 5, 6; invariant 10).

use agentfense::config::{ResourceLimits, SandboxEngineOptions};
use agentfense::permissions::{Permission, PermissionRule};
use agentfense::sandbox::SandboxStatus;
use agentfense::session::ExecOutcome;
use agentfense_test_utils::{permissive_rules, seed_codebase, test_engine, SandboxFixture};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn request(command: &str) -> agentfense::session::ExecRequest {
    agentfense::session::ExecRequest {
        command: command.to_string(),
        stdin: None,
        env_overrides: HashMap::new(),
        workdir_override: None,
        timeout: Duration::from_secs(10),
        limits: ResourceLimits::default(),
    }
}

fn completed(outcome: ExecOutcome) -> (String, String, i32) {
    match outcome {
        ExecOutcome::Completed(result) => (
            String::from_utf8_lossy(&result.stdout).to_string(),
            String::from_utf8_lossy(&result.stderr).to_string(),
            result.exit_code,
        ),
        ExecOutcome::TimedOut { .. } => panic!("command unexpectedly timed out"),
        ExecOutcome::Cancelled { .. } => panic!("command unexpectedly cancelled"),
    }
}

/// Writes a command makes against a write-tier file persist across a
/// stop/start cycle of the same sandbox (reconcile captures the edit, the
/// next mount materializes it back).
#[tokio::test]
async fn write_tier_edit_survives_stop_start_cycle() {
    let fixture = SandboxFixture::new(&[("a.txt", b"alpha")], permissive_rules()).await;
    let id = fixture.sandbox_id();

    let outcome = fixture.engine.exec(id, request("echo -n mutated > a.txt"), CancellationToken::new()).await.unwrap();
    let (_, _, code) = completed(outcome);
    assert_eq!(code, 0);

    fixture.engine.stop_sandbox(id).await.unwrap();
    fixture.engine.start_sandbox(id).await.unwrap();

    let outcome = fixture.engine.exec(id, request("cat a.txt"), CancellationToken::new()).await.unwrap();
    let (stdout, _, _) = completed(outcome);
    assert_eq!(stdout, "mutated");
}

/// A host-level edit to a *read*-tier file (materialized read-write on disk
/// since the local-process launcher can't express "visible but
/// unreadable" without FUSE, spec §9) is still refused when reconciliation
/// asks the overlay to record it, because `write_full` re-checks the
/// permission engine. The edit is silently dropped rather than persisted.
#[tokio::test]
async fn read_tier_host_edit_is_discarded_on_reconcile() {
    let rules = vec![
        PermissionRule::glob("ticket.txt", Permission::Read, 0),
        PermissionRule::glob("**", Permission::Write, 0),
    ];
    let fixture = SandboxFixture::new(&[("ticket.txt", b"original")], rules).await;
    let id = fixture.sandbox_id();

    let outcome = fixture.engine.exec(id, request("echo -n tampered > ticket.txt"), CancellationToken::new()).await.unwrap();
    assert_eq!(completed(outcome).2, 0, "the shell write itself succeeds at the OS level");

    fixture.engine.stop_sandbox(id).await.unwrap();
    fixture.engine.start_sandbox(id).await.unwrap();

    let outcome = fixture.engine.exec(id, request("cat ticket.txt"), CancellationToken::new()).await.unwrap();
    let (stdout, _, _) = completed(outcome);
    assert_eq!(stdout, "original", "the permission-denied write must not survive reconciliation");
}

/// A `none`-tier file never appears in the materialized mount at all.
#[tokio::test]
async fn none_tier_file_is_absent_from_the_mount() {
    let rules = vec![
        PermissionRule::glob("secret.txt", Permission::None, 0),
        PermissionRule::glob("**", Permission::Write, 0),
    ];
    let fixture = SandboxFixture::new(&[("secret.txt", b"shh"), ("public.txt", b"hi")], rules).await;
    let id = fixture.sandbox_id();

    let outcome = fixture.engine.exec(id, request("test -e secret.txt"), CancellationToken::new()).await.unwrap();
    assert_ne!(completed(outcome).2, 0, "secret.txt must not exist in the mount");

    let outcome = fixture.engine.exec(id, request("ls"), CancellationToken::new()).await.unwrap();
    let (stdout, _, _) = completed(outcome);
    assert!(!stdout.contains("secret.txt"));
    assert!(stdout.contains("public.txt"));
}

/// Scenario 5: two sandboxes sharing one codebase never see each other's
/// upper-layer writes. A brand new file created in sandbox A is invisible
/// to sandbox B.
#[tokio::test]
async fn sandboxes_sharing_a_codebase_do_not_see_each_others_writes() {
    let (_home, engine) = test_engine();
    let codebase_id = seed_codebase(&engine, &[("shared.txt", b"shared")]);

    let info_a = engine
        .create_sandbox(codebase_id.clone(), permissive_rules(), HashMap::new(), Duration::from_secs(300))
        .await
        .unwrap();
    engine.start_sandbox(&info_a.id).await.unwrap();

    let info_b = engine
        .create_sandbox(codebase_id, permissive_rules(), HashMap::new(), Duration::from_secs(300))
        .await
        .unwrap();
    engine.start_sandbox(&info_b.id).await.unwrap();

    let outcome = engine
        .exec(&info_a.id, request("echo -n from-a > only_in_a.txt"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(completed(outcome).2, 0);

    let outcome = engine.exec(&info_b.id, request("test -e only_in_a.txt"), CancellationToken::new()).await.unwrap();
    assert_ne!(completed(outcome).2, 0, "sandbox B must not see sandbox A's new file");

    let outcome = engine.exec(&info_b.id, request("cat shared.txt"), CancellationToken::new()).await.unwrap();
    assert_eq!(completed(outcome).0, "shared", "both sandboxes still see the untouched lower file");
}

/// Scenario 6: once a sandbox's TTL has expired, `Exec` against it fails
/// with `invalid_status` rather than silently running.
#[tokio::test]
async fn exec_after_ttl_expiry_is_invalid_status() {
    let home = tempfile::tempdir().unwrap();
    let options = SandboxEngineOptions::new(home.path()).with_ttl_scan_interval(Duration::from_millis(20));
    let engine = agentfense::SandboxEngine::with_defaults(options);
    let codebase_id = seed_codebase(&engine, &[("a.txt", b"alpha")]);

    let info = engine
        .create_sandbox(codebase_id, permissive_rules(), HashMap::new(), Duration::from_millis(1))
        .await
        .unwrap();
    engine.start_sandbox(&info.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = engine.get_sandbox(&info.id).await.unwrap().status;
    assert_eq!(status, SandboxStatus::Stopped);

    let result = engine.session_exec(&info.id, &agentfense::ids::SessionId::new(), request("true"), CancellationToken::new()).await;
    assert!(matches!(result, Err(agentfense::errors::AgentFenseError::InvalidStatus(_))));
}

/// A session's `cd` persists into the next `SessionExec` call on the same
/// session (spec §4.5), exercised through the public session surface
/// rather than the internal `Session` type directly.
#[tokio::test]
async fn session_cwd_persists_across_calls() {
    let fixture = SandboxFixture::new(&[], permissive_rules()).await;
    let id = fixture.sandbox_id();
    fixture.engine.exec(id, request("mkdir sub"), CancellationToken::new()).await.unwrap();

    let session_id = fixture.engine.create_session(id).unwrap();
    fixture.engine.session_exec(id, &session_id, request("cd sub"), CancellationToken::new()).await.unwrap();
    let outcome = fixture.engine.session_exec(id, &session_id, request("pwd"), CancellationToken::new()).await.unwrap();
    let (stdout, _, _) = completed(outcome);
    assert!(stdout.trim().ends_with("/sub"));

    fixture.engine.destroy_session(id, &session_id).unwrap();
    let result = fixture.engine.session_exec(id, &session_id, request("pwd"), CancellationToken::new()).await;
    assert!(matches!(result, Err(agentfense::errors::AgentFenseError::NotFound(_))));
}
