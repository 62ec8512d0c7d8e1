//! Path traversal defense (spec §3 invariant 3, §4.4 "Path traversal
//! defense", §8 invariant 9).
//!
//! Lexical normalization only — no filesystem access, no symlink
//! resolution — so it works uniformly for paths that may only exist in the
//! lower layer, the upper layer, or neither yet.

use crate::errors::{AgentFenseError, AgentFenseResult};
use std::path::{Component, Path, PathBuf};

/// Resolve an agent-supplied path against the overlay root, rejecting any
/// path that would escape it after lexical `..`/`.` resolution.
///
/// Returns the normalized, slash-separated, root-relative path with no
/// leading `/` and no `.`/`..` components — safe to join onto either the
/// lower or upper root.
pub fn sanitize_rel_path(input: &str) -> AgentFenseResult<String> {
    let mut out = PathBuf::new();
    for component in Path::new(input).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err(AgentFenseError::permission_denied(input, "path traversal"));
                }
            }
            Component::Normal(segment) => out.push(segment),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(out.to_string_lossy().replace('\\', "/"))
}
