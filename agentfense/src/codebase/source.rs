//! The `CodebaseSource` trait boundary: byte-level access to a codebase's
//! immutable lower layer, plus two concrete implementations.
//!
//! The actual blob store wire protocol (upload/download streaming, the
//! gRPC/REST surface) is an external collaborator out of scope; this crate
//! only needs `read(path) -> bytes` and `list(prefix) -> entries`, exactly
//! as spec §3 frames it.

use crate::errors::{AgentFenseError, AgentFenseResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

/// One entry returned by [`CodebaseSource::lower_list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowerEntry {
    /// Path relative to the codebase root.
    pub rel_path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Read-only, byte-level access to a codebase's immutable lower layer.
#[async_trait]
pub trait CodebaseSource: Send + Sync {
    /// Read the full contents of a file. `Err(NotFound)` if absent.
    async fn lower_read(&self, rel_path: &str) -> AgentFenseResult<Vec<u8>>;

    /// List entries directly under `rel_path` (non-recursive).
    async fn lower_list(&self, rel_path: &str) -> AgentFenseResult<Vec<LowerEntry>>;

    /// Whether `rel_path` exists in the lower layer, file or directory.
    async fn lower_exists(&self, rel_path: &str) -> bool;
}

/// Holds codebase contents entirely in memory. Used by tests and by
/// embedding contexts where the blob store hasn't been wired up — the
/// in-process analogue of the teacher's test-utils mock image store.
#[derive(Default)]
pub struct InMemoryCodebaseStore {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryCodebaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file's contents. Intermediate directories are implied by path
    /// prefixes, mirroring how `lower_list` derives directory entries from
    /// the same flat map.
    pub fn put(&self, rel_path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files.write().unwrap().insert(rel_path.into(), bytes.into());
    }
}

#[async_trait]
impl CodebaseSource for InMemoryCodebaseStore {
    async fn lower_read(&self, rel_path: &str) -> AgentFenseResult<Vec<u8>> {
        self.files
            .read()
            .unwrap()
            .get(rel_path)
            .cloned()
            .ok_or_else(|| AgentFenseError::not_found(rel_path))
    }

    async fn lower_list(&self, rel_path: &str) -> AgentFenseResult<Vec<LowerEntry>> {
        let prefix = if rel_path.is_empty() {
            String::new()
        } else {
            format!("{}/", rel_path.trim_matches('/'))
        };
        let files = self.files.read().unwrap();
        let mut seen_dirs = std::collections::BTreeSet::new();
        let mut entries = Vec::new();
        for (path, bytes) in files.iter() {
            let Some(rest) = path.strip_prefix(&prefix) else { continue };
            if rest.is_empty() {
                continue;
            }
            match rest.split_once('/') {
                None => entries.push(LowerEntry {
                    rel_path: path.clone(),
                    is_dir: false,
                    size: bytes.len() as u64,
                }),
                Some((dir, _)) => {
                    let dir_path = format!("{prefix}{dir}");
                    if seen_dirs.insert(dir_path.clone()) {
                        entries.push(LowerEntry {
                            rel_path: dir_path,
                            is_dir: true,
                            size: 0,
                        });
                    }
                }
            }
        }
        Ok(entries)
    }

    async fn lower_exists(&self, rel_path: &str) -> bool {
        let files = self.files.read().unwrap();
        if files.contains_key(rel_path) {
            return true;
        }
        let prefix = format!("{}/", rel_path.trim_matches('/'));
        files.keys().any(|p| p.starts_with(&prefix))
    }
}

/// Reads codebase contents from a directory tree on disk, rooted at
/// `<base>/files/<codebase_id>/` (spec §6 "Persisted state").
pub struct FsCodebaseStore {
    root: PathBuf,
}

impl FsCodebaseStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, rel_path: &str) -> PathBuf {
        self.root.join(rel_path.trim_start_matches('/'))
    }
}

#[async_trait]
impl CodebaseSource for FsCodebaseStore {
    async fn lower_read(&self, rel_path: &str) -> AgentFenseResult<Vec<u8>> {
        let path = self.resolve(rel_path);
        tokio::fs::read(&path).await.map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => AgentFenseError::not_found(rel_path),
            _ => AgentFenseError::Io(err.to_string()),
        })
    }

    async fn lower_list(&self, rel_path: &str) -> AgentFenseResult<Vec<LowerEntry>> {
        let dir = self.resolve(rel_path);
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(r) => r,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(AgentFenseError::Io(err.to_string())),
        };
        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_rel = join_rel(rel_path, &name);
            entries.push(LowerEntry {
                rel_path: child_rel,
                is_dir: metadata.is_dir(),
                size: metadata.len(),
            });
        }
        Ok(entries)
    }

    async fn lower_exists(&self, rel_path: &str) -> bool {
        tokio::fs::metadata(self.resolve(rel_path)).await.is_ok()
    }
}

fn join_rel(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", base.trim_matches('/'), name)
    }
}

/// Compute a hex-encoded SHA-256 checksum the way codebase uploads are
/// checksummed (spec §6).
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_round_trip() {
        let store = InMemoryCodebaseStore::new();
        store.put("a.txt", b"hi".to_vec());
        assert_eq!(store.lower_read("a.txt").await.unwrap(), b"hi");
        assert!(matches!(store.lower_read("missing.txt").await, Err(AgentFenseError::NotFound(_))));
    }

    #[tokio::test]
    async fn in_memory_store_lists_implied_directories() {
        let store = InMemoryCodebaseStore::new();
        store.put("src/main.rs", b"fn main() {}".to_vec());
        store.put("README.md", b"hi".to_vec());
        let entries = store.lower_list("").await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.rel_path.as_str()).collect();
        assert!(names.contains(&"src"));
        assert!(names.contains(&"README.md"));
    }

    #[test]
    fn checksum_is_stable() {
        assert_eq!(sha256_hex(b"hello"), sha256_hex(b"hello"));
        assert_ne!(sha256_hex(b"hello"), sha256_hex(b"world"));
    }
}
