//! Per-sandbox copy-on-write delta store (spec §4.3).
//!
//! Backed by a private scratch directory (RAII-cleaned on drop, in the
//! style of the teacher's `volumes::Disk`), with the upper/tombstone/new-dir
//! bookkeeping held in memory behind per-path locks.

use crate::errors::{AgentFenseError, AgentFenseResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What the delta store knows about a path in the upper layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpperLookup {
    /// Materialized in the upper layer at the returned scratch-relative path.
    Present(PathBuf),
    /// Deleted; hides the lower entry.
    Tombstoned,
    /// Not present in the upper layer at all (fall through to lower).
    Absent,
}

struct Inner {
    /// relative path -> absolute path of its blob under `scratch_dir`.
    upper_files: HashMap<String, PathBuf>,
    tombstones: HashSet<String>,
    new_dirs: HashSet<String>,
}

/// Ephemeral per-sandbox scratch area holding copy-on-write file contents,
/// new files/directories, and deletion tombstones.
pub struct DeltaStore {
    scratch_dir: PathBuf,
    inner: RwLock<Inner>,
    /// Serializes cross-path operations that must appear atomic (rename).
    store_lock: Mutex<()>,
    /// If true, `scratch_dir` is not removed on drop.
    persistent: bool,
}

impl DeltaStore {
    /// Create a store rooted at a fresh temporary directory under `base_dir`.
    pub fn create(base_dir: &Path) -> AgentFenseResult<Self> {
        std::fs::create_dir_all(base_dir)?;
        let scratch_dir = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir_in(base_dir)?
            .into_path();
        Ok(Self {
            scratch_dir,
            inner: RwLock::new(Inner {
                upper_files: HashMap::new(),
                tombstones: HashSet::new(),
                new_dirs: HashSet::new(),
            }),
            store_lock: Mutex::new(()),
            persistent: false,
        })
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    fn blob_path(&self, rel: &str) -> PathBuf {
        self.scratch_dir.join("blobs").join(sanitize_blob_name(rel))
    }

    /// Look up a path's state in the upper layer. An exact `upper_files`
    /// entry wins over an ancestor tombstone, so recreating a path under a
    /// removed directory (`rmdir` then `create`) makes it visible again.
    pub fn upper_lookup(&self, rel_path: &str) -> UpperLookup {
        let inner = self.inner.read();
        if let Some(path) = inner.upper_files.get(rel_path) {
            return UpperLookup::Present(path.clone());
        }
        if tombstone_covers(&inner.tombstones, rel_path) {
            return UpperLookup::Tombstoned;
        }
        UpperLookup::Absent
    }

    /// Whether `rel_path` is hidden by a tombstone on itself or on an
    /// ancestor directory, unless it has its own exact upper-layer entry.
    /// Used by the overlay to reject listing a directory nested under a
    /// removed one, without needing `upper_lookup`'s `Present` payload.
    pub fn is_hidden(&self, rel_path: &str) -> bool {
        let inner = self.inner.read();
        if inner.upper_files.contains_key(rel_path) || inner.new_dirs.contains(rel_path) {
            return false;
        }
        tombstone_covers(&inner.tombstones, rel_path)
    }

    /// Materialize `rel_path` from `lower_bytes` into the upper layer if it
    /// isn't already there. Idempotent.
    pub fn copy_up(&self, rel_path: &str, lower_bytes: &[u8]) -> AgentFenseResult<()> {
        let _guard = self.store_lock.lock();
        {
            let inner = self.inner.read();
            if inner.upper_files.contains_key(rel_path) || inner.tombstones.contains(rel_path) {
                return Ok(());
            }
        }
        self.write_blob(rel_path, lower_bytes)?;
        let mut inner = self.inner.write();
        inner.tombstones.remove(rel_path);
        inner.upper_files.insert(rel_path.to_string(), self.blob_path(rel_path));
        Ok(())
    }

    /// Overwrite or append bytes to an upper file at `offset`. The caller is
    /// responsible for having called [`copy_up`] first for lower-originated
    /// files, or [`create`] for brand new ones.
    pub fn write_at(&self, rel_path: &str, offset: u64, bytes: &[u8]) -> AgentFenseResult<()> {
        let path = {
            let inner = self.inner.read();
            inner
                .upper_files
                .get(rel_path)
                .cloned()
                .ok_or_else(|| AgentFenseError::Internal(format!("write_at without copy_up/create: {rel_path}")))?
        };
        use std::io::{Seek, SeekFrom, Write as _};
        let mut file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Record a brand-new file in the upper layer, clearing any tombstone.
    pub fn create(&self, rel_path: &str) -> AgentFenseResult<()> {
        self.write_blob(rel_path, &[])?;
        let mut inner = self.inner.write();
        inner.tombstones.remove(rel_path);
        inner.upper_files.insert(rel_path.to_string(), self.blob_path(rel_path));
        Ok(())
    }

    /// Replace a file's entire upper-layer content, creating it in the
    /// upper layer first if absent. Unlike [`write_at`], this always
    /// truncates to `bytes` rather than splicing at an offset — used by
    /// the physical-mount reconciler (spec §9 "`view` on container
    /// filesystems"), which only ever has a whole new file to report.
    pub fn write_full(&self, rel_path: &str, bytes: &[u8]) -> AgentFenseResult<()> {
        let present = self.inner.read().upper_files.contains_key(rel_path);
        if !present {
            self.create(rel_path)?;
        }
        self.write_blob(rel_path, bytes)
    }

    /// Delete a path: tombstone it if it has a lower counterpart, otherwise
    /// simply remove it from the upper layer.
    pub fn unlink(&self, rel_path: &str, exists_in_lower: bool) {
        let mut inner = self.inner.write();
        inner.upper_files.remove(rel_path);
        if exists_in_lower {
            inner.tombstones.insert(rel_path.to_string());
        } else {
            inner.tombstones.remove(rel_path);
        }
    }

    /// Record a new directory in the upper layer.
    pub fn mkdir(&self, rel_path: &str) {
        let mut inner = self.inner.write();
        inner.tombstones.remove(rel_path);
        inner.new_dirs.insert(rel_path.to_string());
    }

    /// Remove a directory: drop it from `new_dirs` (if upper-only), purge
    /// any upper-layer entries under it, and tombstone the directory path
    /// itself if it has a lower counterpart. Descendant views are hidden
    /// by `upper_lookup`/`is_hidden` walking up to this tombstone, rather
    /// than by writing one tombstone per lower-originated descendant.
    pub fn rmdir(&self, rel_path: &str, exists_in_lower: bool) {
        let mut inner = self.inner.write();
        inner.new_dirs.remove(rel_path);
        let prefix = format!("{rel_path}/");
        inner.new_dirs.retain(|d| !d.starts_with(&prefix));
        let stale: Vec<String> = inner
            .upper_files
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect();
        for path in stale {
            inner.upper_files.remove(&path);
        }
        if exists_in_lower {
            inner.tombstones.insert(rel_path.to_string());
        } else {
            inner.tombstones.remove(rel_path);
        }
    }

    /// List everything the upper layer knows about directly under `dir`:
    /// `(added_entries, tombstones)`, where each added entry is `(name,
    /// is_dir)`.
    pub fn list_upper(&self, dir: &str) -> (Vec<(String, bool)>, Vec<String>) {
        let inner = self.inner.read();
        let prefix = if dir.is_empty() { String::new() } else { format!("{dir}/") };
        let direct_child = |path: &str| -> Option<String> {
            let rest = path.strip_prefix(&prefix)?;
            if rest.is_empty() || rest.contains('/') {
                None
            } else {
                Some(rest.to_string())
            }
        };
        let mut added: Vec<(String, bool)> = inner
            .upper_files
            .keys()
            .filter_map(|p| direct_child(p).map(|name| (name, false)))
            .collect();
        added.extend(inner.new_dirs.iter().filter_map(|p| direct_child(p).map(|name| (name, true))));
        let tombstoned: Vec<String> = inner.tombstones.iter().filter_map(|p| direct_child(p)).collect();
        added.sort();
        added.dedup();
        (added, tombstoned)
    }

    /// Whether `rel_path` is a directory recorded only in the upper layer.
    pub fn is_new_dir(&self, rel_path: &str) -> bool {
        self.inner.read().new_dirs.contains(rel_path)
    }

    /// Size in bytes of an upper-layer file's current blob, if present.
    pub fn file_size(&self, rel_path: &str) -> Option<u64> {
        let path = self.inner.read().upper_files.get(rel_path).cloned()?;
        std::fs::metadata(path).ok().map(|m| m.len())
    }

    /// Read the current bytes of an upper file.
    pub fn read_upper(&self, rel_path: &str) -> AgentFenseResult<Vec<u8>> {
        let path = {
            let inner = self.inner.read();
            inner
                .upper_files
                .get(rel_path)
                .cloned()
                .ok_or_else(|| AgentFenseError::not_found(rel_path))?
        };
        Ok(std::fs::read(path)?)
    }

    /// Rename within the upper layer: moves the blob and bookkeeping from
    /// `from` to `to` atomically with respect to other delta-store ops.
    pub fn rename_upper(&self, from: &str, to: &str) -> AgentFenseResult<()> {
        let _guard = self.store_lock.lock();
        let mut inner = self.inner.write();
        if let Some(path) = inner.upper_files.remove(from) {
            let dest = self.blob_path(to);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&path, &dest)?;
            inner.upper_files.insert(to.to_string(), dest);
        }
        inner.tombstones.remove(to);
        Ok(())
    }

    fn write_blob(&self, rel_path: &str, bytes: &[u8]) -> AgentFenseResult<()> {
        let path = self.blob_path(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Mark this store as persistent, skipping scratch-directory cleanup on
    /// drop. Not exercised by the default lifecycle (deltas are ephemeral
    /// per spec §1's non-goals) but mirrors the teacher's `Disk::persistent`
    /// escape hatch for callers embedding the store directly.
    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }
}

impl Drop for DeltaStore {
    fn drop(&mut self) {
        if self.persistent {
            return;
        }
        if self.scratch_dir.exists() {
            if let Err(err) = std::fs::remove_dir_all(&self.scratch_dir) {
                tracing::warn!(scratch_dir = %self.scratch_dir.display(), error = %err, "failed to clean up delta store scratch directory");
            }
        }
    }
}

/// Flatten a relative path into a filename-safe blob name, preserving
/// uniqueness without mirroring the directory tree on disk.
fn sanitize_blob_name(rel: &str) -> String {
    rel.replace('/', "__")
}

/// Whether `rel_path` itself, or any ancestor directory of it, is tombstoned.
fn tombstone_covers(tombstones: &HashSet<String>, rel_path: &str) -> bool {
    if tombstones.contains(rel_path) {
        return true;
    }
    let mut cur = rel_path;
    while let Some((parent, _)) = cur.rsplit_once('/') {
        if tombstones.contains(parent) {
            return true;
        }
        cur = parent;
    }
    false
}

pub type SharedDeltaStore = Arc<DeltaStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_up_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeltaStore::create(dir.path()).unwrap();
        store.copy_up("a.txt", b"hello").unwrap();
        assert_eq!(store.read_upper("a.txt").unwrap(), b"hello");
    }

    #[test]
    fn write_full_truncates_shorter_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeltaStore::create(dir.path()).unwrap();
        store.copy_up("a.txt", b"hello world").unwrap();
        store.write_full("a.txt", b"hi").unwrap();
        assert_eq!(store.read_upper("a.txt").unwrap(), b"hi");
    }

    #[test]
    fn write_full_creates_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeltaStore::create(dir.path()).unwrap();
        store.write_full("new.txt", b"fresh").unwrap();
        assert_eq!(store.read_upper("new.txt").unwrap(), b"fresh");
    }

    #[test]
    fn copy_up_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeltaStore::create(dir.path()).unwrap();
        store.copy_up("a.txt", b"hello").unwrap();
        store.write_at("a.txt", 0, b"HELLO").unwrap();
        store.copy_up("a.txt", b"hello").unwrap();
        assert_eq!(store.read_upper("a.txt").unwrap(), b"HELLO");
    }

    #[test]
    fn unlink_tombstones_lower_originated_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeltaStore::create(dir.path()).unwrap();
        store.unlink("a.txt", true);
        assert_eq!(store.upper_lookup("a.txt"), UpperLookup::Tombstoned);
    }

    #[test]
    fn unlink_clears_upper_only_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeltaStore::create(dir.path()).unwrap();
        store.create("new.txt").unwrap();
        store.unlink("new.txt", false);
        assert_eq!(store.upper_lookup("new.txt"), UpperLookup::Absent);
    }

    #[test]
    fn rmdir_tombstones_upper_originated_descendant() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeltaStore::create(dir.path()).unwrap();
        store.create("secrets/a.txt").unwrap();
        store.rmdir("secrets", true);
        assert_eq!(store.upper_lookup("secrets/a.txt"), UpperLookup::Tombstoned);
        let (added, tombstones) = store.list_upper("");
        assert!(!added.iter().any(|(name, _)| name == "secrets"));
        assert!(tombstones.contains(&"secrets".to_string()));
    }

    #[test]
    fn rmdir_tombstones_lower_only_descendant() {
        // "secrets/original.txt" is never materialized into the upper
        // layer (no `create`/`copy_up`); it only exists in the lower
        // layer. `rmdir` must still hide it.
        let dir = tempfile::tempdir().unwrap();
        let store = DeltaStore::create(dir.path()).unwrap();
        store.rmdir("secrets", true);
        assert_eq!(store.upper_lookup("secrets/original.txt"), UpperLookup::Tombstoned);
        assert!(store.is_hidden("secrets/original.txt"));
        assert!(store.is_hidden("secrets/nested/deeper.txt"));
    }

    #[test]
    fn create_under_removed_directory_is_visible_again() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeltaStore::create(dir.path()).unwrap();
        store.rmdir("secrets", true);
        store.create("secrets/new.txt").unwrap();
        assert!(matches!(store.upper_lookup("secrets/new.txt"), UpperLookup::Present(_)));
        assert!(!store.is_hidden("secrets/new.txt"));
        // A sibling that was never recreated is still hidden.
        assert!(store.is_hidden("secrets/original.txt"));
    }

    #[test]
    fn list_upper_reports_direct_children_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeltaStore::create(dir.path()).unwrap();
        store.create("a/b.txt").unwrap();
        store.create("c.txt").unwrap();
        let (added, _) = store.list_upper("");
        assert!(added.iter().any(|(name, _)| name == "c.txt"));
        assert!(!added.iter().any(|(name, _)| name == "a/b.txt"));
    }

    #[test]
    fn drop_removes_scratch_dir() {
        let dir = tempfile::tempdir().unwrap();
        let scratch;
        {
            let store = DeltaStore::create(dir.path()).unwrap();
            scratch = store.scratch_dir().to_path_buf();
            store.create("x.txt").unwrap();
        }
        assert!(!scratch.exists());
    }
}
