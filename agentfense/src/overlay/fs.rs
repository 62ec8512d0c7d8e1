//! The overlay filesystem: composes the lower (codebase) layer, the upper
//! (delta) layer, and the permission engine into the single mount presented
//! to a sandbox's runtime (spec §4.4).

use super::path::sanitize_rel_path;
use crate::codebase::Codebase;
use crate::delta::{DeltaStore, UpperLookup};
use crate::errors::{AgentFenseError, AgentFenseResult};
use crate::permissions::{Operation, Permission, PermissionEngine};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Result of a `stat` call: type, size, and the permission it was resolved
/// under (so callers can tell a degraded `view` stat from a full one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub is_dir: bool,
    pub size: u64,
    pub permission: Permission,
}

impl Stat {
    /// Mode bits presented to the sandbox: `view` entries deny read
    /// (`0o111` for directories, `0o000` for files), matching spec §4.4.
    pub fn mode(&self) -> u32 {
        match (self.permission, self.is_dir) {
            (Permission::View, true) => 0o111,
            (Permission::View, false) => 0o000,
            (_, true) => 0o755,
            (Permission::Write, false) => 0o644,
            (_, false) => 0o444,
        }
    }
}

/// One entry returned by [`OverlayFilesystem::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub permission: Permission,
}

/// The composed view of a codebase's lower layer, a sandbox's upper delta,
/// and the sandbox's permission engine.
pub struct OverlayFilesystem {
    codebase: Arc<Codebase>,
    delta: Arc<DeltaStore>,
    engine: Arc<PermissionEngine>,
}

impl OverlayFilesystem {
    pub fn new(codebase: Arc<Codebase>, delta: Arc<DeltaStore>, engine: Arc<PermissionEngine>) -> Self {
        Self { codebase, delta, engine }
    }

    async fn lower_exists(&self, rel: &str) -> bool {
        self.codebase.source().lower_exists(rel).await
    }

    /// Read the full contents of a file.
    pub async fn read(&self, path: &str) -> AgentFenseResult<Vec<u8>> {
        let rel = sanitize_rel_path(path)?;
        self.engine.check(&rel, Operation::ReadBytes)?;
        match self.delta.upper_lookup(&rel) {
            UpperLookup::Tombstoned => Err(AgentFenseError::not_found(rel)),
            UpperLookup::Present(_) => self.delta.read_upper(&rel),
            UpperLookup::Absent => self.codebase.source().lower_read(&rel).await,
        }
    }

    /// Write (and copy-up if needed) bytes at `offset`.
    pub async fn write(&self, path: &str, offset: u64, bytes: &[u8]) -> AgentFenseResult<()> {
        let rel = sanitize_rel_path(path)?;
        self.engine.check(&rel, Operation::Write)?;
        match self.delta.upper_lookup(&rel) {
            UpperLookup::Present(_) => {}
            UpperLookup::Tombstoned => self.delta.create(&rel)?,
            UpperLookup::Absent => {
                if self.lower_exists(&rel).await {
                    let current = self.codebase.source().lower_read(&rel).await.unwrap_or_default();
                    self.delta.copy_up(&rel, &current)?;
                } else {
                    self.delta.create(&rel)?;
                }
            }
        }
        self.delta.write_at(&rel, offset, bytes)
    }

    /// Replace a file's entire contents, bypassing copy-up (the caller
    /// already has the full desired bytes, e.g. the mount reconciler).
    pub async fn write_full(&self, path: &str, bytes: &[u8]) -> AgentFenseResult<()> {
        let rel = sanitize_rel_path(path)?;
        self.engine.check(&rel, Operation::Write)?;
        self.delta.write_full(&rel, bytes)
    }

    /// Create an empty file, failing if it is already visible.
    pub async fn create(&self, path: &str) -> AgentFenseResult<()> {
        let rel = sanitize_rel_path(path)?;
        self.engine.check(&rel, Operation::Write)?;
        self.delta.create(&rel)
    }

    /// Delete a file or directory.
    pub async fn unlink(&self, path: &str) -> AgentFenseResult<()> {
        let rel = sanitize_rel_path(path)?;
        self.engine.check(&rel, Operation::Delete)?;
        let lower_has = self.lower_exists(&rel).await;
        self.delta.unlink(&rel, lower_has);
        tracing::debug!(path = %rel, "unlinked");
        Ok(())
    }

    /// Create a directory in the upper layer.
    pub async fn mkdir(&self, path: &str) -> AgentFenseResult<()> {
        let rel = sanitize_rel_path(path)?;
        self.engine.check(&rel, Operation::Write)?;
        self.delta.mkdir(&rel);
        Ok(())
    }

    /// Remove a directory and tombstone its descendants.
    ///
    /// Requires `write` only on the directory itself, not on every
    /// descendant (the permissive, POSIX `rmdir`/`rm -r`-like reading of
    /// the open question in spec §9).
    pub async fn rmdir(&self, path: &str) -> AgentFenseResult<()> {
        let rel = sanitize_rel_path(path)?;
        self.engine.check(&rel, Operation::Delete)?;
        let lower_has = self.lower_exists(&rel).await;
        self.delta.rmdir(&rel, lower_has);
        Ok(())
    }

    /// Stat a path: type, size, and resolved permission.
    ///
    /// For `view` entries, size is reported as zero and callers should use
    /// [`Stat::mode`] to see the access-denying mode bits — "exists / stat
    /// (via parent listing)" in spec §4.2's operation table, implemented
    /// here by consulting the parent directory's listing rather than a
    /// direct per-path stat on the lower source.
    pub async fn stat(&self, path: &str) -> AgentFenseResult<Stat> {
        let rel = sanitize_rel_path(path)?;
        self.engine.check(&rel, Operation::Stat)?;
        let permission = self.engine.effective(&rel);
        if rel.is_empty() {
            return Ok(Stat { is_dir: true, size: 0, permission });
        }
        match self.delta.upper_lookup(&rel) {
            UpperLookup::Tombstoned => Err(AgentFenseError::not_found(rel)),
            UpperLookup::Present(_) => {
                let size = if permission == Permission::View { 0 } else { self.delta.file_size(&rel).unwrap_or(0) };
                Ok(Stat { is_dir: false, size, permission })
            }
            UpperLookup::Absent => {
                if self.delta.is_new_dir(&rel) {
                    return Ok(Stat { is_dir: true, size: 0, permission });
                }
                match self.lower_stat(&rel).await {
                    Some((is_dir, size)) => {
                        let size = if permission == Permission::View { 0 } else { size };
                        Ok(Stat { is_dir, size, permission })
                    }
                    None => Err(AgentFenseError::not_found(rel)),
                }
            }
        }
    }

    async fn lower_stat(&self, rel: &str) -> Option<(bool, u64)> {
        let parent = parent_of(rel);
        let name = file_name(rel);
        let entries = self.codebase.source().lower_list(&parent).await.ok()?;
        entries
            .into_iter()
            .find(|entry| file_name(&entry.rel_path) == name)
            .map(|entry| (entry.is_dir, entry.size))
    }

    /// List the union of lower and upper entries directly under `dir`,
    /// filtered and annotated by effective permission (spec §4.4
    /// "Directory listing").
    pub async fn list(&self, dir: &str) -> AgentFenseResult<Vec<DirEntry>> {
        let rel = sanitize_rel_path(dir)?;
        self.engine.check(&rel, Operation::ListDirectory)?;
        if !rel.is_empty() && self.delta.is_hidden(&rel) {
            return Err(AgentFenseError::not_found(rel));
        }
        let lower_entries = self.codebase.source().lower_list(&rel).await.unwrap_or_default();
        let (added, tombstoned) = self.delta.list_upper(&rel);

        let mut by_name: BTreeMap<String, (bool, u64)> = BTreeMap::new();
        for entry in lower_entries {
            let name = file_name(&entry.rel_path);
            if tombstoned.contains(&name) {
                continue;
            }
            by_name.insert(name, (entry.is_dir, entry.size));
        }
        for (name, is_dir) in added {
            let full = join_rel(&rel, &name);
            let size = if is_dir { 0 } else { self.delta.file_size(&full).unwrap_or(0) };
            by_name.insert(name, (is_dir, size));
        }

        let mut out = Vec::with_capacity(by_name.len());
        for (name, (is_dir, size)) in by_name {
            let full = join_rel(&rel, &name);
            let permission = self.engine.effective(&full);
            if permission == Permission::None {
                continue;
            }
            let visible_size = if permission == Permission::View { 0 } else { size };
            out.push(DirEntry { name, is_dir, size: visible_size, permission });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Rename `from` to `to`. Destination-write permission is checked
    /// before source-write (spec §4.4), and a `view`-only source is
    /// refused as `permission_denied` rather than `not_found` (spec §9
    /// open question, resolved in favor of not leaking visibility).
    pub async fn rename(&self, from: &str, to: &str) -> AgentFenseResult<()> {
        let from_rel = sanitize_rel_path(from)?;
        let to_rel = sanitize_rel_path(to)?;
        self.engine.check(&to_rel, Operation::RenameDestination)?;
        self.engine.check(&from_rel, Operation::RenameSource)?;

        let bytes = match self.delta.upper_lookup(&from_rel) {
            UpperLookup::Tombstoned => return Err(AgentFenseError::not_found(from_rel)),
            UpperLookup::Present(_) => self.delta.read_upper(&from_rel)?,
            UpperLookup::Absent => {
                if self.lower_exists(&from_rel).await {
                    self.codebase.source().lower_read(&from_rel).await?
                } else {
                    return Err(AgentFenseError::not_found(from_rel));
                }
            }
        };
        self.delta.create(&to_rel)?;
        self.delta.write_at(&to_rel, 0, &bytes)?;
        let lower_has_from = self.lower_exists(&from_rel).await;
        self.delta.unlink(&from_rel, lower_has_from);
        tracing::debug!(from = %from_rel, to = %to_rel, "renamed");
        Ok(())
    }
}

fn file_name(rel: &str) -> String {
    rel.rsplit('/').next().unwrap_or(rel).to_string()
}

fn parent_of(rel: &str) -> String {
    match rel.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    }
}

fn join_rel(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}
