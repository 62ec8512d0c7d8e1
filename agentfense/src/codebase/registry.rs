//! In-process index of codebases and their lower-layer roots (spec §2, §9
//! "cyclic references"): sandboxes reference codebases by id only; a
//! refcount on the registry entry blocks deletion while any sandbox is
//! still bound to it.

use super::source::CodebaseSource;
use crate::errors::{AgentFenseError, AgentFenseResult};
use crate::ids::CodebaseId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Advisory metadata describing a codebase (spec §6 persisted-state record).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CodebaseMetadata {
    pub id: CodebaseId,
    pub name: String,
    pub owner_id: String,
    pub size: u64,
    pub file_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A codebase entry: its metadata, its lower-layer source, and a live
/// reference count of sandboxes currently bound to it.
pub struct Codebase {
    metadata: CodebaseMetadata,
    source: Arc<dyn CodebaseSource>,
    refcount: AtomicU64,
}

impl Codebase {
    pub fn metadata(&self) -> &CodebaseMetadata {
        &self.metadata
    }

    pub fn source(&self) -> &Arc<dyn CodebaseSource> {
        &self.source
    }

    pub fn live_sandboxes(&self) -> u64 {
        self.refcount.load(Ordering::SeqCst)
    }

    fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.refcount.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory registry of codebases. Read-heavy, so backed by a concurrent
/// map (`dashmap`, as the wider retrieval pack uses for this shape of
/// registry) rather than a single `RwLock<HashMap<_>>`.
#[derive(Default)]
pub struct CodebaseRegistry {
    codebases: DashMap<CodebaseId, Arc<Codebase>>,
}

impl CodebaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, name: String, owner_id: String, source: Arc<dyn CodebaseSource>) -> Arc<Codebase> {
        let now = Utc::now();
        let id = CodebaseId::new();
        let codebase = Arc::new(Codebase {
            metadata: CodebaseMetadata {
                id: id.clone(),
                name,
                owner_id,
                size: 0,
                file_count: 0,
                created_at: now,
                updated_at: now,
            },
            source,
            refcount: AtomicU64::new(0),
        });
        self.codebases.insert(id.clone(), codebase.clone());
        tracing::debug!(codebase_id = %id, "codebase registered");
        codebase
    }

    pub fn get(&self, id: &CodebaseId) -> AgentFenseResult<Arc<Codebase>> {
        self.codebases
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AgentFenseError::not_found(id.to_string()))
    }

    pub fn list(&self) -> Vec<CodebaseMetadata> {
        self.codebases.iter().map(|entry| entry.value().metadata().clone()).collect()
    }

    /// Bind a sandbox to a codebase, incrementing its refcount. Returns the
    /// codebase handle so the lifecycle manager can build an overlay from it.
    pub fn acquire(&self, id: &CodebaseId) -> AgentFenseResult<Arc<Codebase>> {
        let codebase = self.get(id)?;
        codebase.acquire();
        Ok(codebase)
    }

    /// Release a sandbox's binding to a codebase.
    pub fn release(&self, id: &CodebaseId) {
        if let Some(entry) = self.codebases.get(id) {
            entry.value().release();
        }
    }

    /// Delete a codebase, refusing while any sandbox still references it.
    pub fn delete(&self, id: &CodebaseId) -> AgentFenseResult<()> {
        let codebase = self.get(id)?;
        if codebase.live_sandboxes() > 0 {
            return Err(AgentFenseError::InvalidStatus(format!(
                "codebase {id} still referenced by {} live sandbox(es)",
                codebase.live_sandboxes()
            )));
        }
        self.codebases.remove(id);
        tracing::debug!(codebase_id = %id, "codebase deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codebase::source::InMemoryCodebaseStore;

    #[test]
    fn acquire_blocks_delete_until_released() {
        let registry = CodebaseRegistry::new();
        let codebase = registry.create("demo".into(), "owner".into(), Arc::new(InMemoryCodebaseStore::new()));
        let id = codebase.metadata().id.clone();
        registry.acquire(&id).unwrap();
        assert!(registry.delete(&id).is_err());
        registry.release(&id);
        assert!(registry.delete(&id).is_ok());
    }

    #[test]
    fn get_missing_codebase_not_found() {
        let registry = CodebaseRegistry::new();
        assert!(matches!(registry.get(&CodebaseId::new()), Err(AgentFenseError::NotFound(_))));
    }
}
