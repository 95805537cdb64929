use crate::indexer::{Indexer, Version};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("indexer {0} already registered")]
    Duplicate(String),
    #[error("indexer {0} not found")]
    NotFound(String),
    #[error("indexer id must not be empty")]
    EmptyId,
    #[error("indexer {0} declares version 0; versions must be positive")]
    ZeroVersion(String),
}

/// Process-local set of known indexers, keyed by ID.
///
/// Constructed once at startup and shared by reference with the reindexer,
/// the online dispatcher and the job store.
#[derive(Default)]
pub struct IndexerRegistry {
    indexers: RwLock<BTreeMap<String, Arc<dyn Indexer>>>,
    generation: AtomicU64,
}

impl IndexerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers all indexers or none of them.
    pub fn register_indexers(&self, batch: Vec<Arc<dyn Indexer>>) -> Result<(), RegistryError> {
        let mut indexers = self.write();

        let mut staged = BTreeMap::new();
        for indexer in batch {
            let id = indexer.id().to_string();
            if id.is_empty() {
                return Err(RegistryError::EmptyId);
            }
            if indexer.version().is_zero() {
                return Err(RegistryError::ZeroVersion(id));
            }
            if indexers.contains_key(&id) || staged.contains_key(&id) {
                return Err(RegistryError::Duplicate(id));
            }
            staged.insert(id, indexer);
        }

        if staged.is_empty() {
            return Ok(());
        }
        for (id, indexer) in staged {
            info!(event = "indexer_registered", indexer_id = %id, version = %indexer.version());
            indexers.insert(id, indexer);
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn deregister_indexer(&self, id: &str) -> Result<Arc<dyn Indexer>, RegistryError> {
        let removed = self
            .write()
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!(event = "indexer_deregistered", indexer_id = %id);
        Ok(removed)
    }

    pub fn get_indexers(&self) -> Vec<Arc<dyn Indexer>> {
        self.read().values().cloned().collect()
    }

    pub fn get_indexer(&self, id: &str) -> Result<Arc<dyn Indexer>, RegistryError> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Indexers with at least one subscription to `state_type`.
    pub fn get_indexers_for_state(&self, state_type: &str) -> Vec<Arc<dyn Indexer>> {
        self.read()
            .values()
            .filter(|indexer| {
                indexer
                    .subscriptions()
                    .iter()
                    .any(|sub| sub.state_type == state_type)
            })
            .cloned()
            .collect()
    }

    /// Versions currently declared by the registered indexers.
    pub fn desired_versions(&self) -> BTreeMap<String, Version> {
        self.read()
            .iter()
            .map(|(id, indexer)| (id.clone(), indexer.version()))
            .collect()
    }

    /// Bumped on every successful mutation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<dyn Indexer>>> {
        self.indexers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<dyn Indexer>>> {
        self.indexers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
