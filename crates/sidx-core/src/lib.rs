//! Contracts shared by the state indexing crates: state identity,
//! subscriptions, the `Indexer` capability, the primary state store seam and
//! the process-local indexer registry.

pub mod indexer;
pub mod registry;
pub mod reindex_contracts;
pub mod state;
pub mod state_store;
pub mod subscription;

pub use indexer::{Indexer, IndexerError, Version};
pub use registry::{IndexerRegistry, RegistryError};
pub use reindex_contracts::{
    IndexerVersions, Job, JobInfo, JobStatus, DEFAULT_BATCH_SIZE, DEFAULT_JOB_TIMEOUT_SECS,
    DEFAULT_MAX_ATTEMPTS,
};
pub use state::{partition_ids, SerializedState, StateBatch, StateErrors, StateId, StatesById};
pub use state_store::{StateStore, StateStoreError};
pub use subscription::{filter_ids, filter_states, matches_any, KeyMatcher, Subscription};
