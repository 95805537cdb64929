use crate::state::{StateId, StatesById};
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("state store error: {0}")]
    Backend(String),
}

/// Read surface of the primary state store consumed by the indexing core.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetches the current value of each requested ID. IDs with no stored
    /// state are left out of the result.
    async fn get_states(
        &self,
        network_id: &str,
        ids: &[StateId],
    ) -> Result<StatesById, StateStoreError>;

    /// Enumerates every stored state ID, grouped by network.
    async fn get_all_ids(&self) -> Result<BTreeMap<String, Vec<StateId>>, StateStoreError>;
}
