use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of one primary state blob inside a network.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateId {
    #[serde(rename = "type")]
    pub state_type: String,
    pub device_id: String,
}

impl StateId {
    pub fn new(state_type: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            state_type: state_type.into(),
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.state_type, self.device_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedState {
    pub value: Vec<u8>,
    /// Bumped by the primary store on every write of the same ID.
    pub version: u64,
    #[serde(default)]
    pub reporter_id: String,
    #[serde(default)]
    pub time_ms: u64,
}

pub type StatesById = BTreeMap<StateId, SerializedState>;

/// Per-state failures from a single `Index` call, keyed by the failed state.
pub type StateErrors = BTreeMap<StateId, String>;

/// A bounded page of state IDs belonging to one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateBatch {
    pub network_id: String,
    pub ids: Vec<StateId>,
}

/// Splits each network's IDs into pages of at most `page_size` entries.
///
/// Networks are visited in key order and IDs keep their enumeration order.
/// A zero page size is treated as one.
pub fn partition_ids(
    ids_by_network: &BTreeMap<String, Vec<StateId>>,
    page_size: usize,
) -> Vec<StateBatch> {
    let page_size = page_size.max(1);
    let mut batches = Vec::new();
    for (network_id, ids) in ids_by_network {
        for page in ids.chunks(page_size) {
            batches.push(StateBatch {
                network_id: network_id.clone(),
                ids: page.to_vec(),
            });
        }
    }
    batches
}
