//! Coordination of derived state indexers: the reindex loop driven by the
//! persisted job queue, and the online fan-out of freshly written state.

mod dispatcher;
pub mod metrics;
mod reindexer;

pub use dispatcher::{DispatchConfig, DispatchError, DispatchReport, OnlineDispatcher};
pub use reindexer::{ReindexError, Reindexer, ReindexerConfig};
