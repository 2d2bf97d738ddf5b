//! Event-sourced journal storage.
//!
//! A journal keeps, per persistence id, the latest state snapshot with the
//! sequence number of the last applied event, and the ordered event log.
//! All writes of one message go through a single [`JournalTransaction`].

pub mod memory;
pub mod transactional;

#[cfg(feature = "sql")]
pub mod sql;

use async_trait::async_trait;

use crate::error::ClusterError;

/// Latest persisted state of an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredState {
    pub state: serde_json::Value,
    /// Sequence of the last event applied to `state`. Zero before any event.
    pub sequence: i64,
}

/// One journal event.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub sequence: i64,
    pub event: serde_json::Value,
}

/// Backend holding state and event journals.
#[async_trait]
pub trait JournalStorage: Send + Sync {
    /// Open a transaction scoped to one persistence id.
    ///
    /// Transactions on the same id are serialised.
    async fn begin(
        &self,
        persistence_id: &str,
    ) -> Result<Box<dyn JournalTransaction>, ClusterError>;

    /// Committed state of an id.
    async fn load_state(&self, persistence_id: &str) -> Result<Option<StoredState>, ClusterError>;

    /// Committed events of an id, ordered by sequence.
    async fn load_events(&self, persistence_id: &str) -> Result<Vec<StoredEvent>, ClusterError>;
}

/// Writes against one persistence id that become visible together on commit.
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait JournalTransaction: Send {
    /// State as seen by this transaction, including its own uncommitted write.
    async fn get(&mut self) -> Result<Option<StoredState>, ClusterError>;

    /// Upsert the state snapshot.
    async fn set(&mut self, state: &serde_json::Value, sequence: i64) -> Result<(), ClusterError>;

    /// Append an event. A sequence that already exists is an error.
    async fn emit(&mut self, event: &serde_json::Value, sequence: i64) -> Result<(), ClusterError>;

    async fn commit(self: Box<Self>) -> Result<(), ClusterError>;

    async fn rollback(self: Box<Self>) -> Result<(), ClusterError>;
}

pub(crate) fn persistence_error(
    context: &str,
    e: impl std::error::Error + Send + Sync + 'static,
) -> ClusterError {
    ClusterError::Persistence {
        reason: format!("{context}: {e}"),
        source: Some(Box::new(e)),
    }
}
