use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::error::ClusterError;
use crate::hash::journal_shard;
use crate::persistence::{JournalStorage, JournalTransaction, StoredEvent, StoredState};

/// In-memory journal for tests and single-process deployments.
///
/// Mirrors the relational layout: one state row per id and one event row
/// per `(id, sequence)`, each tagged with its storage shard.
#[derive(Clone)]
pub struct MemoryJournal {
    shard_count: u32,
    tables: Arc<Mutex<Tables>>,
    locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Default)]
struct Tables {
    states: HashMap<String, StateRow>,
    events: BTreeMap<(String, i64), EventRow>,
}

struct StateRow {
    shard: u32,
    sequence: i64,
    state: serde_json::Value,
}

struct EventRow {
    shard: u32,
    event: serde_json::Value,
}

impl MemoryJournal {
    pub fn new(shard_count: u32) -> Self {
        Self {
            shard_count,
            tables: Arc::new(Mutex::new(Tables::default())),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Storage shard recorded for an id's state row.
    pub fn shard_of(&self, persistence_id: &str) -> Option<u32> {
        self.tables
            .lock()
            .states
            .get(persistence_id)
            .map(|row| row.shard)
    }

    /// Storage shards recorded on an id's event rows.
    pub fn event_shards_of(&self, persistence_id: &str) -> Vec<u32> {
        let tables = self.tables.lock();
        tables
            .events
            .range((persistence_id.to_string(), i64::MIN)..=(persistence_id.to_string(), i64::MAX))
            .map(|(_, row)| row.shard)
            .collect()
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new(16)
    }
}

#[async_trait]
impl JournalStorage for MemoryJournal {
    async fn begin(
        &self,
        persistence_id: &str,
    ) -> Result<Box<dyn JournalTransaction>, ClusterError> {
        let lock = self
            .locks
            .entry(persistence_id.to_string())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            persistence_id: persistence_id.to_string(),
            shard: journal_shard(persistence_id, self.shard_count),
            tables: Arc::clone(&self.tables),
            state: None,
            events: Vec::new(),
            _guard: guard,
        }))
    }

    async fn load_state(&self, persistence_id: &str) -> Result<Option<StoredState>, ClusterError> {
        Ok(self
            .tables
            .lock()
            .states
            .get(persistence_id)
            .map(|row| StoredState {
                state: row.state.clone(),
                sequence: row.sequence,
            }))
    }

    async fn load_events(&self, persistence_id: &str) -> Result<Vec<StoredEvent>, ClusterError> {
        let tables = self.tables.lock();
        Ok(tables
            .events
            .range((persistence_id.to_string(), i64::MIN)..=(persistence_id.to_string(), i64::MAX))
            .map(|((_, sequence), row)| StoredEvent {
                sequence: *sequence,
                event: row.event.clone(),
            })
            .collect())
    }
}

struct MemoryTransaction {
    persistence_id: String,
    shard: u32,
    tables: Arc<Mutex<Tables>>,
    state: Option<StoredState>,
    events: Vec<StoredEvent>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl JournalTransaction for MemoryTransaction {
    async fn get(&mut self) -> Result<Option<StoredState>, ClusterError> {
        if let Some(state) = &self.state {
            return Ok(Some(state.clone()));
        }
        Ok(self
            .tables
            .lock()
            .states
            .get(&self.persistence_id)
            .map(|row| StoredState {
                state: row.state.clone(),
                sequence: row.sequence,
            }))
    }

    async fn set(&mut self, state: &serde_json::Value, sequence: i64) -> Result<(), ClusterError> {
        self.state = Some(StoredState {
            state: state.clone(),
            sequence,
        });
        Ok(())
    }

    async fn emit(&mut self, event: &serde_json::Value, sequence: i64) -> Result<(), ClusterError> {
        let committed = self
            .tables
            .lock()
            .events
            .contains_key(&(self.persistence_id.clone(), sequence));
        if committed || self.events.iter().any(|e| e.sequence == sequence) {
            return Err(ClusterError::Persistence {
                reason: format!(
                    "event {sequence} already exists for {}",
                    self.persistence_id
                ),
                source: None,
            });
        }
        self.events.push(StoredEvent {
            sequence,
            event: event.clone(),
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), ClusterError> {
        let this = *self;
        let mut tables = this.tables.lock();
        if let Some(state) = this.state {
            tables.states.insert(
                this.persistence_id.clone(),
                StateRow {
                    shard: this.shard,
                    sequence: state.sequence,
                    state: state.state,
                },
            );
        }
        for event in this.events {
            tables.events.insert(
                (this.persistence_id.clone(), event.sequence),
                EventRow {
                    shard: this.shard,
                    event: event.event,
                },
            );
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), ClusterError> {
        tracing::debug!(
            persistence_id = %self.persistence_id,
            discarded_events = self.events.len(),
            "journal transaction rolled back"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn commit_makes_writes_visible() {
        let journal = MemoryJournal::new(16);
        let mut tx = journal.begin("demo(users/mike)").await.unwrap();
        assert!(tx.get().await.unwrap().is_none());
        tx.set(&json!({"id": "mike"}), 1).await.unwrap();
        tx.emit(&json!("created"), 1).await.unwrap();
        assert_eq!(tx.get().await.unwrap().unwrap().sequence, 1);
        assert!(journal.load_state("demo(users/mike)").await.unwrap().is_none());

        tx.commit().await.unwrap();
        let state = journal.load_state("demo(users/mike)").await.unwrap().unwrap();
        assert_eq!(state.sequence, 1);
        assert_eq!(state.state, json!({"id": "mike"}));
        assert_eq!(journal.load_events("demo(users/mike)").await.unwrap().len(), 1);
        assert_eq!(
            journal.shard_of("demo(users/mike)"),
            Some(journal_shard("demo(users/mike)", 16))
        );
    }

    #[tokio::test]
    async fn rollback_and_drop_discard_writes() {
        let journal = MemoryJournal::default();
        let mut tx = journal.begin("a").await.unwrap();
        tx.set(&json!(1), 1).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = journal.begin("a").await.unwrap();
        tx.emit(&json!(1), 1).await.unwrap();
        drop(tx);

        assert!(journal.load_state("a").await.unwrap().is_none());
        assert!(journal.load_events("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_event_sequence_is_rejected() {
        let journal = MemoryJournal::default();
        let mut tx = journal.begin("a").await.unwrap();
        tx.emit(&json!(1), 1).await.unwrap();
        assert!(tx.emit(&json!(2), 1).await.is_err());
        tx.commit().await.unwrap();

        let mut tx = journal.begin("a").await.unwrap();
        let err = tx.emit(&json!(3), 1).await.unwrap_err();
        assert!(matches!(err, ClusterError::Persistence { .. }));
    }

    #[tokio::test]
    async fn events_are_scoped_to_their_id() {
        let journal = MemoryJournal::default();
        for id in ["a", "ab", "b"] {
            let mut tx = journal.begin(id).await.unwrap();
            tx.emit(&json!(id), 1).await.unwrap();
            tx.emit(&json!(id), 2).await.unwrap();
            tx.commit().await.unwrap();
        }
        let events = journal.load_events("a").await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event == json!("a")));
    }

    #[tokio::test]
    async fn transactions_on_one_id_are_serialised() {
        let journal = MemoryJournal::default();
        let first = journal.begin("a").await.unwrap();

        let second = {
            let journal = journal.clone();
            tokio::spawn(async move { journal.begin("a").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        // Other ids are not blocked.
        journal.begin("b").await.unwrap();

        first.commit().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .expect("second transaction should start")
            .unwrap()
            .unwrap();
    }
}
