//! PostgreSQL journal via sqlx.
//!
//! This module is only available when the `sql` feature is enabled.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, Postgres};
use sqlx::{Row, Transaction};

use crate::error::ClusterError;
use crate::hash::journal_shard;
use crate::persistence::{
    persistence_error, JournalStorage, JournalTransaction, StoredEvent, StoredState,
};

const CREATE_STATE_JOURNAL: &str = "CREATE TABLE IF NOT EXISTS state_journal (
    persistence_id TEXT PRIMARY KEY,
    shard INT NOT NULL,
    event_sequence INT NOT NULL,
    state JSONB NOT NULL
)";

const CREATE_EVENT_JOURNAL: &str = "CREATE TABLE IF NOT EXISTS event_journal (
    persistence_id TEXT NOT NULL,
    shard INT NOT NULL,
    sequence INT NOT NULL,
    event JSONB NOT NULL,
    PRIMARY KEY (persistence_id, sequence)
)";

/// PostgreSQL-backed journal.
pub struct SqlJournal {
    pool: PgPool,
    shard_count: u32,
}

impl SqlJournal {
    /// Create a journal over `pool`.
    ///
    /// Call [`migrate()`](Self::migrate) once before use.
    pub fn new(pool: PgPool, shard_count: u32) -> Self {
        Self { pool, shard_count }
    }

    /// Create `state_journal` and `event_journal` if they do not exist.
    pub async fn migrate(&self) -> Result<(), ClusterError> {
        for statement in [CREATE_STATE_JOURNAL, CREATE_EVENT_JOURNAL] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| persistence_error("journal migration failed", e))?;
        }
        Ok(())
    }
}

fn to_column(sequence: i64) -> Result<i32, ClusterError> {
    i32::try_from(sequence).map_err(|e| persistence_error("event sequence out of range", e))
}

fn shard_column(shard: u32) -> i32 {
    // shard < shard_count, which is far below i32::MAX in any sane config
    shard as i32
}

#[async_trait]
impl JournalStorage for SqlJournal {
    async fn begin(
        &self,
        persistence_id: &str,
    ) -> Result<Box<dyn JournalTransaction>, ClusterError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| persistence_error("failed to begin journal transaction", e))?;
        // Serialise writers of the same id, including ones that have no row yet.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(persistence_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| persistence_error("failed to lock persistence id", e))?;
        Ok(Box::new(SqlJournalTransaction {
            persistence_id: persistence_id.to_string(),
            shard: shard_column(journal_shard(persistence_id, self.shard_count)),
            tx,
        }))
    }

    async fn load_state(&self, persistence_id: &str) -> Result<Option<StoredState>, ClusterError> {
        let row = sqlx::query(
            "SELECT state, event_sequence FROM state_journal WHERE persistence_id = $1",
        )
        .bind(persistence_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| persistence_error("state load failed", e))?;
        row.map(|r| read_state(&r)).transpose()
    }

    async fn load_events(&self, persistence_id: &str) -> Result<Vec<StoredEvent>, ClusterError> {
        let rows = sqlx::query(
            "SELECT sequence, event FROM event_journal WHERE persistence_id = $1 ORDER BY sequence ASC",
        )
        .bind(persistence_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| persistence_error("event load failed", e))?;
        rows.iter()
            .map(|r| {
                let sequence: i32 = r
                    .try_get("sequence")
                    .map_err(|e| persistence_error("failed to read 'sequence' column", e))?;
                let event: serde_json::Value = r
                    .try_get("event")
                    .map_err(|e| persistence_error("failed to read 'event' column", e))?;
                Ok(StoredEvent {
                    sequence: sequence as i64,
                    event,
                })
            })
            .collect()
    }
}

fn read_state(row: &sqlx::postgres::PgRow) -> Result<StoredState, ClusterError> {
    let state: serde_json::Value = row
        .try_get("state")
        .map_err(|e| persistence_error("failed to read 'state' column", e))?;
    let sequence: i32 = row
        .try_get("event_sequence")
        .map_err(|e| persistence_error("failed to read 'event_sequence' column", e))?;
    Ok(StoredState {
        state,
        sequence: sequence as i64,
    })
}

struct SqlJournalTransaction {
    persistence_id: String,
    shard: i32,
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl JournalTransaction for SqlJournalTransaction {
    async fn get(&mut self) -> Result<Option<StoredState>, ClusterError> {
        let row = sqlx::query(
            "SELECT state, event_sequence FROM state_journal WHERE persistence_id = $1",
        )
        .bind(&self.persistence_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| persistence_error("state get failed", e))?;
        row.map(|r| read_state(&r)).transpose()
    }

    async fn set(&mut self, state: &serde_json::Value, sequence: i64) -> Result<(), ClusterError> {
        sqlx::query(
            "INSERT INTO state_journal (persistence_id, shard, event_sequence, state)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (persistence_id)
             DO UPDATE SET event_sequence = EXCLUDED.event_sequence, state = EXCLUDED.state",
        )
        .bind(&self.persistence_id)
        .bind(self.shard)
        .bind(to_column(sequence)?)
        .bind(state)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| persistence_error("state set failed", e))?;
        Ok(())
    }

    async fn emit(&mut self, event: &serde_json::Value, sequence: i64) -> Result<(), ClusterError> {
        sqlx::query(
            "INSERT INTO event_journal (persistence_id, shard, sequence, event)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&self.persistence_id)
        .bind(self.shard)
        .bind(to_column(sequence)?)
        .bind(event)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| persistence_error("event emit failed", e))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), ClusterError> {
        self.tx
            .commit()
            .await
            .map_err(|e| persistence_error("journal commit failed", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), ClusterError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| persistence_error("journal rollback failed", e))
    }
}
