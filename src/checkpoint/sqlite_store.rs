//! SQLite implementation of CheckpointStore.

use async_trait::async_trait;
use sqlx::SqlitePool;

use super::{CheckpointError, CheckpointStore, ResumptionState};

/// SQLite-backed checkpoint store.
///
/// One row per run; saving a newer checkpoint for the same run replaces it.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the checkpoints table.
    pub async fn run_migrations(&self) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runworker_checkpoints (
                run_id TEXT PRIMARY KEY,
                attempt_number INTEGER NOT NULL,
                task_id TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_runworker_checkpoints_task
            ON runworker_checkpoints(task_id)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, state: &ResumptionState) -> Result<(), CheckpointError> {
        let encoded = serde_json::to_string(state)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO runworker_checkpoints (run_id, attempt_number, task_id, state)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(run_id) DO UPDATE SET
                attempt_number = excluded.attempt_number,
                state = excluded.state,
                updated_at = datetime('now')
            "#,
        )
        .bind(&state.run_id)
        .bind(state.attempt_number as i64)
        .bind(&state.task_id)
        .bind(encoded)
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<ResumptionState>, CheckpointError> {
        let row: Option<String> = sqlx::query_scalar(
            r#"
            SELECT state FROM runworker_checkpoints
            WHERE run_id = ?
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        row.map(|encoded| {
            serde_json::from_str(&encoded).map_err(|e| CheckpointError::Serialization(e.to_string()))
        })
        .transpose()
    }

    async fn remove(&self, run_id: &str) -> Result<(), CheckpointError> {
        sqlx::query("DELETE FROM runworker_checkpoints WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::tests::sample_state;

    async fn setup() -> SqliteCheckpointStore {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        let store = SqliteCheckpointStore::new(pool);
        store.run_migrations().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_save_replaces_previous_checkpoint() {
        let store = setup().await;
        let mut state = sample_state("run_1");
        store.save(&state).await.unwrap();

        state.usage_ms = 900;
        state.complete_pending(serde_json::json!(null));
        store.save(&state).await.unwrap();

        let loaded = store.load("run_1").await.unwrap().unwrap();
        assert_eq!(loaded.usage_ms, 900);
        assert!(loaded.pending_wait.is_none());
    }

    #[tokio::test]
    async fn test_remove_forgets_run() {
        let store = setup().await;
        store.save(&sample_state("run_1")).await.unwrap();
        store.remove("run_1").await.unwrap();
        assert!(store.load("run_1").await.unwrap().is_none());
    }
}
