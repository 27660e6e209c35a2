//! SQLite 检查点存储（嵌入式文件，sqlx）
//!
//! 单表 checkpoints，主键 (session_id, seq)。append 用一条
//! `INSERT ... SELECT COALESCE(MAX(seq) + 1, 0) ... RETURNING seq` 分配序号，
//! SQLite 的写锁保证同一会话的序号不会重复。每个操作从连接池取一个连接，结束即归还。

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::checkpoint::record::{decode_state, encode_messages};
use crate::checkpoint::{to_i64, to_u64, Checkpoint, CheckpointStore, CheckpointSummary, StoreError};
use crate::core::{ConversationState, NextAction};

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// 打开（必要时创建）数据库文件并建表
    pub async fn open(db_path: impl AsRef<Path>, max_connections: u32) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Config(format!("{}: {e}", parent.display())))?;
        }
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.setup().await?;
        tracing::debug!(path = %db_path.display(), "SQLite checkpoint store opened");
        Ok(store)
    }

    /// 建表（幂等）
    pub async fn setup(&self) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                next_action TEXT NOT NULL,
                messages TEXT NOT NULL,
                message_count INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (session_id, seq)
            )",
        )
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    fn checkpoint_from_row(session_id: &str, row: &SqliteRow) -> Result<Checkpoint, StoreError> {
        let seq: i64 = row.try_get("seq")?;
        let next_action: String = row.try_get("next_action")?;
        let messages: String = row.try_get("messages")?;
        let created_at: String = row.try_get("created_at")?;

        let state = decode_state(serde_json::from_str(&messages)?, &next_action)?;
        Ok(Checkpoint {
            session_id: session_id.to_string(),
            sequence_number: to_u64(seq)?,
            state,
            created_at: parse_timestamp(&created_at)?,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad created_at {s:?}: {e}")))
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn append(&self, session_id: &str, state: &ConversationState) -> Result<u64, StoreError> {
        let messages = encode_messages(&state.messages)?.to_string();
        let now = Utc::now().to_rfc3339();

        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            "INSERT INTO checkpoints (session_id, seq, next_action, messages, message_count, created_at)
             SELECT ?, COALESCE(MAX(seq) + 1, 0), ?, ?, ?, ?
             FROM checkpoints WHERE session_id = ?
             RETURNING seq",
        )
        .bind(session_id)
        .bind(state.next_action.as_str())
        .bind(&messages)
        .bind(state.messages.len() as i64)
        .bind(&now)
        .bind(session_id)
        .fetch_one(&mut *conn)
        .await?;

        let seq: i64 = row.try_get("seq")?;
        to_u64(seq)
    }

    async fn latest(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            "SELECT seq, next_action, messages, created_at FROM checkpoints
             WHERE session_id = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&mut *conn)
        .await?;
        row.map(|r| Self::checkpoint_from_row(session_id, &r))
            .transpose()
    }

    async fn at(
        &self,
        session_id: &str,
        sequence_number: u64,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            "SELECT seq, next_action, messages, created_at FROM checkpoints
             WHERE session_id = ? AND seq = ?",
        )
        .bind(session_id)
        .bind(to_i64(sequence_number)?)
        .fetch_optional(&mut *conn)
        .await?;
        row.map(|r| Self::checkpoint_from_row(session_id, &r))
            .transpose()
    }

    async fn list_sessions(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query("SELECT DISTINCT session_id FROM checkpoints")
            .fetch_all(&mut *conn)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("session_id").map_err(StoreError::from))
            .collect()
    }

    async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<CheckpointSummary>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            "SELECT seq, next_action, message_count, created_at FROM checkpoints
             WHERE session_id = ? ORDER BY seq ASC",
        )
        .bind(session_id)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| -> Result<CheckpointSummary, StoreError> {
                let seq: i64 = row.try_get("seq")?;
                let next_action: String = row.try_get("next_action")?;
                let message_count: i64 = row.try_get("message_count")?;
                let created_at: String = row.try_get("created_at")?;
                Ok(CheckpointSummary {
                    sequence_number: to_u64(seq)?,
                    next_action: next_action.parse::<NextAction>().map_err(StoreError::Corrupt)?,
                    message_count: usize::try_from(message_count)
                        .map_err(|_| StoreError::Corrupt("negative message_count".to_string()))?,
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect()
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reopen_keeps_lineage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("checkpoints.db");
        let state = ConversationState::seed(vec![], "hi");

        {
            let store = SqliteCheckpointStore::open(&path, 2).await.unwrap();
            assert_eq!(store.append("s1", &state).await.unwrap(), 0);
            assert_eq!(store.append("s1", &state).await.unwrap(), 1);
        }

        let store = SqliteCheckpointStore::open(&path, 2).await.unwrap();
        let latest = store.latest("s1").await.unwrap().unwrap();
        assert_eq!(latest.sequence_number, 1);
        assert_eq!(latest.state, state);
        assert_eq!(store.append("s1", &state).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_row_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = SqliteCheckpointStore::open(dir.path().join("c.db"), 1)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO checkpoints (session_id, seq, next_action, messages, message_count, created_at)
             VALUES ('bad', 0, 'run_tools', '[{\"role\":\"user\",\"content\":\"x\"}]', 1, '2024-01-01T00:00:00Z')",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let err = store.latest("bad").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}
