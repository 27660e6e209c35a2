//! PostgreSQL 检查点存储（网络关系库，sqlx）
//!
//! 表结构与 SQLite 后端一致，messages 列为 JSONB、created_at 为 TIMESTAMPTZ。
//! append 在事务内先取 `pg_advisory_xact_lock(hashtext(session_id))`，
//! 同一会话的序号分配因此串行化；事务提交或回滚时锁自动释放。

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::checkpoint::record::{decode_state, encode_messages};
use crate::checkpoint::{to_i64, to_u64, Checkpoint, CheckpointStore, CheckpointSummary, StoreError};
use crate::config::CheckpointSection;
use crate::core::{ConversationState, NextAction};

const DEFAULT_TABLE: &str = "waypoint_checkpoints";

pub struct PostgresCheckpointStore {
    pool: PgPool,
    table: String,
}

/// postgres_url 优先；否则用 [checkpoint.postgres] 分项参数
pub fn connect_options(section: &CheckpointSection) -> Result<PgConnectOptions, StoreError> {
    if let Some(url) = &section.postgres_url {
        return Ok(url.parse::<PgConnectOptions>()?);
    }
    let p = &section.postgres;
    let mut options = PgConnectOptions::new()
        .host(&p.host)
        .port(p.port)
        .database(&p.database)
        .username(&p.user);
    if let Some(password) = &p.password {
        options = options.password(password);
    }
    Ok(options)
}

impl PostgresCheckpointStore {
    /// 连接并建表
    pub async fn connect(options: PgConnectOptions, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        let store = Self::with_table(pool, DEFAULT_TABLE)?;
        store.setup().await?;
        Ok(store)
    }

    /// 使用已有连接池与自定义表名（测试中用来隔离）；不自动建表
    pub fn with_table(pool: PgPool, table: impl Into<String>) -> Result<Self, StoreError> {
        let table = table.into();
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::Config(format!("invalid table name: {table:?}")));
        }
        Ok(Self { pool, table })
    }

    /// 建表（幂等）
    pub async fn setup(&self) -> Result<(), StoreError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                session_id    TEXT NOT NULL,
                seq           BIGINT NOT NULL,
                next_action   TEXT NOT NULL,
                messages      JSONB NOT NULL,
                message_count INTEGER NOT NULL,
                created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (session_id, seq)
            )",
            table = self.table
        );
        let mut conn = self.pool.acquire().await?;
        sqlx::query(&sql).execute(&mut *conn).await?;
        Ok(())
    }

    fn checkpoint_from_row(session_id: &str, row: &PgRow) -> Result<Checkpoint, StoreError> {
        let seq: i64 = row.try_get("seq")?;
        let next_action: String = row.try_get("next_action")?;
        let messages: Value = row.try_get("messages")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        Ok(Checkpoint {
            session_id: session_id.to_string(),
            sequence_number: to_u64(seq)?,
            state: decode_state(messages, &next_action)?,
            created_at,
        })
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn append(&self, session_id: &str, state: &ConversationState) -> Result<u64, StoreError> {
        let messages = encode_messages(&state.messages)?;
        let message_count = i32::try_from(state.messages.len())
            .map_err(|_| StoreError::Corrupt("transcript too long".to_string()))?;

        // 未提交的事务在 drop 时回滚
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            "INSERT INTO {table} (session_id, seq, next_action, messages, message_count, created_at)
             SELECT $1, COALESCE(MAX(seq) + 1, 0), $2, $3, $4, $5
             FROM {table} WHERE session_id = $1
             RETURNING seq",
            table = self.table
        );
        let row = sqlx::query(&sql)
            .bind(session_id)
            .bind(state.next_action.as_str())
            .bind(&messages)
            .bind(message_count)
            .bind(Utc::now())
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        let seq: i64 = row.try_get("seq")?;
        to_u64(seq)
    }

    async fn latest(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let sql = format!(
            "SELECT seq, next_action, messages, created_at FROM {} \
             WHERE session_id = $1 ORDER BY seq DESC LIMIT 1",
            self.table
        );
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&sql)
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
        let sql = format!(
            "SELECT seq, next_action, messages, created_at FROM {} \
             WHERE session_id = $1 AND seq = $2",
            self.table
        );
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&sql)
            .bind(session_id)
            .bind(to_i64(sequence_number)?)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(|r| Self::checkpoint_from_row(session_id, &r))
            .transpose()
    }

    async fn list_sessions(&self) -> Result<BTreeSet<String>, StoreError> {
        let sql = format!("SELECT DISTINCT session_id FROM {}", self.table);
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("session_id").map_err(StoreError::from))
            .collect()
    }

    async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<CheckpointSummary>, StoreError> {
        let sql = format!(
            "SELECT seq, next_action, message_count, created_at FROM {} \
             WHERE session_id = $1 ORDER BY seq ASC",
            self.table
        );
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&sql)
            .bind(session_id)
            .fetch_all(&mut *conn)
            .await?;

        rows.iter()
            .map(|row| -> Result<CheckpointSummary, StoreError> {
                let seq: i64 = row.try_get("seq")?;
                let next_action: String = row.try_get("next_action")?;
                let message_count: i32 = row.try_get("message_count")?;
                Ok(CheckpointSummary {
                    sequence_number: to_u64(seq)?,
                    next_action: next_action.parse::<NextAction>().map_err(StoreError::Corrupt)?,
                    message_count: usize::try_from(message_count)
                        .map_err(|_| StoreError::Corrupt("negative message_count".to_string()))?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
