//! 检查点存储：按 session_id 分区、按 sequence_number 寻址的不可变状态快照
//!
//! 三个后端满足同一契约（见 tests/checkpoint_contract.rs）：
//! - memory：进程内，测试与临时运行
//! - sqlite：嵌入式文件
//! - postgres：网络关系库
//!
//! sequence_number 从 0 开始，每个会话内严格递增、无空洞、不复用。

pub mod memory;
pub mod postgres;
pub mod record;
pub mod sqlite;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::{CheckpointBackend, CheckpointSection};
use crate::core::{ConversationState, NextAction};

pub use memory::MemoryCheckpointStore;
pub use postgres::PostgresCheckpointStore;
pub use record::PersistedMessage;
pub use sqlite::SqliteCheckpointStore;

/// 存储层错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt checkpoint: {0}")]
    Corrupt(String),

    #[error("Store config error: {0}")]
    Config(String),
}

/// 一个检查点（写入后不可变）
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub session_id: String,
    pub sequence_number: u64,
    pub state: ConversationState,
    pub created_at: DateTime<Utc>,
}

/// 检查点摘要（不含 transcript），用于挑选回放点
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointSummary {
    pub sequence_number: u64,
    pub next_action: NextAction,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
}

impl From<&Checkpoint> for CheckpointSummary {
    fn from(c: &Checkpoint) -> Self {
        Self {
            sequence_number: c.sequence_number,
            next_action: c.state.next_action,
            message_count: c.state.messages.len(),
            created_at: c.created_at,
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 追加一个检查点作为该会话的最新状态，返回分配的 sequence_number
    async fn append(&self, session_id: &str, state: &ConversationState) -> Result<u64, StoreError>;

    /// 最新检查点；会话不存在时返回 None
    async fn latest(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// 指定 sequence_number 的检查点
    async fn at(&self, session_id: &str, sequence_number: u64)
        -> Result<Option<Checkpoint>, StoreError>;

    /// 所有出现过的 session_id
    async fn list_sessions(&self) -> Result<BTreeSet<String>, StoreError>;

    /// 会话的检查点摘要，按 sequence_number 升序
    async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<CheckpointSummary>, StoreError>;

    /// 用于日志的后端名称
    fn backend(&self) -> &'static str;
}

/// 根据 [checkpoint] 配置创建存储并完成建表
pub async fn create_checkpoint_store(
    section: &CheckpointSection,
) -> Result<Arc<dyn CheckpointStore>, StoreError> {
    let store: Arc<dyn CheckpointStore> = match section.backend {
        CheckpointBackend::Memory => Arc::new(MemoryCheckpointStore::new()),
        CheckpointBackend::Sqlite => Arc::new(
            SqliteCheckpointStore::open(&section.sqlite_path, section.max_connections).await?,
        ),
        CheckpointBackend::Postgres => Arc::new(
            PostgresCheckpointStore::connect(
                postgres::connect_options(section)?,
                section.max_connections,
            )
            .await?,
        ),
    };
    tracing::info!(backend = store.backend(), "Checkpoint store ready");
    Ok(store)
}

fn to_i64(n: u64) -> Result<i64, StoreError> {
    i64::try_from(n).map_err(|_| StoreError::Corrupt(format!("sequence number {n} out of range")))
}

fn to_u64(n: i64) -> Result<u64, StoreError> {
    u64::try_from(n).map_err(|_| StoreError::Corrupt(format!("negative sequence number {n}")))
}
