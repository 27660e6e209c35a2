//! 内存检查点存储（进程内，不持久化）

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::checkpoint::{Checkpoint, CheckpointStore, CheckpointSummary, StoreError};
use crate::core::ConversationState;

/// session_id -> 按 sequence_number 排列的检查点；下标即 sequence_number
#[derive(Default)]
pub struct MemoryCheckpointStore {
    sessions: RwLock<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn append(&self, session_id: &str, state: &ConversationState) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.write().await;
        let lineage = sessions.entry(session_id.to_string()).or_default();
        let sequence_number = lineage.len() as u64;
        lineage.push(Checkpoint {
            session_id: session_id.to_string(),
            sequence_number,
            state: state.clone(),
            created_at: chrono::Utc::now(),
        });
        Ok(sequence_number)
    }

    async fn latest(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).and_then(|l| l.last()).cloned())
    }

    async fn at(
        &self,
        session_id: &str,
        sequence_number: u64,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session_id)
            .and_then(|l| usize::try_from(sequence_number).ok().and_then(|i| l.get(i)))
            .cloned())
    }

    async fn list_sessions(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.sessions.read().await.keys().cloned().collect())
    }

    async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<CheckpointSummary>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session_id)
            .map(|l| l.iter().map(CheckpointSummary::from).collect())
            .unwrap_or_default())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
