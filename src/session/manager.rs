//! 会话管理：session_id -> 检查点谱系
//!
//! - open：确定 session_id（未给出则生成）并读取最新检查点
//! - turn：以 [历史消息..., 新用户消息] 作为初始状态，先写检查点，再运行 Agent 循环到 Done
//! - replay：从指定检查点复制一份作为新谱系的起点，按其 next_action 继续运行；原检查点保持不变
//! - history / list_sessions / checkpoints：对存储的只读投影
//!
//! 同一会话的 turn / replay 通过 SessionSupervisor 的会话锁串行执行。

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{Checkpoint, CheckpointStore, CheckpointSummary};
use crate::core::{AgentError, ConversationState, NextAction, SessionSupervisor};
use crate::memory::Message;
use crate::react::{AgentEvent, AgentLoop, Checkpointer};
use crate::session::new_session_id;

/// 已打开的会话
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: String,
    /// 打开时的最新检查点；新会话为 None
    pub latest: Option<Checkpoint>,
}

impl SessionHandle {
    pub fn is_new(&self) -> bool {
        self.latest.is_none()
    }
}

/// 把状态追加到某个会话的检查点谱系
struct SessionCheckpointer<'a> {
    store: &'a dyn CheckpointStore,
    session_id: &'a str,
    events: Option<&'a UnboundedSender<AgentEvent>>,
}

#[async_trait]
impl Checkpointer for SessionCheckpointer<'_> {
    async fn commit(&self, state: &ConversationState) -> Result<u64, AgentError> {
        let sequence_number = self
            .store
            .append(self.session_id, state)
            .await
            .map_err(AgentError::CheckpointWrite)?;
        tracing::info!(
            session_id = %self.session_id,
            sequence_number,
            next_action = %state.next_action,
            messages = state.messages.len(),
            "checkpoint written"
        );
        Ok(sequence_number)
    }
}

impl SessionCheckpointer<'_> {
    /// 写入一轮的起始状态（循环之外的那一次提交）
    async fn commit_start(&self, state: &ConversationState) -> Result<u64, AgentError> {
        let sequence_number = self.commit(state).await?;
        if let Some(tx) = self.events {
            let _ = tx.send(AgentEvent::Checkpointed {
                sequence_number,
                next_action: state.next_action,
            });
        }
        Ok(sequence_number)
    }
}

pub struct SessionManager {
    store: Arc<dyn CheckpointStore>,
    agent: AgentLoop,
    supervisor: Arc<SessionSupervisor>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn CheckpointStore>, agent: AgentLoop) -> Self {
        Self {
            store,
            agent,
            supervisor: Arc::new(SessionSupervisor::new()),
        }
    }

    pub fn with_supervisor(mut self, supervisor: Arc<SessionSupervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// 打开会话；session_id 为 None 时生成新的 id
    pub async fn open(&self, session_id: Option<&str>) -> Result<SessionHandle, AgentError> {
        let session_id = match session_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => new_session_id(),
        };
        let latest = self
            .store
            .latest(&session_id)
            .await
            .map_err(AgentError::CheckpointRead)?;
        tracing::debug!(session_id = %session_id, new = latest.is_none(), "session opened");
        Ok(SessionHandle { session_id, latest })
    }

    /// 追加一条用户消息并运行到 Done，返回最终状态
    pub async fn turn(
        &self,
        handle: &SessionHandle,
        user_text: &str,
        events: Option<&UnboundedSender<AgentEvent>>,
        cancel: &CancellationToken,
    ) -> Result<ConversationState, AgentError> {
        let session_id = handle.session_id.as_str();
        let _guard = self.supervisor.lock_session(session_id).await;

        let result = self.run_turn(session_id, user_text, events, cancel).await;

        report_outcome(session_id, &result, events);
        result
    }

    /// 从 sequence_number 处的检查点继续运行到 Done
    pub async fn replay(
        &self,
        session_id: &str,
        sequence_number: u64,
        events: Option<&UnboundedSender<AgentEvent>>,
        cancel: &CancellationToken,
    ) -> Result<ConversationState, AgentError> {
        let _guard = self.supervisor.lock_session(session_id).await;

        let result = self.run_replay(session_id, sequence_number, events, cancel).await;

        report_outcome(session_id, &result, events);
        result
    }

    /// 最新检查点中的 transcript
    pub async fn history(&self, session_id: &str) -> Result<Vec<Message>, AgentError> {
        self.store
            .latest(session_id)
            .await
            .map_err(AgentError::CheckpointRead)?
            .map(|cp| cp.state.messages)
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))
    }

    pub async fn list_sessions(&self) -> Result<BTreeSet<String>, AgentError> {
        self.store
            .list_sessions()
            .await
            .map_err(AgentError::CheckpointRead)
    }

    /// 会话的检查点摘要（按 sequence_number 升序）
    pub async fn checkpoints(&self, session_id: &str) -> Result<Vec<CheckpointSummary>, AgentError> {
        let summaries = self
            .store
            .list_checkpoints(session_id)
            .await
            .map_err(AgentError::CheckpointRead)?;
        if summaries.is_empty() {
            return Err(AgentError::SessionNotFound(session_id.to_string()));
        }
        Ok(summaries)
    }

    async fn run_turn(
        &self,
        session_id: &str,
        user_text: &str,
        events: Option<&UnboundedSender<AgentEvent>>,
        cancel: &CancellationToken,
    ) -> Result<ConversationState, AgentError> {
        // 持锁后重新读取，handle 里的快照可能已过时
        let prior = match self
            .store
            .latest(session_id)
            .await
            .map_err(AgentError::CheckpointRead)?
        {
            Some(cp) if cp.state.next_action == NextAction::RunTools => {
                return Err(AgentError::InvalidState(format!(
                    "session {session_id} has pending tool requests at checkpoint {}; replay it first",
                    cp.sequence_number
                )));
            }
            Some(cp) => cp.state.messages,
            None => Vec::new(),
        };

        // 已取消的 turn 不留下孤立的用户消息
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let seeded = ConversationState::seed(prior, user_text);
        let checkpointer = SessionCheckpointer {
            store: self.store.as_ref(),
            session_id,
            events,
        };
        checkpointer.commit_start(&seeded).await?;
        self.agent.run(seeded, &checkpointer, events, cancel).await
    }

    async fn run_replay(
        &self,
        session_id: &str,
        sequence_number: u64,
        events: Option<&UnboundedSender<AgentEvent>>,
        cancel: &CancellationToken,
    ) -> Result<ConversationState, AgentError> {
        let start = match self
            .store
            .at(session_id, sequence_number)
            .await
            .map_err(AgentError::CheckpointRead)?
        {
            Some(cp) => cp,
            None => return Err(self.not_found(session_id, sequence_number).await),
        };
        tracing::info!(
            session_id = %session_id,
            from = sequence_number,
            next_action = %start.state.next_action,
            "replaying from checkpoint"
        );
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let checkpointer = SessionCheckpointer {
            store: self.store.as_ref(),
            session_id,
            events,
        };
        checkpointer.commit_start(&start.state).await?;
        self.agent.run(start.state, &checkpointer, events, cancel).await
    }

    async fn not_found(&self, session_id: &str, sequence_number: u64) -> AgentError {
        match self.store.latest(session_id).await {
            Ok(Some(_)) => AgentError::CheckpointNotFound {
                session_id: session_id.to_string(),
                sequence_number,
            },
            Ok(None) => AgentError::SessionNotFound(session_id.to_string()),
            Err(e) => AgentError::CheckpointRead(e),
        }
    }
}

fn report_outcome(
    session_id: &str,
    result: &Result<ConversationState, AgentError>,
    events: Option<&UnboundedSender<AgentEvent>>,
) {
    match result {
        Ok(state) => {
            tracing::info!(session_id = %session_id, messages = state.messages.len(), "turn completed");
        }
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "turn aborted");
            if let Some(tx) = events {
                let _ = tx.send(AgentEvent::Error { text: e.to_string() });
            }
        }
    }
}
