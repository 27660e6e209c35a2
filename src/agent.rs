//! Headless Agent 运行时
//!
//! 供 CLI 或其他前端调用的操作面：send / replay / list_sessions / history / checkpoints。
//! from_config 按配置组装 Model Gateway、工具注册表、检查点存储与会话管理器。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::checkpoint::{create_checkpoint_store, CheckpointStore, CheckpointSummary};
use crate::config::{AgentSection, AppConfig};
use crate::core::{AgentError, ConversationState, SessionSupervisor, TaskScheduler};
use crate::llm::{create_gateway, LlmError, ModelGateway};
use crate::memory::Message;
use crate::react::{AgentEvent, AgentLoop};
use crate::session::SessionManager;
use crate::tools::{builtin_registry, ToolExecutor, ToolRegistry};

/// 一轮（send / replay）的结果
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub session_id: String,
    /// 最后一条助手消息的文本
    pub answer: String,
    pub state: ConversationState,
}

impl TurnOutcome {
    fn new(session_id: impl Into<String>, state: ConversationState) -> Self {
        Self {
            session_id: session_id.into(),
            answer: state.final_answer().unwrap_or_default().to_string(),
            state,
        }
    }
}

pub struct Agent {
    sessions: SessionManager,
}

impl Agent {
    /// 按配置创建：gateway、内置工具、检查点存储（会建表）
    pub async fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let gateway = create_gateway(&cfg.llm).map_err(|e| match e {
            LlmError::Config(msg) => AgentError::Config(msg),
            other => AgentError::ModelUnavailable(other),
        })?;
        let store = create_checkpoint_store(&cfg.checkpoint)
            .await
            .map_err(AgentError::CheckpointRead)?;
        let registry =
            builtin_registry().map_err(|e| AgentError::Config(format!("tool registry: {e}")))?;
        Ok(Self::with_parts(gateway, store, registry, &cfg.agent))
    }

    /// 用现成组件组装（测试中注入 ScriptedGateway / 内存存储）
    pub fn with_parts(
        gateway: Arc<dyn ModelGateway>,
        store: Arc<dyn CheckpointStore>,
        registry: ToolRegistry,
        settings: &AgentSection,
    ) -> Self {
        let executor = ToolExecutor::new(registry)
            .with_scheduler(TaskScheduler::new(settings.max_concurrent_tools))
            .with_timeout(settings.tool_timeout_secs.map(Duration::from_secs))
            .with_unknown_tool_policy(settings.unknown_tool);
        let agent_loop = AgentLoop::new(gateway, executor)
            .with_system_prompt(settings.system_prompt.clone())
            .with_max_steps(settings.max_steps);
        Self {
            sessions: SessionManager::new(store, agent_loop),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        self.sessions.supervisor()
    }

    /// 取消所有正在进行的 turn / replay（不写检查点）
    pub fn cancel(&self) {
        self.supervisor().cancel();
    }

    /// 发送一条用户消息；session_id 为 None 时开启新会话
    pub async fn send(
        &self,
        text: &str,
        session_id: Option<&str>,
        events: Option<&UnboundedSender<AgentEvent>>,
    ) -> Result<TurnOutcome, AgentError> {
        let cancel = self.supervisor().child_token();
        let handle = self.sessions.open(session_id).await?;
        let state = self.sessions.turn(&handle, text, events, &cancel).await?;
        Ok(TurnOutcome::new(handle.session_id, state))
    }

    /// 从指定检查点恢复并运行到 Done
    pub async fn replay(
        &self,
        session_id: &str,
        sequence_number: u64,
        events: Option<&UnboundedSender<AgentEvent>>,
    ) -> Result<TurnOutcome, AgentError> {
        let cancel = self.supervisor().child_token();
        let state = self
            .sessions
            .replay(session_id, sequence_number, events, &cancel)
            .await?;
        Ok(TurnOutcome::new(session_id, state))
    }

    pub async fn list_sessions(&self) -> Result<BTreeSet<String>, AgentError> {
        self.sessions.list_sessions().await
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<Message>, AgentError> {
        self.sessions.history(session_id).await
    }

    pub async fn checkpoints(&self, session_id: &str) -> Result<Vec<CheckpointSummary>, AgentError> {
        self.sessions.checkpoints(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::config::{CheckpointBackend, LlmProvider};
    use crate::llm::ScriptedGateway;

    #[tokio::test]
    async fn test_from_config_with_mock_and_memory() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = LlmProvider::Mock;
        cfg.checkpoint.backend = CheckpointBackend::Memory;

        let agent = Agent::from_config(&cfg).await.unwrap();
        let outcome = agent.send("ping", None, None).await.unwrap();
        assert_eq!(outcome.answer, "Echo: ping");
        assert_eq!(outcome.state.messages.len(), 2);

        let sessions = agent.list_sessions().await.unwrap();
        assert!(sessions.contains(&outcome.session_id));
    }

    #[tokio::test]
    async fn test_from_config_without_key_fails() {
        let mut cfg = AppConfig::default();
        cfg.checkpoint.backend = CheckpointBackend::Memory;
        cfg.llm.api_key = None;
        let err = Agent::from_config(&cfg).await.err().unwrap();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[tokio::test]
    async fn test_cancel_stops_in_flight_turn_only() {
        let gateway = Arc::new(ScriptedGateway::echo().with_delay(Duration::from_millis(200)));
        let agent = Agent::with_parts(
            gateway,
            Arc::new(MemoryCheckpointStore::new()),
            builtin_registry().unwrap(),
            &AgentSection::default(),
        );

        let (result, _) = tokio::join!(agent.send("ping", Some("s1"), None), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            agent.cancel();
        });
        assert!(matches!(result, Err(AgentError::Cancelled)));
        // 只有起始状态，可 replay
        assert_eq!(agent.checkpoints("s1").await.unwrap().len(), 1);

        // 取消之后的 turn 正常运行
        let outcome = agent.send("pong", Some("s2"), None).await.unwrap();
        assert_eq!(outcome.answer, "Echo: pong");
        let history = agent.history("s2").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], Message::user("pong"));
    }
}
