//! Agent 主循环（状态机）
//!
//! RunModel -> (RunTools -> RunModel)* -> Done。每次状态转移得到一个新的 ConversationState，
//! 先交给 Checkpointer 持久化，成功后才开始下一次转移；因此崩溃或取消最多丢失正在进行的那一步。
//! 可选 events：推送 StepStarted / ModelDelta / ToolStarted / ToolFinished / Checkpointed。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_SYSTEM_PROMPT;
use crate::core::{AgentError, ConversationState, NextAction};
use crate::llm::{LlmError, ModelEvent, ModelGateway};
use crate::react::AgentEvent;
use crate::tools::ToolExecutor;

/// 单轮默认最多状态转移次数，防止模型无限请求工具
pub const DEFAULT_MAX_STEPS: usize = 25;
/// ToolFinished 预览最大字符数
const RESULT_PREVIEW_CHARS: usize = 200;

/// 每次状态转移完成后调用；返回分配的 sequence_number
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn commit(&self, state: &ConversationState) -> Result<u64, AgentError>;
}

fn send_event(tx: Option<&UnboundedSender<AgentEvent>>, ev: AgentEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() > RESULT_PREVIEW_CHARS {
        format!("{}...", s.chars().take(RESULT_PREVIEW_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}

/// Agent 循环：持有 Model Gateway 与工具执行器，本身无会话状态
#[derive(Clone)]
pub struct AgentLoop {
    gateway: Arc<dyn ModelGateway>,
    executor: ToolExecutor,
    system_prompt: String,
    max_steps: usize,
    streaming: bool,
}

impl AgentLoop {
    pub fn new(gateway: Arc<dyn ModelGateway>, executor: ToolExecutor) -> Self {
        let streaming = gateway.supports_streaming();
        Self {
            gateway,
            executor,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_steps: DEFAULT_MAX_STEPS,
            streaming,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// 关闭后即使网关支持流式也只走 invoke
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming && self.gateway.supports_streaming();
        self
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// 从给定状态运行到 Done
    ///
    /// 取消时丢弃正在进行的转移并返回 Cancelled，不写检查点；
    /// 超过 max_steps 返回 StepLimitExceeded，已提交的检查点保持可恢复。
    pub async fn run(
        &self,
        state: ConversationState,
        checkpointer: &dyn Checkpointer,
        events: Option<&UnboundedSender<AgentEvent>>,
        cancel: &CancellationToken,
    ) -> Result<ConversationState, AgentError> {
        state.validate().map_err(AgentError::InvalidState)?;

        let mut state = state;
        let mut step = 0;
        while !state.is_done() {
            if step >= self.max_steps {
                tracing::warn!(max_steps = self.max_steps, "step limit exceeded");
                return Err(AgentError::StepLimitExceeded(self.max_steps));
            }
            step += 1;
            tracing::debug!(step, action = %state.next_action, "agent step");
            send_event(
                events,
                AgentEvent::StepStarted {
                    step,
                    max_steps: self.max_steps,
                    action: state.next_action,
                },
            );

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(step, "turn cancelled");
                    return Err(AgentError::Cancelled);
                }
                next = self.transition(&state, events) => next?,
            };

            let sequence_number = checkpointer.commit(&next).await?;
            send_event(
                events,
                AgentEvent::Checkpointed {
                    sequence_number,
                    next_action: next.next_action,
                },
            );
            state = next;
        }
        Ok(state)
    }

    async fn transition(
        &self,
        state: &ConversationState,
        events: Option<&UnboundedSender<AgentEvent>>,
    ) -> Result<ConversationState, AgentError> {
        match state.next_action {
            NextAction::RunModel => self.run_model(state, events).await,
            NextAction::RunTools => Ok(self.run_tools(state, events).await),
            NextAction::Done => Ok(state.clone()),
        }
    }

    async fn run_model(
        &self,
        state: &ConversationState,
        events: Option<&UnboundedSender<AgentEvent>>,
    ) -> Result<ConversationState, AgentError> {
        let catalog = self.executor.registry().catalog();

        let message = if self.streaming {
            let mut stream = self
                .gateway
                .invoke_stream(&self.system_prompt, &state.messages, &catalog)
                .await?;
            let mut completed = None;
            while let Some(event) = stream.next().await {
                match event? {
                    ModelEvent::Delta(text) => send_event(events, AgentEvent::ModelDelta { text }),
                    ModelEvent::Completed(message) => {
                        completed = Some(message);
                        break;
                    }
                }
            }
            completed.ok_or_else(|| {
                LlmError::InvalidResponse("stream ended without a completed message".to_string())
            })?
        } else {
            self.gateway
                .invoke(&self.system_prompt, &state.messages, &catalog)
                .await?
        };

        tracing::debug!(
            gateway = self.gateway.name(),
            tool_requests = message.tool_requests.len(),
            "model responded"
        );
        send_event(
            events,
            AgentEvent::AssistantMessage {
                message: message.clone(),
            },
        );
        Ok(state.with_assistant(message))
    }

    async fn run_tools(
        &self,
        state: &ConversationState,
        events: Option<&UnboundedSender<AgentEvent>>,
    ) -> ConversationState {
        let requests = state.pending_tool_requests();
        for request in requests {
            send_event(
                events,
                AgentEvent::ToolStarted {
                    request_id: request.request_id.clone(),
                    tool: request.tool_name.clone(),
                    args: request.arguments.clone(),
                },
            );
        }

        let results = self.executor.execute_batch(requests).await;
        for result in &results {
            send_event(
                events,
                AgentEvent::ToolFinished {
                    request_id: result.request_id.clone(),
                    tool: result.tool_name.clone(),
                    is_error: result.is_error,
                    preview: preview(&result.content),
                },
            );
        }
        state.with_tool_results(results)
    }
}
