//! Model Gateway 抽象
//!
//! 所有后端（OpenAI 兼容 / Azure / Scripted）实现 ModelGateway：
//! invoke（非流式，返回完整助手消息）与 invoke_stream（先产出文本增量，最后产出同一条完整助手消息）。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use thiserror::Error;

use crate::memory::{AssistantMessage, Message};
use crate::tools::ToolSpec;

/// 模型调用错误
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Gateway config error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        LlmError::Network(e.to_string())
    }
}

/// 流式调用事件：若干 Delta 之后恰好一个 Completed
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// 文本增量（仅用于观察，不进入状态）
    Delta(String),
    /// 组装完成的助手消息
    Completed(AssistantMessage),
}

pub type ModelEventStream = Pin<Box<dyn Stream<Item = Result<ModelEvent, LlmError>> + Send>>;

/// Model Gateway：给定 system 指令、transcript 与工具目录，返回助手消息
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// 非流式调用
    async fn invoke(
        &self,
        system: &str,
        transcript: &[Message],
        tools: &[ToolSpec],
    ) -> Result<AssistantMessage, LlmError>;

    /// 流式调用；默认实现把 invoke 的结果包装成只含 Completed 的流
    async fn invoke_stream(
        &self,
        system: &str,
        transcript: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ModelEventStream, LlmError> {
        let message = self.invoke(system, transcript, tools).await?;
        Ok(Box::pin(stream::iter(vec![Ok(ModelEvent::Completed(message))])))
    }

    /// 是否支持真正的增量输出
    fn supports_streaming(&self) -> bool {
        false
    }

    /// 用于日志的后端名称
    fn name(&self) -> &str;
}
