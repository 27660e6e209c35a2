//! Agent 错误类型
//!
//! AgentError 是一轮对话（turn / replay）对调用方暴露的错误；
//! ToolError 只在工具内部使用，永远不会中止循环，而是转为 is_error=true 的 ToolResult。

use thiserror::Error;

use crate::checkpoint::StoreError;
use crate::llm::LlmError;

/// 一轮对话中可能出现的错误；任一错误都让本轮干净地终止，会话可从最后一个检查点恢复
#[derive(Error, Debug)]
pub enum AgentError {
    /// 模型调用失败（网络、鉴权、限流）；不重试，本次转移不写检查点
    #[error("Model unavailable: {0}")]
    ModelUnavailable(#[from] LlmError),

    /// 检查点写入失败；上一个检查点仍是持久状态
    #[error("Checkpoint write failed: {0}")]
    CheckpointWrite(StoreError),

    #[error("Checkpoint read failed: {0}")]
    CheckpointRead(StoreError),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Checkpoint {sequence_number} not found in session {session_id}")]
    CheckpointNotFound {
        session_id: String,
        sequence_number: u64,
    },

    /// 状态不满足 next_action 不变式
    #[error("Invalid conversation state: {0}")]
    InvalidState(String),

    #[error("Step limit exceeded ({0})")]
    StepLimitExceeded(usize),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}

/// 工具执行错误（由工具实现返回）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    ExecutionFailed(String),

    /// 超时上限（毫秒）
    #[error("Tool timed out after {0} ms")]
    Timeout(u64),

    /// 请求的工具名不在注册表中
    #[error("Unknown tool: {0}")]
    Unknown(String),
}
