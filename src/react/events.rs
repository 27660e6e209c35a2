//! Agent 循环过程事件：用于流式展示模型增量、工具调用与检查点
//!
//! 事件只是观察通道，不参与状态转移；流式增量从不写入检查点。

use serde::Serialize;
use serde_json::Value;

use crate::core::NextAction;
use crate::memory::AssistantMessage;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 开始一次状态转移
    StepStarted {
        step: usize,
        max_steps: usize,
        action: NextAction,
    },
    /// 模型输出的一小段文本
    ModelDelta { text: String },
    /// 模型返回的完整助手消息（已写入状态）
    AssistantMessage { message: AssistantMessage },
    /// 开始执行工具
    ToolStarted {
        request_id: String,
        tool: String,
        args: Value,
    },
    /// 工具执行结束（结果预览，避免过长）
    ToolFinished {
        request_id: String,
        tool: String,
        is_error: bool,
        preview: String,
    },
    /// 状态已持久化
    Checkpointed {
        sequence_number: u64,
        next_action: NextAction,
    },
    /// 本轮中止
    Error { text: String },
}
