//! 对话记忆：transcript 中的消息模型

pub mod conversation;

pub use conversation::{AssistantMessage, Message, Role, ToolRequest, ToolResult, UserMessage};
