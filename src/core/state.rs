//! 会话状态：消息序列 + 下一步动作
//!
//! ConversationState 是检查点的持久化单元。状态机只有三个动作：
//! RunModel（调用模型）、RunTools（执行上一条助手消息里的工具请求）、Done（本轮结束）。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::memory::{AssistantMessage, Message, ToolRequest, ToolResult};

/// 下一步动作；字符串形式在所有存储后端中保持一致
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    RunModel,
    RunTools,
    Done,
}

impl NextAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NextAction::RunModel => "run_model",
            NextAction::RunTools => "run_tools",
            NextAction::Done => "done",
        }
    }
}

impl fmt::Display for NextAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NextAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run_model" => Ok(NextAction::RunModel),
            "run_tools" => Ok(NextAction::RunTools),
            "done" => Ok(NextAction::Done),
            other => Err(format!("unknown next_action: {other}")),
        }
    }
}

/// 会话状态快照
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub messages: Vec<Message>,
    pub next_action: NextAction,
}

impl ConversationState {
    /// 新一轮的初始状态：[历史消息..., 新用户消息]，等待模型
    pub fn seed(prior: Vec<Message>, user_text: impl Into<String>) -> Self {
        let mut messages = prior;
        messages.push(Message::user(user_text));
        Self {
            messages,
            next_action: NextAction::RunModel,
        }
    }

    /// RunModel 完成：追加助手消息，有工具请求则 RunTools，否则 Done
    pub fn with_assistant(&self, message: AssistantMessage) -> Self {
        let next_action = if message.has_tool_requests() {
            NextAction::RunTools
        } else {
            NextAction::Done
        };
        let mut messages = self.messages.clone();
        messages.push(Message::Assistant(message));
        Self {
            messages,
            next_action,
        }
    }

    /// RunTools 完成：按请求顺序追加工具结果，回到 RunModel
    pub fn with_tool_results(&self, results: Vec<ToolResult>) -> Self {
        let mut messages = self.messages.clone();
        messages.extend(results.into_iter().map(Message::Tool));
        Self {
            messages,
            next_action: NextAction::RunModel,
        }
    }

    pub fn last_assistant(&self) -> Option<&AssistantMessage> {
        self.messages.last().and_then(Message::as_assistant)
    }

    /// 待执行的工具请求（仅 RunTools 状态下非空）
    pub fn pending_tool_requests(&self) -> &[ToolRequest] {
        match (self.next_action, self.last_assistant()) {
            (NextAction::RunTools, Some(a)) => &a.tool_requests,
            _ => &[],
        }
    }

    /// 最终回复文本（Done 状态下最后一条助手消息）
    pub fn final_answer(&self) -> Option<&str> {
        match self.next_action {
            NextAction::Done => self.last_assistant().map(|a| a.content.as_str()),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.next_action == NextAction::Done
    }

    /// 校验 next_action 与最后一条消息的一致性
    ///
    /// - RunTools：最后一条是带工具请求的助手消息
    /// - Done：最后一条是不带工具请求的助手消息
    /// - RunModel：transcript 非空，且最后一条不是终止型助手消息
    ///   （unknown_tool = skip 时整批被跳过，最后一条仍可能是带请求的助手消息）
    pub fn validate(&self) -> Result<(), String> {
        let last = self.messages.last();
        match self.next_action {
            NextAction::RunTools => match last.and_then(Message::as_assistant) {
                Some(a) if a.has_tool_requests() => Ok(()),
                _ => Err("run_tools requires a trailing assistant message with tool requests".into()),
            },
            NextAction::Done => match last.and_then(Message::as_assistant) {
                Some(a) if !a.has_tool_requests() => Ok(()),
                _ => Err("done requires a trailing assistant message without tool requests".into()),
            },
            NextAction::RunModel => match last {
                None => Err("run_model requires a non-empty transcript".into()),
                Some(Message::Assistant(a)) if !a.has_tool_requests() => {
                    Err("run_model cannot follow a terminal assistant message".into())
                }
                Some(_) => Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> ToolRequest {
        ToolRequest::new("call_1", "calculator_tool", json!({"expression": "2 + 3"}))
    }

    #[test]
    fn test_seed_appends_user_and_runs_model() {
        let state = ConversationState::seed(vec![Message::user("hi"), Message::assistant("hello")], "next");
        assert_eq!(state.messages.len(), 3);
        assert_eq!(state.next_action, NextAction::RunModel);
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_next_action_follows_tool_requests() {
        let seeded = ConversationState::seed(vec![], "What is 2 + 3?");
        let with_req = seeded.with_assistant(AssistantMessage::with_tool_requests("", vec![request()]));
        assert_eq!(with_req.next_action, NextAction::RunTools);
        assert_eq!(with_req.pending_tool_requests().len(), 1);

        let after_tools = with_req.with_tool_results(vec![ToolResult::success(&request(), "5")]);
        assert_eq!(after_tools.next_action, NextAction::RunModel);
        assert!(after_tools.pending_tool_requests().is_empty());

        let done = after_tools.with_assistant(AssistantMessage::text("The answer is 5."));
        assert!(done.is_done());
        assert_eq!(done.final_answer(), Some("The answer is 5."));
        assert_eq!(done.messages.len(), 4);
    }

    #[test]
    fn test_validate_rejects_inconsistent_states() {
        let bad_tools = ConversationState {
            messages: vec![Message::user("x")],
            next_action: NextAction::RunTools,
        };
        assert!(bad_tools.validate().is_err());

        let bad_done = ConversationState {
            messages: vec![Message::Assistant(AssistantMessage::with_tool_requests("", vec![request()]))],
            next_action: NextAction::Done,
        };
        assert!(bad_done.validate().is_err());

        let empty = ConversationState {
            messages: vec![],
            next_action: NextAction::RunModel,
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_next_action_string_forms() {
        for action in [NextAction::RunModel, NextAction::RunTools, NextAction::Done] {
            assert_eq!(action.as_str().parse::<NextAction>().unwrap(), action);
        }
        assert!("call_tools".parse::<NextAction>().is_err());
    }
}
