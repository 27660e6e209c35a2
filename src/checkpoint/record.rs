//! 检查点的持久化记录形状（与后端无关）
//!
//! 每条消息落盘为 `{role, content, tool_request_id?, tool_name?, is_error?, tool_requests?, response_metadata?}`，
//! 整个 transcript 以 JSON 数组存入 messages 列。读回时重建 Message 并校验状态不变量。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::checkpoint::StoreError;
use crate::core::{ConversationState, NextAction};
use crate::memory::{AssistantMessage, Message, Role, ToolRequest, ToolResult, UserMessage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_requests: Option<Vec<ToolRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_metadata: Option<Map<String, Value>>,
}

impl PersistedMessage {
    fn bare(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            tool_request_id: None,
            tool_name: None,
            is_error: None,
            tool_requests: None,
            response_metadata: None,
        }
    }
}

impl From<&Message> for PersistedMessage {
    fn from(message: &Message) -> Self {
        match message {
            Message::User(m) => Self::bare(Role::User, &m.content),
            Message::Assistant(m) => Self {
                tool_requests: m.has_tool_requests().then(|| m.tool_requests.clone()),
                response_metadata: (!m.response_metadata.is_empty())
                    .then(|| m.response_metadata.clone()),
                ..Self::bare(Role::Assistant, &m.content)
            },
            Message::Tool(r) => Self {
                tool_request_id: Some(r.request_id.clone()),
                tool_name: Some(r.tool_name.clone()),
                is_error: Some(r.is_error),
                ..Self::bare(Role::Tool, &r.content)
            },
        }
    }
}

impl TryFrom<PersistedMessage> for Message {
    type Error = StoreError;

    fn try_from(p: PersistedMessage) -> Result<Self, Self::Error> {
        Ok(match p.role {
            Role::User => Message::User(UserMessage { content: p.content }),
            Role::Assistant => Message::Assistant(AssistantMessage {
                content: p.content,
                tool_requests: p.tool_requests.unwrap_or_default(),
                response_metadata: p.response_metadata.unwrap_or_default(),
            }),
            Role::Tool => {
                let request_id = p.tool_request_id.ok_or_else(|| {
                    StoreError::Corrupt("tool message without tool_request_id".to_string())
                })?;
                let tool_name = p
                    .tool_name
                    .ok_or_else(|| StoreError::Corrupt("tool message without tool_name".to_string()))?;
                Message::Tool(ToolResult {
                    request_id,
                    tool_name,
                    content: p.content,
                    is_error: p.is_error.unwrap_or(false),
                })
            }
        })
    }
}

/// transcript -> messages 列的 JSON 值
pub fn encode_messages(messages: &[Message]) -> Result<Value, StoreError> {
    let records: Vec<PersistedMessage> = messages.iter().map(PersistedMessage::from).collect();
    Ok(serde_json::to_value(records)?)
}

/// messages 列 + next_action 列 -> 已校验的 ConversationState
pub fn decode_state(messages: Value, next_action: &str) -> Result<ConversationState, StoreError> {
    let next_action: NextAction = next_action.parse().map_err(StoreError::Corrupt)?;
    let records: Vec<PersistedMessage> = serde_json::from_value(messages)?;
    let messages = records
        .into_iter()
        .map(Message::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    let state = ConversationState {
        messages,
        next_action,
    };
    state.validate().map_err(StoreError::Corrupt)?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_result_record_shape() {
        let request = ToolRequest::new("call_1", "calculator_tool", json!({"expression": "1/0"}));
        let msg = Message::Tool(ToolResult::failure(&request, "Error: division by zero"));
        let v = serde_json::to_value(PersistedMessage::from(&msg)).unwrap();
        assert_eq!(
            v,
            json!({
                "role": "tool",
                "content": "Error: division by zero",
                "tool_request_id": "call_1",
                "tool_name": "calculator_tool",
                "is_error": true
            })
        );
    }

    #[test]
    fn test_user_record_has_no_optional_fields() {
        let v = serde_json::to_value(PersistedMessage::from(&Message::user("hi"))).unwrap();
        assert_eq!(v, json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn test_decode_rejects_broken_invariant() {
        let messages = encode_messages(&[Message::user("hi")]).unwrap();
        let err = decode_state(messages, "run_tools").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn test_decode_rejects_unknown_action_and_bad_tool_row() {
        assert!(matches!(
            decode_state(json!([]), "sleeping"),
            Err(StoreError::Corrupt(_))
        ));
        assert!(matches!(
            decode_state(json!([{"role": "tool", "content": "5"}]), "run_model"),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_state_survives_encoding() {
        let state = ConversationState::seed(vec![], "What is 2 + 3?").with_assistant(
            AssistantMessage::with_tool_requests(
                "",
                vec![ToolRequest::new("c1", "calculator_tool", json!({"expression": "2 + 3"}))],
            )
            .with_metadata("model", json!("gpt-4o")),
        );
        let encoded = encode_messages(&state.messages).unwrap();
        let decoded = decode_state(encoded, state.next_action.as_str()).unwrap();
        assert_eq!(decoded, state);
    }
}
