//! 脚本化 Model Gateway（用于测试与离线运行，无需 API）
//!
//! 按顺序返回预置的回复；每次调用记录收到的 transcript，便于断言“是否调用了模型”。
//! 脚本耗尽时：echo 模式回显最后一条用户消息，否则返回 InvalidResponse。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use serde_json::Value;

use crate::llm::{LlmError, ModelEvent, ModelEventStream, ModelGateway};
use crate::memory::{AssistantMessage, Message, ToolRequest};
use crate::tools::ToolSpec;

/// 一次被记录的模型调用
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub system: String,
    pub transcript: Vec<Message>,
    pub tool_names: Vec<String>,
}

#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Result<AssistantMessage, LlmError>>>,
    calls: Mutex<Vec<RecordedCall>>,
    echo_when_exhausted: bool,
    streaming: bool,
    delay: Option<Duration>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// 离线模式：没有脚本时回显用户最后一条消息
    pub fn echo() -> Self {
        Self {
            echo_when_exhausted: true,
            streaming: true,
            ..Self::default()
        }
    }

    /// 追加一条回复
    pub fn reply(self, message: AssistantMessage) -> Self {
        lock(&self.script).push_back(Ok(message));
        self
    }

    /// 追加一条纯文本终止回复
    pub fn reply_text(self, text: impl Into<String>) -> Self {
        self.reply(AssistantMessage::text(text))
    }

    /// 追加一条只含一个工具请求的回复
    pub fn reply_tool_call(
        self,
        request_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        self.reply(AssistantMessage::with_tool_requests(
            "",
            vec![ToolRequest::new(request_id, tool_name, arguments)],
        ))
    }

    /// 追加一次失败
    pub fn fail(self, error: LlmError) -> Self {
        lock(&self.script).push_back(Err(error));
        self
    }

    /// 流式模式下按词产出 Delta
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// 每次调用前等待，用于取消测试
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.script).len()
    }

    fn next_reply(&self, transcript: &[Message]) -> Result<AssistantMessage, LlmError> {
        if let Some(reply) = lock(&self.script).pop_front() {
            return reply;
        }
        if self.echo_when_exhausted {
            let last_user = transcript
                .iter()
                .rev()
                .find(|m| matches!(m, Message::User(_)))
                .map(|m| m.text())
                .unwrap_or("(no input)");
            return Ok(AssistantMessage::text(format!("Echo: {last_user}")));
        }
        Err(LlmError::InvalidResponse(
            "scripted gateway has no replies left".to_string(),
        ))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// 把文本切成带空格的词增量，拼接后与原文一致
fn word_deltas(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(str::to_string).collect()
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn invoke(
        &self,
        system: &str,
        transcript: &[Message],
        tools: &[ToolSpec],
    ) -> Result<AssistantMessage, LlmError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.calls).push(RecordedCall {
            system: system.to_string(),
            transcript: transcript.to_vec(),
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
        });
        self.next_reply(transcript)
    }

    async fn invoke_stream(
        &self,
        system: &str,
        transcript: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ModelEventStream, LlmError> {
        let message = self.invoke(system, transcript, tools).await?;
        let mut events: Vec<Result<ModelEvent, LlmError>> = Vec::new();
        if self.streaming {
            events.extend(
                word_deltas(&message.content)
                    .into_iter()
                    .map(|d| Ok(ModelEvent::Delta(d))),
            );
        }
        events.push(Ok(ModelEvent::Completed(message)));
        Ok(Box::pin(stream::iter(events)))
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_replies_in_order_then_exhausted() {
        let gateway = ScriptedGateway::new()
            .reply_tool_call("call_1", "calculator_tool", json!({"expression": "2 + 3"}))
            .reply_text("The answer is 5.");

        let first = gateway.invoke("sys", &[Message::user("q")], &[]).await.unwrap();
        assert!(first.has_tool_requests());
        let second = gateway.invoke("sys", &[Message::user("q")], &[]).await.unwrap();
        assert_eq!(second.content, "The answer is 5.");

        let err = gateway.invoke("sys", &[], &[]).await.unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
        assert_eq!(gateway.call_count(), 3);
        assert_eq!(gateway.calls()[0].system, "sys");
    }

    #[tokio::test]
    async fn test_stream_deltas_concatenate_to_content() {
        let gateway = ScriptedGateway::new()
            .with_streaming(true)
            .reply_text("one two three");
        let events: Vec<ModelEvent> = gateway
            .invoke_stream("", &[Message::user("q")], &[])
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await;

        let mut joined = String::new();
        for event in &events[..events.len() - 1] {
            match event {
                ModelEvent::Delta(d) => joined.push_str(d),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(joined, "one two three");
        assert!(matches!(events.last(), Some(ModelEvent::Completed(m)) if m.content == "one two three"));
    }

    #[tokio::test]
    async fn test_echo_mode() {
        let gateway = ScriptedGateway::echo();
        let reply = gateway.invoke("", &[Message::user("hello")], &[]).await.unwrap();
        assert_eq!(reply.content, "Echo: hello");
    }
}
