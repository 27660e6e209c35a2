//! OpenAI 兼容 Chat Completions 网关（含 Azure OpenAI 部署）
//!
//! 直接用 reqwest 调用 `/chat/completions`：
//! - 工具目录以 function tools 形式传给模型，返回的 tool_calls 转成 ToolRequest；
//! - 流式模式解析 SSE（`data: {...}` / `data: [DONE]`），文本增量即时产出，
//!   tool_calls 按 index 逐段拼接，流结束时产出一条完整助手消息；
//! - 所有凭据都由调用方通过 GatewayConfig 显式传入，这里不读环境变量。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::llm::{LlmError, ModelEvent, ModelEventStream, ModelGateway};
use crate::memory::{AssistantMessage, Message, ToolRequest};
use crate::tools::ToolSpec;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// 请求发往哪里
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    /// OpenAI 或任意兼容端点（base_url 形如 `https://api.openai.com/v1`）
    OpenAi { base_url: String },
    /// Azure OpenAI：`{endpoint}/openai/deployments/{deployment}/chat/completions?api-version=..`
    Azure {
        endpoint: String,
        deployment: String,
        api_version: String,
    },
}

impl Endpoint {
    pub fn chat_completions_url(&self) -> String {
        match self {
            Endpoint::OpenAi { base_url } => {
                format!("{}/chat/completions", base_url.trim_end_matches('/'))
            }
            Endpoint::Azure {
                endpoint,
                deployment,
                api_version,
            } => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                endpoint.trim_end_matches('/'),
                deployment,
                api_version
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub endpoint: Endpoint,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    /// 是否走 SSE 流式
    pub streaming: bool,
    /// 单次请求（含流式读取）的超时
    pub timeout: Duration,
}

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, usage: &Usage) {
        self.prompt_tokens.fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn get(&self) -> (u64, u64, u64) {
        let prompt = self.prompt_tokens.load(Ordering::Relaxed);
        let completion = self.completion_tokens.load(Ordering::Relaxed);
        (prompt, completion, prompt + completion)
    }
}

/// OpenAI / Azure 网关
pub struct OpenAiGateway {
    client: reqwest::Client,
    config: GatewayConfig,
    url: String,
    usage: TokenUsage,
}

impl OpenAiGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, LlmError> {
        if config.api_key.trim().is_empty() {
            return Err(LlmError::Config("missing API key".to_string()));
        }
        let invalid_key = |e: reqwest::header::InvalidHeaderValue| LlmError::Config(e.to_string());

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        match &config.endpoint {
            Endpoint::OpenAi { .. } => {
                let value = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
                    .map_err(invalid_key)?;
                headers.insert(AUTHORIZATION, value);
            }
            Endpoint::Azure { .. } => {
                let value = HeaderValue::from_str(&config.api_key).map_err(invalid_key)?;
                headers.insert("api-key", value);
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;
        let url = config.endpoint.chat_completions_url();

        Ok(Self {
            client,
            config,
            url,
            usage: TokenUsage::default(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    fn build_body(
        &self,
        system: &str,
        transcript: &[Message],
        tools: &[ToolSpec],
        stream: bool,
    ) -> Value {
        let mut messages = Vec::with_capacity(transcript.len() + 1);
        if !system.is_empty() {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.extend(transcript.iter().map(to_wire_message));

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(to_wire_tool).collect());
        }
        if stream {
            body["stream"] = json!(true);
            if matches!(self.config.endpoint, Endpoint::OpenAi { .. }) {
                body["stream_options"] = json!({"include_usage": true});
            }
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let response = self.client.post(&self.url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let text = response.text().await.unwrap_or_default();
            return Err(status_to_error(status.as_u16(), &text, retry_after));
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelGateway for OpenAiGateway {
    async fn invoke(
        &self,
        system: &str,
        transcript: &[Message],
        tools: &[ToolSpec],
    ) -> Result<AssistantMessage, LlmError> {
        let body = self.build_body(system, transcript, tools, false);
        let response = self.post(&body).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        if let Some(usage) = &parsed.usage {
            self.usage.add(usage);
        }
        parsed.into_assistant_message()
    }

    async fn invoke_stream(
        &self,
        system: &str,
        transcript: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ModelEventStream, LlmError> {
        if !self.config.streaming {
            let message = self.invoke(system, transcript, tools).await?;
            return Ok(Box::pin(futures_util::stream::iter(vec![Ok(
                ModelEvent::Completed(message),
            )])));
        }

        let body = self.build_body(system, transcript, tools, true);
        let response = self.post(&body).await?;
        let usage_sink = self.usage.clone();

        let stream = async_stream::stream! {
            let bytes = response.bytes_stream();
            futures_util::pin_mut!(bytes);
            let mut buffer: Vec<u8> = Vec::new();
            let mut acc = StreamAccumulator::default();
            let mut saw_done = false;
            let mut failure: Option<LlmError> = None;
            let mut eof = false;

            'read: while !eof {
                match bytes.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        failure = Some(LlmError::Network(e.to_string()));
                        break 'read;
                    }
                    None => {
                        // 最后一行可能没有换行符
                        eof = true;
                        if !buffer.is_empty() && buffer.last() != Some(&b'\n') {
                            buffer.push(b'\n');
                        }
                    }
                }
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    match parse_sse_line(line.trim_end()) {
                        SseLine::Skip => {}
                        SseLine::Done => {
                            saw_done = true;
                            break 'read;
                        }
                        SseLine::Data(data) => match serde_json::from_str::<StreamChunk>(data) {
                            Ok(parsed) => {
                                if let Some(delta) = acc.apply(parsed) {
                                    yield Ok(ModelEvent::Delta(delta));
                                }
                            }
                            Err(e) => {
                                failure = Some(LlmError::InvalidResponse(format!(
                                    "bad stream chunk: {e}"
                                )));
                                break 'read;
                            }
                        },
                    }
                }
            }

            if failure.is_none() && !saw_done && acc.finish_reason.is_none() {
                failure = Some(LlmError::Network("stream ended prematurely".to_string()));
            }
            match failure {
                Some(e) => yield Err(e),
                None => {
                    if let Some(usage) = &acc.usage {
                        usage_sink.add(usage);
                    }
                    yield Ok(ModelEvent::Completed(acc.finish()));
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn supports_streaming(&self) -> bool {
        self.config.streaming
    }

    fn name(&self) -> &str {
        match self.config.endpoint {
            Endpoint::OpenAi { .. } => "openai",
            Endpoint::Azure { .. } => "azure",
        }
    }
}

/// 把 HTTP 状态码映射为 LlmError
pub fn status_to_error(status: u16, body: &str, retry_after_secs: Option<u64>) -> LlmError {
    match status {
        401 | 403 => LlmError::Authentication(truncate(body, 500)),
        429 => LlmError::RateLimited {
            retry_after_ms: retry_after_secs.map(|s| s * 1000),
        },
        _ => LlmError::Api {
            status,
            body: truncate(body, 2000),
        },
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}

enum SseLine<'a> {
    Skip,
    Done,
    Data(&'a str),
}

fn parse_sse_line(line: &str) -> SseLine<'_> {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data.is_empty() {
        SseLine::Skip
    } else if data == "[DONE]" {
        SseLine::Done
    } else {
        SseLine::Data(data)
    }
}

/// 模型返回的 arguments 是 JSON 字符串；空串视为无参数，解析失败时原样保留为字符串
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn to_wire_tool(spec: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": spec.parameters,
        }
    })
}

fn to_wire_message(message: &Message) -> Value {
    match message {
        Message::User(m) => json!({"role": "user", "content": m.content}),
        Message::Assistant(m) => {
            let content = if m.content.is_empty() && m.has_tool_requests() {
                Value::Null
            } else {
                Value::String(m.content.clone())
            };
            let mut wire = json!({"role": "assistant", "content": content});
            if m.has_tool_requests() {
                let calls = m
                    .tool_requests
                    .iter()
                    .map(|r| {
                        json!({
                            "id": r.request_id,
                            "type": "function",
                            "function": {
                                "name": r.tool_name,
                                "arguments": r.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                wire["tool_calls"] = Value::Array(calls);
            }
            wire
        }
        Message::Tool(r) => json!({
            "role": "tool",
            "tool_call_id": r.request_id,
            "content": r.content,
        }),
    }
}

fn response_metadata(
    mut message: AssistantMessage,
    model: Option<String>,
    finish_reason: Option<String>,
    usage: Option<&Usage>,
) -> AssistantMessage {
    if let Some(model) = model.filter(|m| !m.is_empty()) {
        message = message.with_metadata("model", json!(model));
    }
    if let Some(reason) = finish_reason {
        message = message.with_metadata("finish_reason", json!(reason));
    }
    if let Some(usage) = usage {
        message = message.with_metadata("usage", json!(usage));
    }
    message
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

impl ChatResponse {
    fn into_assistant_message(self) -> Result<AssistantMessage, LlmError> {
        let usage = self.usage;
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("response has no choices".to_string()))?;
        let requests = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| ToolRequest::new(c.id, c.function.name, parse_arguments(&c.function.arguments)))
            .collect();
        let message = AssistantMessage::with_tool_requests(
            choice.message.content.unwrap_or_default(),
            requests,
        );
        Ok(response_metadata(
            message,
            self.model,
            choice.finish_reason,
            usage.as_ref(),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// 把 SSE 分片累积成一条助手消息
#[derive(Debug, Default)]
struct StreamAccumulator {
    content: String,
    calls: BTreeMap<u32, PartialCall>,
    model: Option<String>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl StreamAccumulator {
    /// 吸收一个分片；有新文本时返回该增量
    fn apply(&mut self, chunk: StreamChunk) -> Option<String> {
        if let Some(model) = chunk.model.filter(|m| !m.is_empty()) {
            self.model = Some(model);
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        let mut text = String::new();
        for choice in chunk.choices {
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
            let Some(delta) = choice.delta else { continue };
            if let Some(content) = delta.content {
                text.push_str(&content);
            }
            for call in delta.tool_calls.unwrap_or_default() {
                let entry = self.calls.entry(call.index).or_default();
                if let Some(id) = call.id.filter(|id| !id.is_empty()) {
                    entry.id = id;
                }
                if let Some(function) = call.function {
                    if let Some(name) = function.name {
                        entry.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        entry.arguments.push_str(&arguments);
                    }
                }
            }
        }

        if text.is_empty() {
            None
        } else {
            self.content.push_str(&text);
            Some(text)
        }
    }

    fn finish(self) -> AssistantMessage {
        let requests = self
            .calls
            .into_values()
            .map(|c| ToolRequest::new(c.id, c.name, parse_arguments(&c.arguments)))
            .collect();
        let message = AssistantMessage::with_tool_requests(self.content, requests);
        response_metadata(
            message,
            self.model,
            self.finish_reason,
            self.usage.as_ref(),
        )
    }
}
