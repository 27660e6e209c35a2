//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），
//! 由 ToolRegistry 按名注册与查找。名称与参数 schema 在注册时校验，而不是在调用时。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::ToolError;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON object）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型请求中的 tool_name）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具，返回字符串结果
    async fn execute(&self, args: Value) -> Result<String, ToolError>;
}

/// 注册时校验失败
#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("Tool already registered: {0}")]
    DuplicateTool(String),

    #[error("Invalid tool name: {0:?}")]
    InvalidName(String),

    #[error("Invalid parameters schema for {tool}: {reason}")]
    InvalidSchema { tool: String, reason: String },
}

/// 提供给模型的工具目录条目
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 已注册的工具：schema 在注册时取出并校验
#[derive(Clone)]
struct RegisteredTool {
    tool: Arc<dyn Tool>,
    spec: ToolSpec,
}

/// 工具注册表：name -> 可调用实现 + 已校验的 schema
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        if !is_valid_name(&name) {
            return Err(RegistryError::InvalidName(name));
        }
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateTool(name));
        }
        let parameters = tool.parameters_schema();
        validate_schema(&name, &parameters)?;

        let spec = ToolSpec {
            name: name.clone(),
            description: tool.description().to_string(),
            parameters,
        };
        tracing::debug!(tool = %name, "tool registered");
        self.tools.insert(name, RegisteredTool { tool, spec });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|t| t.tool.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 工具目录（按名称排序，保证每次传给模型的顺序一致）
    pub fn catalog(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// 与 OpenAI function name 约束一致：1-64 个 [A-Za-z0-9_-]
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate_schema(tool: &str, schema: &Value) -> Result<(), RegistryError> {
    let invalid = |reason: &str| RegistryError::InvalidSchema {
        tool: tool.to_string(),
        reason: reason.to_string(),
    };
    let obj = schema.as_object().ok_or_else(|| invalid("schema must be a JSON object"))?;
    match obj.get("type").and_then(Value::as_str) {
        Some("object") => {}
        _ => return Err(invalid("schema type must be \"object\"")),
    }
    if let Some(props) = obj.get("properties") {
        if !props.is_object() {
            return Err(invalid("properties must be an object"));
        }
    }
    Ok(())
}
