//! 工具执行器
//!
//! 持有 ToolRegistry、可选超时与并发许可。execute_batch 并发执行一批工具请求，
//! 结果按请求顺序返回；单个工具失败（返回 Err、超时或 panic）只影响它自己的 ToolResult。
//! 每次调用输出结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use futures_util::FutureExt;
use serde::Deserialize;
use tokio::time::timeout;

use crate::core::{TaskScheduler, ToolError};
use crate::memory::{ToolRequest, ToolResult};
use crate::tools::ToolRegistry;

/// 模型请求了未注册工具时的处理方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownToolPolicy {
    /// 生成 is_error=true 的 ToolResult，让模型知道请求未被执行
    #[default]
    Report,
    /// 静默跳过，不生成 ToolResult
    Skip,
}

/// 工具执行器
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    scheduler: TaskScheduler,
    timeout: Option<Duration>,
    unknown_tool: UnknownToolPolicy,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            scheduler: TaskScheduler::default(),
            timeout: None,
            unknown_tool: UnknownToolPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_scheduler(mut self, scheduler: TaskScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_unknown_tool_policy(mut self, policy: UnknownToolPolicy) -> Self {
        self.unknown_tool = policy;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 执行一批互不依赖的工具请求；全部结束后按请求顺序返回结果
    pub async fn execute_batch(&self, requests: &[ToolRequest]) -> Vec<ToolResult> {
        join_all(requests.iter().map(|r| self.execute(r)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// 执行单个请求；返回 None 表示按 Skip 策略跳过了未知工具
    pub async fn execute(&self, request: &ToolRequest) -> Option<ToolResult> {
        let Some(tool) = self.registry.get(&request.tool_name) else {
            let err = ToolError::Unknown(request.tool_name.clone());
            tracing::warn!(tool = %request.tool_name, policy = ?self.unknown_tool, "unknown tool requested");
            return match self.unknown_tool {
                UnknownToolPolicy::Report => Some(ToolResult::failure(request, format!("Error: {err}"))),
                UnknownToolPolicy::Skip => None,
            };
        };

        let _permit = self.scheduler.acquire_tool().await;
        let start = Instant::now();
        let call = AssertUnwindSafe(tool.execute(request.arguments.clone())).catch_unwind();
        let result = match self.timeout {
            Some(limit) => match timeout(limit, call).await {
                Ok(r) => r,
                Err(_) => Ok(Err(ToolError::Timeout(
                    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                ))),
            },
            None => call.await,
        };
        let result = result
            .unwrap_or_else(|_| Err(ToolError::ExecutionFailed("tool panicked".to_string())));

        let outcome = match &result {
            Ok(_) => "ok",
            Err(ToolError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": request.tool_name,
            "request_id": request.request_id,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&request.arguments),
        });
        tracing::info!(audit = %audit, "tool");

        Some(match result {
            Ok(content) => ToolResult::success(request, content),
            Err(e) => ToolResult::failure(request, format!("Error: {e}")),
        })
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
