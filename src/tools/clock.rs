//! 当前时间工具

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::Tool;

/// 返回本地时间，格式 `%Y-%m-%d %H:%M:%S`
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "get_current_time_tool"
    }

    fn description(&self) -> &str {
        "Get the current local date and time."
    }

    async fn execute(&self, _args: Value) -> Result<String, ToolError> {
        Ok(chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_time_format() {
        let out = CurrentTimeTool.execute(Value::Null).await.unwrap();
        assert!(chrono::NaiveDateTime::parse_from_str(&out, "%Y-%m-%d %H:%M:%S").is_ok());
    }
}
