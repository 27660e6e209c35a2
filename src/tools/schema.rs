//! 工具参数 JSON Schema 生成（schemars 自动生成）
//!
//! 参数结构体 derive JsonSchema，字段文档注释即为 schema 中的 description。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 生成参数 schema，去掉顶层的 `$schema` / `title`，只保留 function parameters 需要的部分
pub fn parameters_schema<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| {
        serde_json::json!({"type": "object", "properties": {}})
    });
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct Args {
        /// 要计算的表达式
        expression: String,
    }

    #[test]
    fn test_schema_is_plain_object() {
        let schema = parameters_schema::<Args>();
        assert_eq!(schema["type"], "object");
        assert!(schema.get("$schema").is_none());
        assert_eq!(schema["properties"]["expression"]["type"], "string");
        assert_eq!(schema["required"][0], "expression");
    }
}
