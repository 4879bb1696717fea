//! 工具调用 JSON Schema 生成（schemars）
//!
//! 将「合法 tool call」的 JSON 结构注入 system prompt，减少 LLM 输出格式错误。

use schemars::{schema_for, JsonSchema};
use serde_json::{Map, Value};

/// 工具调用请求格式：与 Planner 解析的 `{"tool": "...", "args": {...}}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，如 get_repository、get_package_info
    pub tool: String,
    /// 工具参数，如 {"repo_path": "facebook/react", "limit": 5}
    pub args: Map<String, Value>,
}

/// 返回工具调用的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
