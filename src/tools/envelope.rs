//! 工具结果信封
//!
//! 每次工具调用都产出一个 Envelope：`{"ok": payload}` 或 `{"error": {"kind", "message"}}`。
//! 工具实现返回 `Result<Value, ToolError>`，由 ToolExecutor 统一转换。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ErrorKind;

/// 工具级错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// 参数缺失或格式错误（如 repo_path 不是 owner/repo）
    ValidationError,
    /// 上游 API 失败：HTTP 非 2xx、网络错误、超时
    UpstreamError,
    /// 推理引擎请求了未注册的工具
    UnknownToolError,
    InternalError,
}

impl From<ToolErrorKind> for ErrorKind {
    fn from(kind: ToolErrorKind) -> Self {
        match kind {
            ToolErrorKind::ValidationError => ErrorKind::ValidationError,
            ToolErrorKind::UpstreamError => ErrorKind::UpstreamError,
            ToolErrorKind::UnknownToolError => ErrorKind::UnknownToolError,
            ToolErrorKind::InternalError => ErrorKind::InternalError,
        }
    }
}

/// 工具执行失败
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::ValidationError, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::UpstreamError, message)
    }

    pub fn unknown_tool(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::UnknownToolError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::InternalError, message)
    }
}

/// 工具结果信封（外部标签序列化：`{"ok": ...}` / `{"error": {...}}`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Envelope {
    Ok(Value),
    Error(ToolError),
}

impl Envelope {
    pub fn is_ok(&self) -> bool {
        matches!(self, Envelope::Ok(_))
    }

    pub fn error(&self) -> Option<&ToolError> {
        match self {
            Envelope::Ok(_) => None,
            Envelope::Error(e) => Some(e),
        }
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"error":{"kind":"internal_error","message":"unserializable envelope"}}"#
                .to_string()
        })
    }
}

impl From<Result<Value, ToolError>> for Envelope {
    fn from(result: Result<Value, ToolError>) -> Self {
        match result {
            Ok(v) => Envelope::Ok(v),
            Err(e) => Envelope::Error(e),
        }
    }
}
