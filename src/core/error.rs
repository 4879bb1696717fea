//! 错误类型与恢复动作
//!
//! 工具级错误（ToolError）被 Envelope 捕获，不会越过编解码边界；
//! 交换级错误（AgentError）由 QueryRouter 返回给通道适配器，按 ErrorKind 呈现给用户。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::StoreError;

/// 面向通道的错误分类（API 响应中的 `error` 字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    UpstreamError,
    UnknownToolError,
    SessionConflictError,
    BudgetExceededError,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::UnknownToolError => "unknown_tool_error",
            ErrorKind::SessionConflictError => "session_conflict_error",
            ErrorKind::BudgetExceededError => "budget_exceeded_error",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单次交换（一条用户消息）无法完成时的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 推理引擎不可用（网络、鉴权、限流等）
    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// 工具上游失败且已超过回灌次数
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Tool-call budget of {limit} exhausted")]
    BudgetExceeded { limit: usize },

    #[error("Session conflict persisted after {attempts} save attempts")]
    SessionConflict { attempts: usize },

    #[error("Session store error: {0}")]
    Store(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Validation(_) => ErrorKind::ValidationError,
            AgentError::Upstream(_) | AgentError::LlmError(_) => ErrorKind::UpstreamError,
            AgentError::BudgetExceeded { .. } => ErrorKind::BudgetExceededError,
            AgentError::SessionConflict { .. } => ErrorKind::SessionConflictError,
            AgentError::JsonParseError(_)
            | AgentError::Store(_)
            | AgentError::Cancelled
            | AgentError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// 展示给最终用户的简短说明；内部错误不暴露细节
    pub fn user_message(&self) -> String {
        match self {
            AgentError::Validation(msg) => msg.clone(),
            AgentError::Upstream(msg) => {
                format!("The GitHub/NPM service call failed: {msg}. Please try again later.")
            }
            AgentError::LlmError(_) => {
                "The reasoning service is unavailable right now. Please try again later."
                    .to_string()
            }
            AgentError::BudgetExceeded { limit } => format!(
                "I could not finish within {limit} tool calls. Try asking a narrower question."
            ),
            AgentError::SessionConflict { .. } => {
                "Your conversation was updated elsewhere at the same time. Please try again."
                    .to_string()
            }
            AgentError::Cancelled => "The request was cancelled.".to_string(),
            _ => "Something went wrong while processing your request.".to_string(),
        }
    }
}

impl From<StoreError> for AgentError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { .. } => AgentError::SessionConflict { attempts: 1 },
            StoreError::Backend(msg) => AgentError::Store(msg),
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug)]
pub enum RecoveryAction {
    /// 将提示注入下一轮，让 LLM 重试（如 JSON 格式错误）
    RetryWithPrompt(String),
    /// 把错误信封回灌给推理引擎，让其自行纠正
    FeedBack,
    /// 需要用户澄清（缺少或非法的仓库/包名）
    AskUser(String),
    /// 终止当前交换
    Abort(AgentError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_message_hides_detail() {
        let err = AgentError::Internal("db password=hunter2".to_string());
        assert_eq!(err.kind(), ErrorKind::InternalError);
        assert!(!err.user_message().contains("hunter2"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::SessionConflictError).unwrap();
        assert_eq!(json, "\"session_conflict_error\"");
        assert_eq!(ErrorKind::BudgetExceededError.to_string(), "budget_exceeded_error");
    }

    #[test]
    fn test_store_conflict_maps_to_session_conflict() {
        let err: AgentError = StoreError::Conflict { expected: 1, actual: 2 }.into();
        assert_eq!(err.kind(), ErrorKind::SessionConflictError);
    }
}
