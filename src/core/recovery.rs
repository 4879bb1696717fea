//! 错误恢复引擎
//!
//! 把推理错误与工具错误信封映射为 RecoveryAction，QueryRouter 据此决定
//! 是让 LLM 重试、回灌错误、向用户请求澄清还是终止交换。

use crate::core::{AgentError, RecoveryAction};
use crate::tools::{ToolError, ToolErrorKind};

/// 语义化错误恢复：将错误映射为可执行动作（重试提示 / 回灌 / 问用户 / 终止）
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 推理阶段的错误：JSON 格式错误给出纠正提示，其余终止
    pub fn handle(&self, err: AgentError) -> RecoveryAction {
        match err {
            AgentError::JsonParseError(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous reply was not a valid tool call: {raw}. \
                 When calling a tool you must output exactly one JSON object and nothing else, \
                 in the form {{\"tool\": \"<tool name>\", \"args\": {{...}}}}. \
                 For example: {{\"tool\": \"get_repository\", \"args\": {{\"repo_path\": \"facebook/react\"}}}}. \
                 If you do not need a tool, answer in plain text."
            )),
            other => RecoveryAction::Abort(other),
        }
    }

    /// 工具返回错误信封时的动作
    ///
    /// `upstream_failures` 为本次交换中（含这一次）的上游失败次数；超过 `feedback_limit` 后终止。
    pub fn on_tool_error(
        &self,
        error: &ToolError,
        upstream_failures: usize,
        feedback_limit: usize,
    ) -> RecoveryAction {
        match error.kind {
            ToolErrorKind::ValidationError => RecoveryAction::AskUser(format!(
                "{}. Please check the repository (<owner>/<repo>), package name or number in your question and ask again.",
                error.message.trim_end_matches('.')
            )),
            ToolErrorKind::UpstreamError if upstream_failures > feedback_limit => {
                RecoveryAction::Abort(AgentError::Upstream(error.message.clone()))
            }
            ToolErrorKind::UpstreamError
            | ToolErrorKind::UnknownToolError
            | ToolErrorKind::InternalError => RecoveryAction::FeedBack,
        }
    }
}
