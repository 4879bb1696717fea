//! Planner：推理引擎与 Tool Call 解析
//!
//! 把会话历史渲染为对话消息，调用 LLM 得到回复；parse_llm_output 从文本中提取 JSON，
//! 解析为工具调用或最终回答。JSON 格式错误时按 RecoveryEngine 的提示重问一次。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::gateway::{Turn, TurnRole};
use crate::llm::{LlmClient, Message};
use crate::tools::{descriptors_schema_json, tool_call_schema_json, ToolDescriptor};

/// 观察内容默认最大字符数
pub const DEFAULT_MAX_OBSERVATION_CHARS: usize = 6000;

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// LLM 请求的工具调用（{"tool": "get_repository", "args": {"repo_path": "..."}}）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub tool: String,
    #[serde(rename = "args", alias = "params", default = "empty_object")]
    pub params: Value,
}

/// 推理引擎的决定
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    ToolCall(ToolCallRequest),
    Final(String),
}

/// 推理引擎：根据历史与可用工具给出下一步
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    async fn decide(&self, history: &[Turn], tools: &[ToolDescriptor]) -> Result<Decision, AgentError>;
}

fn fenced_json(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let rest = &text[start + 3..];
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let end = rest.find("```").unwrap_or(rest.len());
    let inner = rest[..end].trim();
    inner.starts_with('{').then_some(inner)
}

fn parse_call(json_str: &str) -> Result<ToolCallRequest, AgentError> {
    serde_json::from_str(json_str).map_err(|e| AgentError::JsonParseError(format!("{e}: {json_str}")))
}

/// 解析 LLM 输出
///
/// - 以 `{` 开头或 ```json 代码块：必须是合法的工具调用，否则 JsonParseError
/// - 正文中嵌有 `{"tool"`：尝试解析，失败则整体作为回答
/// - 其余为最终回答
pub fn parse_llm_output(output: &str) -> Result<Decision, AgentError> {
    let trimmed = output.trim();

    let strict = if trimmed.starts_with('{') {
        Some(&trimmed[..=trimmed.rfind('}').unwrap_or(trimmed.len() - 1)])
    } else {
        fenced_json(trimmed)
    };

    let call = match strict {
        Some(json_str) => parse_call(json_str)?,
        None => {
            let embedded = trimmed
                .find("{\"tool\"")
                .and_then(|start| trimmed.rfind('}').map(|end| (start, end)))
                .filter(|(start, end)| end > start)
                .and_then(|(start, end)| parse_call(&trimmed[start..=end]).ok());
            match embedded {
                Some(call) => call,
                None => return Ok(Decision::Final(trimmed.to_string())),
            }
        }
    };

    if call.tool.trim().is_empty() {
        Ok(Decision::Final(trimmed.to_string()))
    } else {
        Ok(Decision::ToolCall(call))
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}... (truncated)", s.chars().take(max).collect::<String>())
    }
}

/// 基于 LLM 的推理引擎
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    instructions: String,
    max_observation_chars: usize,
    recovery: RecoveryEngine,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, instructions: impl Into<String>) -> Self {
        Self {
            llm,
            instructions: instructions.into(),
            max_observation_chars: DEFAULT_MAX_OBSERVATION_CHARS,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn with_max_observation_chars(mut self, max: usize) -> Self {
        self.max_observation_chars = max.max(1);
        self
    }

    /// 拼接 system prompt：基础指令 + 工具列表 + 调用格式
    pub fn system_prompt(&self, tools: &[ToolDescriptor]) -> String {
        format!(
            "{}\n\n## Available tools\n{}\n\n## Calling a tool\n\
             To call a tool, reply with ONLY one JSON object matching this schema, with no other text:\n{}\n\
             Each tool result comes back as an observation: {{\"ok\": <data>}} on success or \
             {{\"error\": {{\"kind\": ..., \"message\": ...}}}} on failure.\n\
             When you have enough information, answer the user directly in Markdown.",
            self.instructions.trim(),
            descriptors_schema_json(tools),
            tool_call_schema_json()
        )
    }

    /// 把会话轮次渲染为对话消息
    pub fn render_history(&self, history: &[Turn]) -> Vec<Message> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        for turn in history {
            match turn.role {
                TurnRole::User => {
                    let content = match &turn.subject {
                        Some(s) if !turn.content.contains(&s.param_value()) => {
                            format!("[subject: {s}] {}", turn.content)
                        }
                        _ => turn.content.clone(),
                    };
                    messages.push(Message::user(content));
                }
                TurnRole::Assistant => messages.push(Message::assistant(turn.content.clone())),
                TurnRole::Tool => {
                    let (tool, params) = turn
                        .tool_call
                        .as_ref()
                        .map(|c| (c.tool.as_str(), c.params.to_string()))
                        .unwrap_or(("unknown", "{}".to_string()));
                    messages.push(Message::assistant(format!("Tool call: {tool} {params}")));
                    messages.push(Message::user(format!(
                        "Observation from {tool}: {}",
                        truncate_chars(&turn.content, self.max_observation_chars)
                    )));
                }
            }
        }
        messages
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, AgentError> {
        let output = self.llm.complete(messages).await.map_err(AgentError::LlmError)?;
        let (prompt_tokens, completion_tokens, total_tokens) = self.llm.token_usage();
        tracing::debug!(
            messages = messages.len(),
            prompt_tokens,
            completion_tokens,
            total_tokens,
            "llm completion (cumulative token usage)"
        );
        Ok(output)
    }
}

#[async_trait]
impl ReasoningEngine for Planner {
    async fn decide(&self, history: &[Turn], tools: &[ToolDescriptor]) -> Result<Decision, AgentError> {
        let mut messages = vec![Message::system(self.system_prompt(tools))];
        messages.extend(self.render_history(history));

        let output = self.complete(&messages).await?;
        match parse_llm_output(&output) {
            Ok(decision) => Ok(decision),
            Err(err) => match self.recovery.handle(err) {
                RecoveryAction::RetryWithPrompt(prompt) => {
                    tracing::warn!("Malformed tool call from LLM, asking once more");
                    messages.push(Message::assistant(output));
                    messages.push(Message::user(prompt));
                    let retry = self.complete(&messages).await?;
                    parse_llm_output(&retry).map_err(|e| {
                        AgentError::LlmError(format!("model produced a malformed tool call twice: {e}"))
                    })
                }
                RecoveryAction::Abort(e) => Err(e),
                _ => Err(AgentError::Internal("unexpected recovery action".to_string())),
            },
        }
    }
}
