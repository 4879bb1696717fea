//! 会话实体
//!
//! 每个 (channel, user_id) 一个 Session：有序的对话轮次、当前主题与单调递增的版本号。
//! 会话按交换加载与保存，不作为进程内常驻状态。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::SessionKey;
use super::subject::Subject;
use crate::tools::Envelope;

/// 轮次角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    Tool,
}

/// 一次工具调用记录，连同其信封写入 tool 轮次；记录后只有 issuing_turn 会随裁剪平移
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool: String,
    pub params: Value,
    pub subject: Option<Subject>,
    /// 发起该调用的用户轮次在 turns 中的下标；裁剪时随之平移
    pub issuing_turn: usize,
    pub envelope: Envelope,
}

/// 对话轮次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// user 轮次解析出的主题
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallRecord>,
}

impl Turn {
    pub fn user(content: impl Into<String>, subject: Option<Subject>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            timestamp: Utc::now(),
            subject,
            tool_call: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            subject: None,
            tool_call: None,
        }
    }

    /// tool 轮次：content 为信封 JSON
    pub fn tool(record: ToolCallRecord) -> Self {
        Self {
            role: TurnRole::Tool,
            content: record.envelope.to_json_string(),
            timestamp: Utc::now(),
            subject: None,
            tool_call: Some(record),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub key: SessionKey,
    pub turns: Vec<Turn>,
    pub active_subject: Option<Subject>,
    pub version: u64,
}

impl Session {
    /// 新会话，版本 0（首次保存前不落盘）
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            turns: Vec::new(),
            active_subject: None,
            version: 0,
        }
    }

    /// 超出 max_turns 时丢弃最旧轮次，并继续丢弃直到首条为 user 轮次，
    /// 保证保留的历史不以孤立的 tool/assistant 轮次开头。
    /// 最新一次交换（最后一个 user 轮次起）总是完整保留，即使因此超过 max_turns
    pub fn trim(&mut self, max_turns: usize) {
        if max_turns == 0 || self.turns.len() <= max_turns {
            return;
        }
        let Some(last_user) = self.turns.iter().rposition(|t| t.role == TurnRole::User) else {
            return;
        };
        let mut cut = self.turns.len() - max_turns;
        while cut < last_user && self.turns[cut].role != TurnRole::User {
            cut += 1;
        }
        let cut = cut.min(last_user);
        if cut == 0 {
            return;
        }
        self.turns.drain(..cut);
        for call in self.turns.iter_mut().filter_map(|t| t.tool_call.as_mut()) {
            call.issuing_turn = call.issuing_turn.saturating_sub(cut);
        }
    }

    /// 清空历史与主题（版本由存储层递增）
    pub fn clear(&mut self) {
        self.turns.clear();
        self.active_subject = None;
    }
}
