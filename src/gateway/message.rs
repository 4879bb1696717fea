//! 通道与交换消息
//!
//! 三个前端（CLI / HTTP API / Telegram）都把请求转成 ExchangeRequest 交给 QueryRouter。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::subject::Subject;

/// 前端通道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Cli,
    Api,
    Telegram,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Cli => "cli",
            Channel::Api => "api",
            Channel::Telegram => "telegram",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cli" => Ok(Channel::Cli),
            "api" => Ok(Channel::Api),
            "telegram" => Ok(Channel::Telegram),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// 会话键：(channel, user_id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub channel: Channel,
    pub user_id: String,
}

impl SessionKey {
    pub fn new(channel: Channel, user_id: impl Into<String>) -> Self {
        Self {
            channel,
            user_id: user_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.user_id)
    }
}

/// 通道适配器提交的一次交换
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    pub channel: Channel,
    pub user_id: String,
    pub message: String,
    /// 显式指定的仓库（owner/repo）或包名
    #[serde(default)]
    pub explicit_subject: Option<String>,
}

impl ExchangeRequest {
    pub fn new(channel: Channel, user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            channel,
            user_id: user_id.into(),
            message: message.into(),
            explicit_subject: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.explicit_subject = Some(subject.into());
        self
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.channel, self.user_id.clone())
    }
}

/// 交换结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeReply {
    pub answer: String,
    /// true 表示这是向用户请求澄清（缺少或非法的仓库/包名）
    pub clarification: bool,
    /// 本次交换中推理引擎发起的工具调用数
    pub tool_calls: usize,
    /// 提交后的会话版本
    pub version: u64,
    pub subject: Option<Subject>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_round_trip() {
        for c in [Channel::Cli, Channel::Api, Channel::Telegram] {
            assert_eq!(c.as_str().parse::<Channel>().unwrap(), c);
        }
        assert!("slack".parse::<Channel>().is_err());
        assert_eq!(serde_json::to_string(&Channel::Telegram).unwrap(), "\"telegram\"");
    }
}
