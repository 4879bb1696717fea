//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! 按顺序返回预置回复；预置回复用完后回显最后一条 User 消息作为最终回答。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置回复序列
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::new();
        for r in replies {
            client.push_reply(r);
        }
        client
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(Ok(reply.into()));
        }
    }

    /// 预置一次失败（模拟 LLM 不可用）
    pub fn push_error(&self, error: impl Into<String>) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(Err(error.into()));
        }
    }

    /// 已收到的请求次数
    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// 已收到的全部请求（每次为完整消息列表）
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(messages.to_vec());
        }

        let scripted = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        if let Some(reply) = scripted {
            return reply;
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(format!("Echo from Mock: {last_user}"))
    }
}
