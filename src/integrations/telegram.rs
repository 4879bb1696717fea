//! Telegram Bot（长轮询）
//!
//! getUpdates 拉取消息，每条更新在独立任务中处理：/start 问候、/reset 清空会话，
//! 其它文本先发送 typing 动作，再交给 QueryRouter，回复按 4096 字符分段发送。
//! getUpdates 返回 409（另一实例在轮询同一个 Bot）时停止。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::TelegramSection;
use crate::gateway::{Channel, ExchangeRequest, SessionKey};
use crate::react::QueryRouter;
use crate::tools::http::build_client;

/// Telegram 单条消息的最大长度
pub const MAX_MESSAGE_CHARS: usize = 4096;

const GREETING: &str =
    "Hello! I am the OSS Boss bot 🤖 Ask me anything about GitHub repositories (<owner>/<repo>) or NPM packages!";

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("Telegram conflict: another instance is already polling this bot")]
    Conflict,
    #[error("Telegram request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Telegram API error: {0}")]
    Api(String),
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<TgMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TgMessage {
    pub message_id: i64,
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct User {
    pub id: i64,
}

/// 按字符切分为不超过 max 的片段
pub fn split_message(text: &str, max: usize) -> Vec<String> {
    if text.chars().count() <= max {
        return vec![text.to_string()];
    }
    text.chars()
        .collect::<Vec<_>>()
        .chunks(max.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

pub struct TelegramBot {
    http: reqwest::Client,
    /// {api_base}/bot{token}
    endpoint: String,
    router: Arc<QueryRouter>,
    poll_timeout_secs: u64,
    request_timeout: Duration,
}

impl TelegramBot {
    pub fn new(router: Arc<QueryRouter>, token: &str, cfg: &TelegramSection) -> anyhow::Result<Self> {
        if token.trim().is_empty() {
            anyhow::bail!("TELEGRAM_BOT_TOKEN environment variable not set");
        }
        Ok(Self {
            http: build_client(cfg.poll_timeout_secs + 10)?,
            endpoint: format!("{}/bot{}", cfg.api_base.trim_end_matches('/'), token),
            router,
            poll_timeout_secs: cfg.poll_timeout_secs,
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, TelegramError> {
        let resp = self
            .http
            .post(format!("{}/{}", self.endpoint, method))
            .json(&body)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Err(TelegramError::Conflict);
        }
        let status = resp.status();
        let parsed: ApiResponse<T> = resp.json().await?;
        match (parsed.ok, parsed.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(TelegramError::Api(
                parsed
                    .description
                    .unwrap_or_else(|| format!("{} returned HTTP {}", method, status)),
            )),
        }
    }

    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TelegramError> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": self.poll_timeout_secs,
                "allowed_updates": ["message"],
            }),
        )
        .await
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            let _: serde_json::Value = self
                .call("sendMessage", json!({ "chat_id": chat_id, "text": chunk }))
                .await?;
        }
        Ok(())
    }

    async fn send_typing(&self, chat_id: i64) -> Result<(), TelegramError> {
        let _: serde_json::Value = self
            .call("sendChatAction", json!({ "chat_id": chat_id, "action": "typing" }))
            .await?;
        Ok(())
    }

    /// 处理单条更新；失败只影响这一条消息
    pub async fn process_update(&self, update: Update) -> Result<(), TelegramError> {
        let Some(message) = update.message else {
            return Ok(());
        };
        let Some(text) = message.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(());
        };
        let chat_id = message.chat.id;
        let user_id = message.from.as_ref().map(|u| u.id).unwrap_or(chat_id).to_string();

        if text.starts_with("/start") {
            return self.send_message(chat_id, GREETING).await;
        }
        if text.starts_with("/reset") {
            let reply = match self.router.reset(&SessionKey::new(Channel::Telegram, &user_id)).await {
                Ok(_) => "Conversation cleared 🧹".to_string(),
                Err(e) => e.user_message(),
            };
            return self.send_message(chat_id, &reply).await;
        }
        if text.starts_with('/') {
            return Ok(());
        }

        if let Err(e) = self.send_typing(chat_id).await {
            tracing::debug!("Failed to send typing action: {}", e);
        }

        let token = CancellationToken::new();
        let request = ExchangeRequest::new(Channel::Telegram, user_id, text);
        let exchange = self.router.handle_with(request, token.clone(), None);
        let reply = match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(Ok(reply)) => reply.answer,
            Ok(Err(e)) => {
                tracing::error!(chat_id, "Error handling message: {}", e);
                e.user_message()
            }
            Err(_) => {
                token.cancel();
                tracing::warn!(chat_id, "Exchange exceeded its deadline");
                "Sorry, that took too long. Please try again ⏳".to_string()
            }
        };
        self.send_message(chat_id, &reply).await
    }

    /// 长轮询主循环；409 冲突返回错误，shutdown 取消时正常返回
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        tracing::info!("Starting Telegram bot...");
        let mut offset = 0i64;
        loop {
            let updates = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.get_updates(offset) => r,
            };
            match updates {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        let bot = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = bot.process_update(update).await {
                                tracing::error!("Failed to process Telegram update: {}", e);
                            }
                        });
                    }
                }
                Err(TelegramError::Conflict) => {
                    tracing::error!("Telegram conflict error: another instance is already running");
                    return Err(TelegramError::Conflict.into());
                }
                Err(e) => {
                    tracing::warn!("getUpdates failed: {}, retrying", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    }
                }
            }
        }
        tracing::info!("Telegram bot stopped");
        Ok(())
    }
}
