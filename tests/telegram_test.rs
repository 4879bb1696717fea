//! Telegram Bot 集成测试：wiremock 模拟 Bot API
#![cfg(feature = "telegram")]

use std::sync::Arc;

use ossboss::config::TelegramSection;
use ossboss::gateway::{Channel, MemorySessionStore, SessionKey};
use ossboss::integrations::telegram::{TelegramBot, Update};
use ossboss::llm::MockLlmClient;
use ossboss::react::{Planner, QueryRouter, RouterLimits};
use ossboss::tools::{ToolExecutor, ToolRegistry};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn bot(server: &MockServer, llm: Arc<MockLlmClient>) -> (TelegramBot, Arc<QueryRouter>) {
    let router = Arc::new(QueryRouter::new(
        Arc::new(Planner::new(llm, "instructions")),
        Arc::new(ToolExecutor::new(ToolRegistry::new(), 5)),
        Arc::new(MemorySessionStore::new(50)),
        RouterLimits::default(),
    ));
    let cfg = TelegramSection {
        api_base: server.uri(),
        poll_timeout_secs: 1,
        ..TelegramSection::default()
    };
    (TelegramBot::new(router.clone(), "TOKEN", &cfg).unwrap(), router)
}

fn update(text: &str) -> Update {
    serde_json::from_value(json!({
        "update_id": 10,
        "message": {
            "message_id": 1,
            "chat": {"id": 555},
            "from": {"id": 777},
            "text": text
        }
    }))
    .unwrap()
}

fn ok_body() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": true}))
}

#[tokio::test]
async fn test_start_command_greets() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/sendMessage"))
        .and(body_partial_json(json!({"chat_id": 555})))
        .respond_with(ok_body())
        .expect(1)
        .mount(&server)
        .await;

    let llm = Arc::new(MockLlmClient::new());
    let (bot, _) = bot(&server, llm.clone());
    bot.process_update(update("/start")).await.unwrap();
    assert_eq!(llm.call_count(), 0);
}

#[tokio::test]
async fn test_message_sends_typing_then_split_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/sendChatAction"))
        .and(body_partial_json(json!({"chat_id": 555, "action": "typing"})))
        .respond_with(ok_body())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/sendMessage"))
        .respond_with(ok_body())
        .expect(2)
        .mount(&server)
        .await;

    let long_answer = "📦".repeat(5000);
    let llm = Arc::new(MockLlmClient::with_replies([long_answer]));
    let (bot, router) = bot(&server, llm);
    bot.process_update(update("tell me about npm:react")).await.unwrap();

    let session = router
        .store()
        .load(&SessionKey::new(Channel::Telegram, "777"))
        .await
        .unwrap();
    assert_eq!(session.version, 1);
    assert_eq!(session.turns.len(), 2);
}

#[tokio::test]
async fn test_reset_command_clears_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/sendChatAction"))
        .respond_with(ok_body())
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/sendMessage"))
        .respond_with(ok_body())
        .mount(&server)
        .await;

    let llm = Arc::new(MockLlmClient::with_replies(["hello 👋"]));
    let (bot, router) = bot(&server, llm);
    bot.process_update(update("hi")).await.unwrap();
    bot.process_update(update("/reset")).await.unwrap();

    let session = router
        .store()
        .load(&SessionKey::new(Channel::Telegram, "777"))
        .await
        .unwrap();
    assert!(session.turns.is_empty());
    assert_eq!(session.version, 2);
}

#[tokio::test]
async fn test_conflict_stops_polling() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/getUpdates"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "ok": false,
            "error_code": 409,
            "description": "Conflict: terminated by other getUpdates request"
        })))
        .mount(&server)
        .await;

    let (bot, _) = bot(&server, Arc::new(MockLlmClient::new()));
    let result = Arc::new(bot).run(CancellationToken::new()).await;
    assert!(result.unwrap_err().to_string().contains("conflict"));
}
