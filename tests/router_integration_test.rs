//! 查询路由集成测试：脚本化 LLM + wiremock 模拟的 GitHub API

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ossboss::core::{AgentError, ErrorKind};
use ossboss::gateway::{
    Channel, ExchangeRequest, MemorySessionStore, SessionKey, SessionStore, Subject, Turn, TurnRole,
};
use ossboss::llm::MockLlmClient;
use ossboss::react::{Decision, Planner, QueryRouter, ReactEvent, ReasoningEngine, RouterLimits};
use ossboss::tools::{
    register_github_tools, Envelope, GithubClient, ToolDescriptor, ToolErrorKind, ToolExecutor,
    ToolRegistry,
};
use serde_json::json;
use tokio::sync::{mpsc, Barrier};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn github_executor(server: &MockServer, timeout: Duration) -> Arc<ToolExecutor> {
    let client = GithubClient::new(&server.uri(), None, 5).unwrap();
    let mut registry = ToolRegistry::new();
    register_github_tools(&mut registry, Arc::new(client), false).unwrap();
    Arc::new(ToolExecutor::with_timeout(registry, timeout))
}

fn router_with(
    server: &MockServer,
    llm: Arc<MockLlmClient>,
    store: Arc<dyn SessionStore>,
    limits: RouterLimits,
    tool_timeout: Duration,
) -> QueryRouter {
    let planner = Planner::new(llm, "You answer questions about GitHub repositories.");
    QueryRouter::new(Arc::new(planner), github_executor(server, tool_timeout), store, limits)
}

fn router(server: &MockServer, llm: Arc<MockLlmClient>) -> QueryRouter {
    router_with(
        server,
        llm,
        Arc::new(MemorySessionStore::new(50)),
        RouterLimits::default(),
        Duration::from_secs(5),
    )
}

fn repo(s: &str) -> Subject {
    Subject::parse_explicit(s).unwrap()
}

fn contributors() -> serde_json::Value {
    json!([
        {"login": "sebmarkbage", "contributions": 1500},
        {"login": "gaearon", "contributions": 1800},
        {"login": "acdlite", "contributions": 1200},
        {"login": "sophiebits", "contributions": 900},
        {"login": "zpao", "contributions": 800},
        {"login": "trueadm", "contributions": 700},
        {"login": "rickhanlonii", "contributions": 600}
    ])
}

fn request_contains(llm: &MockLlmClient, call: usize, needle: &str) -> bool {
    llm.requests()
        .get(call)
        .map(|msgs| msgs.iter().any(|m| m.content.contains(needle)))
        .unwrap_or(false)
}

fn roles(turns: &[Turn]) -> Vec<TurnRole> {
    turns.iter().map(|t| t.role).collect()
}

#[tokio::test]
async fn test_top_contributors_for_named_repository() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/facebook/react/contributors"))
        .respond_with(ResponseTemplate::new(200).set_body_json(contributors()))
        .expect(1)
        .mount(&server)
        .await;

    let llm = Arc::new(MockLlmClient::with_replies([
        r#"{"tool": "get_top_contributors", "args": {"repo_path": "facebook/react", "limit": 5}}"#,
        "🏆 Top contributors of facebook/react: gaearon, sebmarkbage, acdlite, sophiebits, zpao",
    ]));
    let r = router(&server, llm.clone());

    let reply = r
        .handle(ExchangeRequest::new(
            Channel::Cli,
            "alice",
            "Who are the top 5 contributors to facebook/react?",
        ))
        .await
        .unwrap();

    assert!(!reply.clarification);
    assert_eq!(reply.tool_calls, 1);
    assert_eq!(reply.version, 1);
    assert_eq!(reply.subject, Some(repo("facebook/react")));
    assert!(reply.answer.contains("gaearon"));

    let session = r.store().load(&SessionKey::new(Channel::Cli, "alice")).await.unwrap();
    assert_eq!(roles(&session.turns), vec![TurnRole::User, TurnRole::Tool, TurnRole::Assistant]);
    let call = session.turns[1].tool_call.as_ref().unwrap();
    assert_eq!(call.tool, "get_top_contributors");
    assert_eq!(call.issuing_turn, 0);
    match &call.envelope {
        Envelope::Ok(v) => {
            let top = v["top_contributors"].as_array().unwrap();
            assert_eq!(top.len(), 5);
            assert_eq!(top[0]["login"], "gaearon");
        }
        other => panic!("expected ok envelope, got {other:?}"),
    }
    assert!(request_contains(&llm, 1, "Observation from get_top_contributors"));
}

#[tokio::test]
async fn test_follow_up_reuses_active_subject() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/facebook/react/contributors"))
        .respond_with(ResponseTemplate::new(200).set_body_json(contributors()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/facebook/react"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "react",
            "full_name": "facebook/react",
            "open_issues_count": 912,
            "stargazers_count": 230000
        })))
        .expect(1)
        .mount(&server)
        .await;

    let llm = Arc::new(MockLlmClient::with_replies([
        r#"{"tool": "get_top_contributors", "args": {"repo_path": "facebook/react"}}"#,
        "Here are the top contributors 🎉",
        r#"{"tool": "get_repository", "args": {}}"#,
        "facebook/react has 912 open issues 🐛",
    ]));
    let r = router(&server, llm.clone());

    r.handle(ExchangeRequest::new(Channel::Api, "bob", "top contributors of facebook/react"))
        .await
        .unwrap();
    let reply = r
        .handle(ExchangeRequest::new(Channel::Api, "bob", "How many open issues does it have?"))
        .await
        .unwrap();

    assert_eq!(reply.version, 2);
    assert_eq!(reply.subject, Some(repo("facebook/react")));
    assert!(reply.answer.contains("912"));

    let session = r.store().load(&SessionKey::new(Channel::Api, "bob")).await.unwrap();
    assert_eq!(session.turns.len(), 6);
    let call = session.turns[4].tool_call.as_ref().unwrap();
    assert_eq!(call.params["repo_path"], "facebook/react");
    assert_eq!(call.issuing_turn, 3);
    assert!(call.envelope.is_ok());
}

#[tokio::test]
async fn test_invalid_repository_asks_for_clarification() {
    let server = MockServer::start().await;
    let llm = Arc::new(MockLlmClient::with_replies([
        r#"{"tool": "get_repository", "args": {"repo_path": "not-a-valid-path"}}"#,
        "this reply must never be requested",
    ]));
    let r = router(&server, llm.clone());

    let reply = r
        .handle(ExchangeRequest::new(Channel::Telegram, "42", "Tell me about not-a-valid-path"))
        .await
        .unwrap();

    assert!(reply.clarification);
    assert!(reply.answer.contains("<owner>/<repo>"));
    assert_eq!(llm.call_count(), 1);
    assert!(server.received_requests().await.unwrap_or_default().is_empty());

    let session = r.store().load(&SessionKey::new(Channel::Telegram, "42")).await.unwrap();
    assert_eq!(roles(&session.turns), vec![TurnRole::User, TurnRole::Tool, TurnRole::Assistant]);
    let err = session.turns[1].tool_call.as_ref().unwrap().envelope.error().unwrap().clone();
    assert_eq!(err.kind, ToolErrorKind::ValidationError);
    assert_eq!(session.active_subject, None);
}

#[tokio::test]
async fn test_missing_subject_short_circuits_without_tool_call() {
    let server = MockServer::start().await;
    let llm = Arc::new(MockLlmClient::with_replies([
        r#"{"tool": "get_repository", "args": {}}"#,
    ]));
    let r = router(&server, llm.clone());

    let reply = r
        .handle(ExchangeRequest::new(Channel::Cli, "carol", "how many stars does it have?"))
        .await
        .unwrap();

    assert!(reply.clarification);
    assert_eq!(llm.call_count(), 1);
    let session = r.store().load(&SessionKey::new(Channel::Cli, "carol")).await.unwrap();
    assert_eq!(roles(&session.turns), vec![TurnRole::User, TurnRole::Assistant]);
}

#[tokio::test]
async fn test_upstream_timeout_fed_back_once_then_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/facebook/react"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"full_name": "facebook/react"}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let llm = Arc::new(MockLlmClient::with_replies([
        r#"{"tool": "get_repository", "args": {"repo_path": "facebook/react"}}"#,
        r#"{"tool": "get_repository", "args": {"repo_path": "facebook/react"}}"#,
        "this reply must never be requested",
    ]));
    let r = router_with(
        &server,
        llm.clone(),
        Arc::new(MemorySessionStore::new(50)),
        RouterLimits::default(),
        Duration::from_millis(200),
    );

    let err = r
        .handle(ExchangeRequest::new(Channel::Api, "dave", "describe facebook/react"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UpstreamError);
    assert!(matches!(err, AgentError::Upstream(_)));
    assert_eq!(llm.call_count(), 2);
    assert!(request_contains(&llm, 1, "timed out"));

    let session = r.store().load(&SessionKey::new(Channel::Api, "dave")).await.unwrap();
    assert_eq!(
        roles(&session.turns),
        vec![TurnRole::User, TurnRole::Tool, TurnRole::Tool, TurnRole::Assistant]
    );
}

#[tokio::test]
async fn test_budget_exceeded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/facebook/react"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"full_name": "facebook/react"})))
        .mount(&server)
        .await;

    let call = r#"{"tool": "get_repository", "args": {"repo_path": "facebook/react"}}"#;
    let llm = Arc::new(MockLlmClient::with_replies([call, call, call]));
    let limits = RouterLimits {
        max_tool_calls: 2,
        ..RouterLimits::default()
    };
    let r = router_with(
        &server,
        llm.clone(),
        Arc::new(MemorySessionStore::new(50)),
        limits,
        Duration::from_secs(5),
    );

    let err = r
        .handle(ExchangeRequest::new(Channel::Cli, "erin", "facebook/react?"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BudgetExceededError);
    assert_eq!(server.received_requests().await.unwrap_or_default().len(), 2);
}

#[tokio::test]
async fn test_unknown_tool_is_fed_back() {
    let server = MockServer::start().await;
    let llm = Arc::new(MockLlmClient::with_replies([
        r#"{"tool": "get_weather", "args": {"city": "Paris"}}"#,
        "I can only answer questions about GitHub and NPM 🙂",
    ]));
    let r = router(&server, llm.clone());

    let reply = r
        .handle(ExchangeRequest::new(Channel::Cli, "frank", "weather in Paris?"))
        .await
        .unwrap();
    assert!(reply.answer.contains("GitHub"));
    assert!(request_contains(&llm, 1, "Unknown tool"));

    let session = r.store().load(&SessionKey::new(Channel::Cli, "frank")).await.unwrap();
    let kind = session.turns[1].tool_call.as_ref().unwrap().envelope.error().unwrap().kind;
    assert_eq!(kind, ToolErrorKind::UnknownToolError);
}

#[tokio::test]
async fn test_llm_unavailable_is_reported() {
    let server = MockServer::start().await;
    let llm = Arc::new(MockLlmClient::new());
    llm.push_error("connection refused");
    let r = router(&server, llm);

    let err = r
        .handle(ExchangeRequest::new(Channel::Cli, "gina", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::LlmError(_)));
}

#[tokio::test]
async fn test_saves_are_monotonic() {
    let server = MockServer::start().await;
    let llm = Arc::new(MockLlmClient::with_replies(["one", "two", "three"]));
    let r = router(&server, llm);

    let mut versions = Vec::new();
    for msg in ["a", "b", "c"] {
        let reply = r.handle(ExchangeRequest::new(Channel::Cli, "henry", msg)).await.unwrap();
        versions.push(reply.version);
    }
    assert_eq!(versions, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_explicit_subject_resolution_is_idempotent() {
    let server = MockServer::start().await;
    let llm = Arc::new(MockLlmClient::with_replies(["first 👍", "second 👍"]));
    let r = router(&server, llm);

    for _ in 0..2 {
        let reply = r
            .handle(ExchangeRequest::new(Channel::Api, "iris", "summary please").with_subject("facebook/react"))
            .await
            .unwrap();
        assert_eq!(reply.subject, Some(repo("facebook/react")));
    }

    let session = r.store().load(&SessionKey::new(Channel::Api, "iris")).await.unwrap();
    assert_eq!(session.turns.len(), 4);
    assert_eq!(session.active_subject, Some(repo("facebook/react")));
    let user_subjects: Vec<_> = session
        .turns
        .iter()
        .filter(|t| t.role == TurnRole::User)
        .map(|t| t.subject.clone())
        .collect();
    assert_eq!(user_subjects, vec![Some(repo("facebook/react")); 2]);
}

#[tokio::test]
async fn test_slash_words_in_follow_up_keep_active_subject() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/facebook/react/issues"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"number": 31, "title": "useEffect fires twice", "state": "open", "body": "repro inside"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let llm = Arc::new(MockLlmClient::with_replies([
        "Hi! Ask me anything about facebook/react 👋",
        r#"{"tool": "get_issues_info", "args": {}}"#,
        "One open issue: useEffect fires twice 🐛",
    ]));
    let r = router(&server, llm.clone());

    r.handle(ExchangeRequest::new(Channel::Cli, "kim", "facebook/react: hi"))
        .await
        .unwrap();
    let reply = r
        .handle(ExchangeRequest::new(Channel::Cli, "kim", "Summarize recent issues and/or PRs"))
        .await
        .unwrap();
    assert_eq!(reply.subject, Some(repo("facebook/react")));

    let session = r.store().load(&SessionKey::new(Channel::Cli, "kim")).await.unwrap();
    assert_eq!(session.active_subject, Some(repo("facebook/react")));
    assert_eq!(session.turns[2].subject, None);
    let call = session.turns[3].tool_call.as_ref().unwrap();
    assert_eq!(call.params["repo_path"], "facebook/react");
    assert!(call.envelope.is_ok());
}

#[tokio::test]
async fn test_inline_candidate_committed_only_after_successful_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/tokio-rs/tokio"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "full_name": "tokio-rs/tokio",
            "stargazers_count": 27000
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Not Found"})))
        .mount(&server)
        .await;

    let llm = Arc::new(MockLlmClient::with_replies([
        r#"{"tool": "get_repository", "args": {}}"#,
        "I could not find acme/missing on GitHub 🤷",
        r#"{"tool": "get_repository", "args": {}}"#,
        "tokio-rs/tokio has 27k stars ⭐",
    ]));
    let r = router(&server, llm.clone());

    let reply = r
        .handle(ExchangeRequest::new(Channel::Api, "lee", "How is acme/missing doing?"))
        .await
        .unwrap();
    assert_eq!(reply.subject, None);
    let session = r.store().load(&SessionKey::new(Channel::Api, "lee")).await.unwrap();
    assert_eq!(session.active_subject, None);
    let call = session.turns[1].tool_call.as_ref().unwrap();
    assert_eq!(call.params["repo_path"], "acme/missing");
    assert_eq!(call.envelope.error().unwrap().kind, ToolErrorKind::UpstreamError);

    let reply = r
        .handle(ExchangeRequest::new(Channel::Api, "lee", "How active is tokio-rs/tokio lately?"))
        .await
        .unwrap();
    assert_eq!(reply.subject, Some(repo("tokio-rs/tokio")));
    let session = r.store().load(&SessionKey::new(Channel::Api, "lee")).await.unwrap();
    assert_eq!(session.active_subject, Some(repo("tokio-rs/tokio")));
}

/// 前两次 decide 在屏障处会合，保证两次交换读到同一版本
struct RacingEngine {
    barrier: Barrier,
    calls: AtomicUsize,
}

#[async_trait]
impl ReasoningEngine for RacingEngine {
    async fn decide(&self, _history: &[Turn], _tools: &[ToolDescriptor]) -> Result<Decision, AgentError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < 2 {
            self.barrier.wait().await;
        }
        Ok(Decision::Final(format!("answer {n}")))
    }
}

#[tokio::test]
async fn test_racing_exchanges_do_not_lose_updates() {
    let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new(50));
    let engine = Arc::new(RacingEngine {
        barrier: Barrier::new(2),
        calls: AtomicUsize::new(0),
    });
    let executor = Arc::new(ToolExecutor::new(ToolRegistry::new(), 5));
    let r = QueryRouter::new(engine.clone(), executor, store.clone(), RouterLimits::default());

    let (tx1, mut rx1) = mpsc::unbounded_channel();
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    let (a, b) = tokio::join!(
        r.handle_with(
            ExchangeRequest::new(Channel::Telegram, "7", "first"),
            CancellationToken::new(),
            Some(&tx1)
        ),
        r.handle_with(
            ExchangeRequest::new(Channel::Telegram, "7", "second"),
            CancellationToken::new(),
            Some(&tx2)
        ),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    let mut versions = vec![a.version, b.version];
    versions.sort();
    assert_eq!(versions, vec![1, 2]);
    assert_eq!(engine.calls.load(Ordering::SeqCst), 2);

    drop((tx1, tx2));
    let mut conflicts = 0;
    for rx in [&mut rx1, &mut rx2] {
        while let Some(ev) = rx.recv().await {
            if matches!(ev, ReactEvent::SaveConflict { .. }) {
                conflicts += 1;
            }
        }
    }
    assert_eq!(conflicts, 1);

    let session = store.load(&SessionKey::new(Channel::Telegram, "7")).await.unwrap();
    assert_eq!(session.version, 2);
    assert_eq!(
        roles(&session.turns),
        vec![TurnRole::User, TurnRole::Assistant, TurnRole::User, TurnRole::Assistant]
    );
    let mut contents: Vec<_> = session
        .turns
        .iter()
        .filter(|t| t.role == TurnRole::User)
        .map(|t| t.content.as_str())
        .collect();
    contents.sort();
    assert_eq!(contents, vec!["first", "second"]);
}

#[cfg(feature = "async-sqlite")]
#[tokio::test]
async fn test_racing_routers_share_one_sqlite_database() {
    use ossboss::gateway::SqliteSessionStore;

    let temp_dir = tempfile::TempDir::new().unwrap();
    let db_path = temp_dir.path().join("sessions.db");
    // 两个独立连接池，相当于两个进程共享同一个数据库文件
    let store_a: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(&db_path, 50).await.unwrap());
    let store_b: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(&db_path, 50).await.unwrap());

    let engine = Arc::new(RacingEngine {
        barrier: Barrier::new(2),
        calls: AtomicUsize::new(0),
    });
    let router_a = QueryRouter::new(
        engine.clone(),
        Arc::new(ToolExecutor::new(ToolRegistry::new(), 5)),
        store_a.clone(),
        RouterLimits::default(),
    );
    let router_b = QueryRouter::new(
        engine.clone(),
        Arc::new(ToolExecutor::new(ToolRegistry::new(), 5)),
        store_b,
        RouterLimits::default(),
    );

    let (a, b) = tokio::join!(
        router_a.handle(ExchangeRequest::new(Channel::Cli, "shared", "from cli")),
        router_b.handle(ExchangeRequest::new(Channel::Cli, "shared", "from bot")),
    );
    let mut versions = vec![a.unwrap().version, b.unwrap().version];
    versions.sort();
    assert_eq!(versions, vec![1, 2]);

    let session = store_a.load(&SessionKey::new(Channel::Cli, "shared")).await.unwrap();
    assert_eq!(session.version, 2);
    assert_eq!(
        roles(&session.turns),
        vec![TurnRole::User, TurnRole::Assistant, TurnRole::User, TurnRole::Assistant]
    );
    let mut contents: Vec<_> = session
        .turns
        .iter()
        .filter(|t| t.role == TurnRole::User)
        .map(|t| t.content.clone())
        .collect();
    contents.sort();
    assert_eq!(contents, vec!["from bot".to_string(), "from cli".to_string()]);
}

/// 永远不返回的推理引擎
struct StuckEngine;

#[async_trait]
impl ReasoningEngine for StuckEngine {
    async fn decide(&self, _history: &[Turn], _tools: &[ToolDescriptor]) -> Result<Decision, AgentError> {
        std::future::pending::<()>().await;
        Ok(Decision::Final(String::new()))
    }
}

#[tokio::test]
async fn test_cancelled_exchange_commits_nothing() {
    let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new(50));
    let r = QueryRouter::new(
        Arc::new(StuckEngine),
        Arc::new(ToolExecutor::new(ToolRegistry::new(), 5)),
        store.clone(),
        RouterLimits::default(),
    );

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = r
        .handle_with(ExchangeRequest::new(Channel::Api, "zoe", "hello"), token, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Cancelled));

    let session = store.load(&SessionKey::new(Channel::Api, "zoe")).await.unwrap();
    assert_eq!(session.version, 0);
    assert!(session.turns.is_empty());
}
