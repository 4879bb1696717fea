//! Agent 组装
//!
//! 供各前端（CLI、HTTP API、Telegram）共享的无界面 Agent：
//! build_router 从配置构建 LLM / 工具注册表 / 会话存储，组装成一个 QueryRouter。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::config::AppConfig;
use crate::gateway::create_session_store;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::react::{Planner, QueryRouter};
use crate::tools::{
    register_github_tools, register_npm_tools, GithubClient, NpmClient, ToolExecutor, ToolRegistry,
};

/// 内置系统指令（config/prompts/system.md 不存在时使用）
pub const DEFAULT_INSTRUCTIONS: &str = "\
You are OSS Boss, an assistant that answers questions about GitHub repositories and NPM packages.
- Use your tools to answer questions about any GitHub repository.
- If the user question does not specify a repository in the format <owner>/<repo>, ask them to clarify.
- You can analyze contributors, repositories, issues, pull requests and code.
- Do not create any issues, comments, labels or pull requests unless explicitly asked to do so.
- You can also search for NPM packages and report their versions, downloads and scores.
- Please liven up the response with emojis and other visual elements.";

/// 读取系统指令：配置指定的文件 → config/prompts/system.md → 内置指令
pub fn load_instructions(configured: Option<&Path>) -> String {
    let candidates = configured
        .map(|p| p.to_path_buf())
        .into_iter()
        .chain(
            ["config/prompts/system.md", "../config/prompts/system.md"]
                .into_iter()
                .map(PathBuf::from),
        );
    for path in candidates {
        if let Ok(text) = std::fs::read_to_string(&path) {
            if !text.trim().is_empty() {
                tracing::debug!("Loaded instructions from {:?}", path);
                return text;
            }
        }
    }
    DEFAULT_INSTRUCTIONS.to_string()
}

/// 按 [llm].provider 选择后端；openai 缺少 Key 时退回 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = cfg
        .llm
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .filter(|k| !k.trim().is_empty());

    match (provider.as_str(), api_key) {
        ("mock", _) => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient::new())
        }
        (_, Some(key)) => {
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
            let mut client = OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, Some(&key));
            if let Some(t) = cfg.llm.temperature {
                client = client.with_temperature(t);
            }
            Arc::new(client)
        }
        (_, None) => {
            tracing::warn!("No API key set or provider unknown, using Mock LLM");
            Arc::new(MockLlmClient::new())
        }
    }
}

/// 注册 GitHub 与 NPM 工具集
pub fn build_registry(cfg: &AppConfig) -> anyhow::Result<ToolRegistry> {
    let token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.trim().is_empty());
    if token.is_none() {
        tracing::warn!("GITHUB_TOKEN not set, GitHub requests are unauthenticated and rate limited");
    }
    let github = GithubClient::new(&cfg.tools.github.api_base, token, cfg.tools.http_timeout_secs)
        .context("Failed to build GitHub client")?;
    let npm = NpmClient::new(
        &cfg.tools.npm.registry_base,
        &cfg.tools.npm.downloads_base,
        &cfg.tools.npm.npms_base,
        cfg.tools.http_timeout_secs,
    )
    .context("Failed to build NPM client")?;

    let mut registry = ToolRegistry::new();
    register_github_tools(&mut registry, Arc::new(github), cfg.tools.github.allow_writes)?;
    register_npm_tools(&mut registry, Arc::new(npm))?;
    tracing::info!(
        tools = registry.len(),
        allow_writes = cfg.tools.github.allow_writes,
        "Tool registry ready"
    );
    Ok(registry)
}

/// 从配置构建共享的 QueryRouter
pub async fn build_router(cfg: &AppConfig) -> anyhow::Result<Arc<QueryRouter>> {
    let llm = create_llm_from_config(cfg);
    build_router_with_llm(cfg, llm).await
}

/// 使用给定的 LLM 构建 QueryRouter（测试与离线运行用）
pub async fn build_router_with_llm(
    cfg: &AppConfig,
    llm: Arc<dyn LlmClient>,
) -> anyhow::Result<Arc<QueryRouter>> {
    let instructions = load_instructions(cfg.app.instructions_path.as_deref());
    let planner = Planner::new(llm, instructions).with_max_observation_chars(cfg.llm.max_observation_chars);
    let executor = ToolExecutor::new(build_registry(cfg)?, cfg.tools.tool_timeout_secs);
    let store = create_session_store(&cfg.storage, cfg.agent.max_turns).await;

    Ok(Arc::new(QueryRouter::new(
        Arc::new(planner),
        Arc::new(executor),
        store,
        cfg.agent.limits(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Channel, ExchangeRequest};

    #[test]
    fn test_instructions_fallback() {
        let text = load_instructions(Some(Path::new("/nonexistent/prompt.md")));
        assert!(text.contains("<owner>/<repo>"));
    }

    #[test]
    fn test_write_tools_follow_config() {
        let mut cfg = AppConfig::default();
        let read_only = build_registry(&cfg).unwrap();
        assert!(read_only.descriptor("comment_on_issue").is_none());
        cfg.tools.github.allow_writes = true;
        let full = build_registry(&cfg).unwrap();
        assert!(full.descriptor("comment_on_issue").is_some());
        assert_eq!(full.len(), read_only.len() + 3);
    }

    #[tokio::test]
    async fn test_mock_router_answers() {
        let mut cfg = AppConfig::default();
        cfg.storage.backend = "memory".to_string();
        let llm = Arc::new(MockLlmClient::with_replies(["Hi there! 👋"]));
        let router = build_router_with_llm(&cfg, llm).await.unwrap();
        let reply = router
            .handle(ExchangeRequest::new(Channel::Cli, "alice", "hello"))
            .await
            .unwrap();
        assert_eq!(reply.answer, "Hi there! 👋");
        assert_eq!(reply.version, 1);
    }
}
