//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `OSSBOSS__*` 覆盖（双下划线表示嵌套，如 `OSSBOSS__LLM__PROVIDER=mock`）。
//! 密钥不写入配置文件：GITHUB_TOKEN、OPENAI_API_KEY、TELEGRAM_BOT_TOKEN 直接读环境变量。

use std::path::PathBuf;

use serde::Deserialize;

use crate::react::RouterLimits;
use crate::tools::{github, npm};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub agent: AgentSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub storage: StorageSection,
    pub api: ApiSection,
    pub telegram: TelegramSection,
}

/// [app] 段：应用名与系统指令文件
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 系统指令文件（Markdown），未设置或不存在时使用内置指令
    pub instructions_path: Option<PathBuf>,
}

/// [agent] 段：单次交换的限制与会话保留轮数
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: usize,
    #[serde(default = "default_save_retries")]
    pub save_retries: usize,
    #[serde(default = "default_upstream_feedback_limit")]
    pub upstream_feedback_limit: usize,
    /// 会话保留的最大轮次数；至少要容纳一次完整交换（user + 全部工具调用 + assistant）
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

fn default_max_tool_calls() -> usize {
    6
}

fn default_save_retries() -> usize {
    3
}

fn default_upstream_feedback_limit() -> usize {
    1
}

fn default_max_turns() -> usize {
    40
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_tool_calls: default_max_tool_calls(),
            save_retries: default_save_retries(),
            upstream_feedback_limit: default_upstream_feedback_limit(),
            max_turns: default_max_turns(),
        }
    }
}

impl AgentSection {
    pub fn limits(&self) -> RouterLimits {
        RouterLimits {
            max_tool_calls: self.max_tool_calls,
            save_retries: self.save_retries,
            upstream_feedback_limit: self.upstream_feedback_limit,
        }
    }

    /// 保留窗口必须放得下一次完整交换
    pub fn validate(&self) -> Result<(), String> {
        let min_turns = self.max_tool_calls + 2;
        if self.max_turns < min_turns {
            return Err(format!(
                "agent.max_turns = {} is too small: must be at least agent.max_tool_calls + 2 = {}",
                self.max_turns, min_turns
            ));
        }
        Ok(())
    }
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读 OPENAI_API_KEY
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    /// 回灌给模型的单条工具结果最大字符数
    #[serde(default = "default_max_observation_chars")]
    pub max_observation_chars: usize,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_observation_chars() -> usize {
    crate::react::planner::DEFAULT_MAX_OBSERVATION_CHARS
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: None,
            temperature: None,
            max_observation_chars: default_max_observation_chars(),
        }
    }
}

/// [tools] 段：工具超时与各 API 端点
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 单个 HTTP 请求超时（秒）
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub github: GithubSection,
    #[serde(default)]
    pub npm: NpmSection,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_http_timeout_secs() -> u64 {
    20
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            github: GithubSection::default(),
            npm: NpmSection::default(),
        }
    }
}

/// [tools.github] 段
#[derive(Debug, Clone, Deserialize)]
pub struct GithubSection {
    #[serde(default = "default_github_api_base")]
    pub api_base: String,
    /// 是否注册评论、打标签等写操作
    #[serde(default)]
    pub allow_writes: bool,
}

fn default_github_api_base() -> String {
    github::DEFAULT_API_BASE.to_string()
}

impl Default for GithubSection {
    fn default() -> Self {
        Self {
            api_base: default_github_api_base(),
            allow_writes: false,
        }
    }
}

/// [tools.npm] 段
#[derive(Debug, Clone, Deserialize)]
pub struct NpmSection {
    #[serde(default = "default_npm_registry_base")]
    pub registry_base: String,
    #[serde(default = "default_npm_downloads_base")]
    pub downloads_base: String,
    #[serde(default = "default_npms_base")]
    pub npms_base: String,
}

fn default_npm_registry_base() -> String {
    npm::DEFAULT_REGISTRY_BASE.to_string()
}

fn default_npm_downloads_base() -> String {
    npm::DEFAULT_DOWNLOADS_BASE.to_string()
}

fn default_npms_base() -> String {
    npm::DEFAULT_NPMS_BASE.to_string()
}

impl Default for NpmSection {
    fn default() -> Self {
        Self {
            registry_base: default_npm_registry_base(),
            downloads_base: default_npm_downloads_base(),
            npms_base: default_npms_base(),
        }
    }
}

/// [storage] 段：会话存储后端
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    /// sqlite / memory
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_backend() -> String {
    "sqlite".to_string()
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/sessions.db")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: default_storage_path(),
        }
    }
}

/// [api] 段：HTTP 监听地址与请求期限
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// [telegram] 段
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramSection {
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
    /// getUpdates 长轮询超时（秒）
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// 单条消息的处理期限（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_timeout_secs() -> u64 {
    30
}

impl Default for TelegramSection {
    fn default() -> Self {
        Self {
            api_base: default_telegram_api_base(),
            poll_timeout_secs: default_poll_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 OSSBOSS__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 OSSBOSS__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!("Config file {:?} not found, ignoring", path);
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("OSSBOSS")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let cfg: AppConfig = c.try_deserialize()?;
    cfg.agent.validate().map_err(config::ConfigError::Message)?;
    Ok(cfg)
}
