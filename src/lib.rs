//! OSS Boss - 面向 GitHub 仓库与 NPM 包的问答智能体
//!
//! 模块划分：
//! - **agent**: 从配置组装 QueryRouter（LLM、工具注册表、会话存储）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与恢复策略
//! - **gateway**: 通道消息、主题解析、会话实体与版本化会话存储
//! - **integrations**: 通道适配器（CLI / HTTP API / Telegram）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **react**: Planner 与查询路由主循环
//! - **tools**: 工具注册表、信封、执行器与 GitHub / NPM 工具集

pub mod agent;
pub mod config;
pub mod core;
pub mod gateway;
pub mod integrations;
pub mod llm;
pub mod observability;
pub mod react;
pub mod tools;
