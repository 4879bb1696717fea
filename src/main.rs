//! OSS Boss 入口
//!
//! 解析命令行、加载配置并初始化日志，构建共享的 QueryRouter 后按参数启动
//! CLI / HTTP API / Telegram 通道；未指定通道时运行 CLI。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use ossboss::agent::build_router;
use ossboss::config::load_config;
use ossboss::integrations::cli;
use ossboss::observability;

#[derive(Debug, Parser)]
#[command(name = "ossboss", version, about = "Ask questions about GitHub repositories and NPM packages")]
struct Cli {
    /// 运行命令行 REPL
    #[arg(long)]
    cli: bool,
    /// 运行 HTTP API
    #[arg(long)]
    api: bool,
    /// 运行 Telegram Bot
    #[arg(long)]
    telegram: bool,
    /// 同时运行全部通道
    #[arg(long)]
    all: bool,
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long)]
    config: Option<PathBuf>,
    /// CLI 会话的用户 ID
    #[arg(long, env = "USER", default_value = "local")]
    user: String,
}

impl Cli {
    fn modes(&self) -> (bool, bool, bool) {
        let cli = self.cli || self.all;
        let api = self.api || self.all;
        let telegram = self.telegram || self.all;
        if !cli && !api && !telegram {
            (true, false, false)
        } else {
            (cli, api, telegram)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    observability::init();

    let cfg = load_config(args.config.clone()).context("Failed to load config")?;
    let router = build_router(&cfg).await.context("Failed to build agent")?;
    let (run_cli, run_api, run_telegram) = args.modes();

    let shutdown = CancellationToken::new();
    let mut servers: JoinSet<anyhow::Result<()>> = JoinSet::new();

    if run_api {
        #[cfg(feature = "api")]
        {
            let router = router.clone();
            let api = cfg.api.clone();
            let token = shutdown.clone();
            servers.spawn(async move {
                ossboss::integrations::api::serve(
                    router,
                    &api.host,
                    api.port,
                    std::time::Duration::from_secs(api.request_timeout_secs),
                    token,
                )
                .await
            });
        }
        #[cfg(not(feature = "api"))]
        tracing::warn!("Built without the `api` feature, --api ignored");
    }

    if run_telegram {
        #[cfg(feature = "telegram")]
        {
            let token = std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
            let bot = ossboss::integrations::telegram::TelegramBot::new(
                router.clone(),
                &token,
                &cfg.telegram,
            )?;
            servers.spawn(Arc::new(bot).run(shutdown.clone()));
        }
        #[cfg(not(feature = "telegram"))]
        tracing::warn!("Built without the `telegram` feature, --telegram ignored");
    }

    let result = if run_cli {
        cli::run_stdio(router.clone(), &args.user).await
    } else {
        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down");
                r.map_err(Into::into)
            }
            Some(joined) = servers.join_next() => {
                joined.context("Channel task panicked").and_then(|r| r)
            }
        }
    };

    shutdown.cancel();
    while let Some(joined) = servers.join_next().await {
        if let Ok(Err(e)) = joined {
            tracing::error!("Channel stopped with error: {:#}", e);
        }
    }
    result
}
