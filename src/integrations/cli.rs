//! 命令行 REPL
//!
//! 逐行读取问题交给 QueryRouter；`exit` 退出，`/reset` 清空会话。
//! 交换进行中通过 ReactEvent 实时打印工具调用。

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::gateway::{Channel, ExchangeRequest, SessionKey};
use crate::react::{QueryRouter, ReactEvent};

pub const PROMPT: &str = "Ask a question (include <owner>/<repo> if needed): ";

fn render_event(ev: &ReactEvent) -> Option<String> {
    match ev {
        ReactEvent::ToolCall { tool, args } => Some(format!("🔧 {tool} {args}")),
        ReactEvent::Observation { tool, ok: false, preview } => {
            Some(format!("⚠️  {tool} failed: {preview}"))
        }
        ReactEvent::SaveConflict { attempt } => {
            Some(format!("↻ session changed elsewhere, retrying save ({attempt})"))
        }
        _ => None,
    }
}

/// 运行 REPL，直到 `exit` 或输入结束
pub async fn run_cli<R, W>(
    router: Arc<QueryRouter>,
    user_id: &str,
    reader: R,
    mut writer: W,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let key = SessionKey::new(Channel::Cli, user_id);
    let mut lines = reader.lines();

    loop {
        writer.write_all(PROMPT.as_bytes()).await?;
        writer.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            break;
        }
        if input == "/reset" {
            let msg = match router.reset(&key).await {
                Ok(_) => "Conversation cleared 🧹".to_string(),
                Err(e) => e.user_message(),
            };
            writer.write_all(format!("{msg}\n").as_bytes()).await?;
            continue;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = ExchangeRequest::new(Channel::Cli, user_id, input);
        let exchange = {
            let router = router.clone();
            async move {
                let result = router
                    .handle_with(request, CancellationToken::new(), Some(&tx))
                    .await;
                drop(tx);
                result
            }
        };
        let printer = async {
            while let Some(ev) = rx.recv().await {
                if let Some(line) = render_event(&ev) {
                    writer.write_all(format!("{line}\n").as_bytes()).await?;
                }
            }
            Ok::<_, std::io::Error>(())
        };
        let (result, printed) = tokio::join!(exchange, printer);
        printed?;

        let text = match result {
            Ok(reply) => reply.answer,
            Err(e) => {
                tracing::warn!("Exchange failed: {}", e);
                format!("❌ {}", e.user_message())
            }
        };
        writer.write_all(format!("\n{text}\n\n").as_bytes()).await?;
    }

    writer.write_all(b"Goodbye! \xF0\x9F\x91\x8B\n").await?;
    writer.flush().await?;
    Ok(())
}

/// 在 stdin / stdout 上运行
pub async fn run_stdio(router: Arc<QueryRouter>, user_id: &str) -> anyhow::Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    run_cli(router, user_id, stdin, tokio::io::stdout()).await
}
