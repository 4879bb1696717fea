//! 工具执行器（信封编解码）
//!
//! 持有 ToolRegistry 与单次调用超时。invoke 先按描述符校验参数，再在超时内执行工具，
//! 工具的错误、超时与 panic 全部转成 Envelope，不会越过这一层；每次调用输出结构化审计日志（JSON）。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::Value;
use tokio::time::timeout;

use crate::tools::params::validate_params;
use crate::tools::registry::{Tool, ToolDescriptor, ToolRegistry};
use crate::tools::{Envelope, ToolError, ToolErrorKind};

/// 工具执行器：对每次调用施加超时，并将结果统一为 Envelope
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self::with_timeout(registry, Duration::from_secs(timeout_secs))
    }

    pub fn with_timeout(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// 按名称执行；未注册的工具得到 UnknownToolError 信封
    pub async fn invoke(&self, tool_name: &str, params: Value) -> Envelope {
        let (descriptor, tool) = match (
            self.registry.descriptor(tool_name),
            self.registry.resolve(tool_name),
        ) {
            (Some(d), Ok(t)) => (d.clone(), t),
            _ => {
                let envelope = Envelope::Error(ToolError::unknown_tool(format!(
                    "Unknown tool '{}'. Available tools: {}",
                    tool_name,
                    self.registry.tool_names().join(", ")
                )));
                audit(tool_name, &params, "unknown_tool", Duration::ZERO);
                return envelope;
            }
        };
        self.invoke_with(&descriptor, tool, params).await
    }

    /// 执行已解析的工具：参数校验 → 超时内执行（捕获 panic）→ 信封
    pub async fn invoke_with(
        &self,
        descriptor: &ToolDescriptor,
        tool: Arc<dyn Tool>,
        params: Value,
    ) -> Envelope {
        let start = Instant::now();
        let preview_params = params.clone();

        let (result, outcome): (Result<Value, ToolError>, &str) =
            match validate_params(descriptor, &params) {
                Err(e) => (Err(e), "validation_error"),
                Ok(()) => {
                    let fut = AssertUnwindSafe(tool.execute(params)).catch_unwind();
                    match timeout(self.timeout, fut).await {
                        Ok(Ok(Ok(v))) => (Ok(v), "ok"),
                        Ok(Ok(Err(e))) => {
                            let outcome = match e.kind {
                                ToolErrorKind::ValidationError => "validation_error",
                                ToolErrorKind::UpstreamError => "upstream_error",
                                ToolErrorKind::UnknownToolError => "unknown_tool",
                                ToolErrorKind::InternalError => "internal_error",
                            };
                            (Err(e), outcome)
                        }
                        Ok(Err(panic)) => {
                            tracing::error!(
                                tool = %descriptor.name,
                                "tool panicked: {}",
                                panic_message(panic.as_ref())
                            );
                            (
                                Err(ToolError::internal(format!(
                                    "tool '{}' failed unexpectedly",
                                    descriptor.name
                                ))),
                                "panic",
                            )
                        }
                        Err(_) => (
                            Err(ToolError::upstream(format!(
                                "tool '{}' timed out after {}s",
                                descriptor.name,
                                self.timeout.as_secs_f32()
                            ))),
                            "timeout",
                        ),
                    }
                }
            };

        audit(&descriptor.name, &preview_params, outcome, start.elapsed());
        Envelope::from(result)
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.registry.descriptor(name)
    }

    pub fn list_descriptors(&self) -> Vec<ToolDescriptor> {
        self.registry.list_descriptors()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

fn audit(tool_name: &str, args: &Value, outcome: &str, elapsed: Duration) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": tool_name,
        "ok": outcome == "ok",
        "outcome": outcome,
        "duration_ms": elapsed.as_millis() as u64,
        "args_preview": args_preview(args),
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
