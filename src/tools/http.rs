//! GitHub / NPM 工具共用的 HTTP 辅助：构建 reqwest 客户端，并把失败统一映射为 UpstreamError

use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;

use crate::tools::ToolError;

pub const USER_AGENT: &str = concat!("ossboss/", env!("CARGO_PKG_VERSION"));

pub fn build_client(timeout_secs: u64) -> Result<Client, ToolError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ToolError::internal(format!("failed to build HTTP client: {e}")))
}

fn map_send_error(e: reqwest::Error) -> ToolError {
    if e.is_timeout() {
        ToolError::upstream("request timed out")
    } else if e.is_connect() {
        ToolError::upstream(format!("connection failed: {e}"))
    } else {
        ToolError::upstream(format!("request failed: {e}"))
    }
}

fn status_message(status: StatusCode, body: &str) -> String {
    // GitHub / npm 的错误体一般带 message 或 error 字段
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str().map(String::from))
        })
        .unwrap_or_default();
    let reason = match status {
        StatusCode::NOT_FOUND => "not found",
        StatusCode::UNAUTHORIZED => "unauthorized (check GITHUB_TOKEN)",
        StatusCode::FORBIDDEN => "forbidden or rate limited",
        StatusCode::TOO_MANY_REQUESTS => "rate limited",
        StatusCode::UNPROCESSABLE_ENTITY => "unprocessable request",
        _ => status.canonical_reason().unwrap_or("unexpected status"),
    };
    if detail.is_empty() {
        format!("HTTP {} {}", status.as_u16(), reason)
    } else {
        format!("HTTP {} {}: {}", status.as_u16(), reason, detail)
    }
}

/// 发送请求并解析 JSON 响应；非 2xx、网络错误、解码失败都视为上游错误
pub async fn send_json(request: RequestBuilder) -> Result<Value, ToolError> {
    let resp = request.send().await.map_err(map_send_error)?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ToolError::upstream(status_message(status, &body)));
    }
    resp.json::<Value>()
        .await
        .map_err(|e| ToolError::upstream(format!("invalid JSON response: {e}")))
}

/// 为错误信息加上下文（如 "fetching repository facebook/react"）
pub fn with_context(err: ToolError, context: &str) -> ToolError {
    ToolError::new(err.kind, format!("Error {context}: {}", err.message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_message_uses_body() {
        let msg = status_message(StatusCode::NOT_FOUND, r#"{"message":"Not Found"}"#);
        assert_eq!(msg, "HTTP 404 not found: Not Found");
        assert_eq!(status_message(StatusCode::BAD_GATEWAY, ""), "HTTP 502 Bad Gateway");
    }
}
