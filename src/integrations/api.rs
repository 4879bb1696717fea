//! HTTP API（axum）
//!
//! GET /health、POST /analyze、POST /run-task、POST /reset、POST /webhook。
//! 每个请求带处理期限；客户端断开时丢弃 handler future，DropGuard 取消进行中的交换。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, ErrorKind};
use crate::gateway::{Channel, ExchangeReply, ExchangeRequest, SessionKey};
use crate::react::QueryRouter;

const DEFAULT_API_USER: &str = "api";

/// API 服务状态
pub struct ApiState {
    pub router: Arc<QueryRouter>,
    pub started: Instant,
    pub request_timeout: Duration,
}

impl ApiState {
    pub fn new(router: Arc<QueryRouter>, request_timeout: Duration) -> Self {
        Self {
            router,
            started: Instant::now(),
            request_timeout,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime: f64,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub query: String,
    pub repository: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    pub response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskVariable {
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TaskVariables {
    #[serde(default)]
    pub variables: HashMap<String, TaskVariable>,
}

impl TaskVariables {
    fn text(&self, name: &str) -> Option<String> {
        let value = &self.variables.get(name)?.value;
        let text = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => return None,
            other => other.to_string(),
        };
        Some(text).filter(|t| !t.trim().is_empty())
    }
}

#[derive(Debug, Deserialize)]
pub struct RunTaskRequest {
    pub agent_id: String,
    pub task_id: String,
    #[serde(default)]
    pub inputs: TaskVariables,
    pub conversation_id: Option<String>,
    pub trace_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunTaskResponse {
    pub agent_id: String,
    pub task_id: String,
    pub trace_id: Option<String>,
    /// completed / failed
    pub state: String,
    pub outputs: TaskVariables,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub user_id: Option<String>,
}

/// 交换失败时的 HTTP 响应：`{"error": {"kind", "message"}}`
#[derive(Debug)]
pub struct ApiError(pub AgentError);

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
        ErrorKind::SessionConflictError => StatusCode::CONFLICT,
        ErrorKind::BudgetExceededError => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::UnknownToolError | ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let body = json!({
            "error": {
                "kind": kind.as_str(),
                "message": self.0.user_message(),
            }
        });
        (status_for(kind), Json(body)).into_response()
    }
}

/// 创建 API 路由
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/analyze", post(analyze))
        .route("/run-task", post(run_task))
        .route("/reset", post(reset))
        .route("/webhook", post(webhook))
        .with_state(state)
}

/// 在独立任务中执行交换，施加期限；handler future 被丢弃时取消交换
async fn run_exchange(state: &ApiState, request: ExchangeRequest) -> Result<ExchangeReply, AgentError> {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    let router = state.router.clone();
    let child = token.clone();
    let handle = tokio::spawn(async move { router.handle_with(request, child, None).await });

    let result = match tokio::time::timeout(state.request_timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            tracing::error!("Exchange task failed: {}", join_err);
            Err(AgentError::Internal(join_err.to_string()))
        }
        Err(_) => {
            tracing::warn!(
                "Request deadline of {}s exceeded, cancelling exchange",
                state.request_timeout.as_secs()
            );
            return Err(AgentError::Upstream(format!(
                "request deadline of {}s exceeded",
                state.request_timeout.as_secs()
            )));
        }
    };
    let _ = guard.disarm();
    result
}

fn user_or_default(user_id: Option<String>) -> String {
    user_id
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_API_USER.to_string())
}

/// GET /health
async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime: state.started.elapsed().as_secs_f64(),
    })
}

/// POST /analyze
async fn analyze(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<AnalyzeRequest>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    if body.query.trim().is_empty() {
        return Err(ApiError(AgentError::Validation("Missing 'query'".to_string())));
    }
    let mut request = ExchangeRequest::new(Channel::Api, user_or_default(body.user_id), body.query);
    if let Some(repo) = body.repository.filter(|r| !r.trim().is_empty()) {
        request = request.with_subject(repo);
    }

    let reply = run_exchange(&state, request).await.map_err(ApiError)?;
    Ok(Json(AnalyzeResponse {
        response: reply.answer,
    }))
}

/// POST /run-task：任务信封，失败时 state = failed（HTTP 200）
async fn run_task(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<RunTaskRequest>,
) -> Result<Json<RunTaskResponse>, ApiError> {
    tracing::info!(
        agent_id = %body.agent_id,
        task_id = %body.task_id,
        "Received task request"
    );
    let Some(query) = body.inputs.text("query") else {
        return Err(ApiError(AgentError::Validation(
            "Missing 'query' variable in inputs".to_string(),
        )));
    };

    let user_id = user_or_default(body.conversation_id.clone());
    let mut request = ExchangeRequest::new(Channel::Api, user_id, query);
    if let Some(repo) = body.inputs.text("repository") {
        request = request.with_subject(repo);
    }

    let trace_id = body
        .trace_id
        .clone()
        .unwrap_or_else(|| format!("trace_{}", uuid::Uuid::new_v4()));

    let response = match run_exchange(&state, request).await {
        Ok(reply) => {
            let mut outputs = TaskVariables::default();
            outputs.variables.insert(
                "response".to_string(),
                TaskVariable {
                    value: serde_json::Value::String(reply.answer),
                    mime_type: Some("text/markdown".to_string()),
                    name: None,
                },
            );
            RunTaskResponse {
                agent_id: body.agent_id,
                task_id: body.task_id,
                trace_id: Some(trace_id),
                state: "completed".to_string(),
                outputs,
                error: None,
            }
        }
        Err(e) => {
            tracing::error!(task_id = %body.task_id, "Error processing task request: {}", e);
            RunTaskResponse {
                agent_id: body.agent_id,
                task_id: body.task_id,
                trace_id: Some(trace_id),
                state: "failed".to_string(),
                outputs: TaskVariables::default(),
                error: Some(format!("{}: {}", e.kind(), e.user_message())),
            }
        }
    };
    Ok(Json(response))
}

/// POST /reset
async fn reset(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ResetRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = SessionKey::new(Channel::Api, user_or_default(body.user_id));
    let session = state.router.reset(&key).await.map_err(ApiError)?;
    Ok(Json(json!({ "status": "reset", "version": session.version })))
}

/// POST /webhook：记录并确认，不做处理
async fn webhook(headers: HeaderMap, body: Bytes) -> Json<serde_json::Value> {
    tracing::info!(?headers, "Received webhook");
    tracing::info!(payload = %String::from_utf8_lossy(&body), "Received webhook payload");
    Json(json!({ "status": "received" }))
}

/// 监听并服务，直到 shutdown 被取消
pub async fn serve(
    router: Arc<QueryRouter>,
    host: &str,
    port: u16,
    request_timeout: Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let state = Arc::new(ApiState::new(router, request_timeout));
    let app = create_router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::SessionConflictError), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::UpstreamError), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(ErrorKind::ValidationError), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_task_variables_text() {
        let vars: TaskVariables = serde_json::from_value(json!({
            "variables": {
                "query": {"value": "top contributors?"},
                "repository": {"value": ""}
            }
        }))
        .unwrap();
        assert_eq!(vars.text("query").as_deref(), Some("top contributors?"));
        assert_eq!(vars.text("repository"), None);
        assert_eq!(vars.text("missing"), None);
    }
}
