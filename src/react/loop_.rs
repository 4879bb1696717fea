//! 查询路由 / Agent 主循环
//!
//! 每条用户消息是一次独立的交换：Start（加载会话、解析主题、追加 user 轮次）→
//! Think（推理引擎决定下一步）→ Act（经 ToolExecutor 调用工具、记录 tool 轮次）→ 回到 Think，
//! 直到得到最终回答、需要澄清、出错或超过工具调用上限 → Finish（追加 assistant 轮次，按加载时的版本比较交换保存）。
//! 保存冲突时重新加载，只重放本次交换新增的轮次与主题更新。
//! 可选 event_tx：向 CLI 等前端推送 Thinking / ToolCall / Observation 等事件。

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::gateway::{
    extract_subject, subject_candidate, ExchangeReply, ExchangeRequest, Session, SessionKey, SessionStore, StoreError,
    Subject, SubjectKind, ToolCallRecord, Turn,
};
use crate::react::{Decision, ReactEvent, ReasoningEngine, ToolCallRequest};
use crate::tools::{Envelope, ToolErrorKind, ToolExecutor};

/// Observation 事件预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 单次交换的限制
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterLimits {
    /// 每条消息最多执行的工具调用数
    pub max_tool_calls: usize,
    /// 保存冲突后的最大重试次数
    pub save_retries: usize,
    /// 上游错误最多回灌给推理引擎的次数
    pub upstream_feedback_limit: usize,
}

impl Default for RouterLimits {
    fn default() -> Self {
        Self {
            max_tool_calls: 6,
            save_retries: 3,
            upstream_feedback_limit: 1,
        }
    }
}

/// 交换的正常结束方式
enum Outcome {
    Answer(String),
    Clarification(String),
}

/// 一次交换的工作状态；只有 history[new_from..] 是本次新增的轮次
struct Exchange {
    history: Vec<Turn>,
    new_from: usize,
    /// 当前用于注入工具参数的主题
    subject: Option<Subject>,
    /// 正文中的候选主题；同类型没有当前主题时才用于注入
    candidate: Option<Subject>,
    /// 提交时写入 active_subject 的主题
    subject_update: Option<Subject>,
    tool_calls: usize,
    upstream_failures: usize,
}

impl Exchange {
    fn start(base: &Session, request: &ExchangeRequest) -> Self {
        let hint = request
            .explicit_subject
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty());

        let (resolved, content, subject, candidate) = match hint {
            Some(hint) => match Subject::parse_explicit(hint) {
                Ok(s) => (Some(s.clone()), request.message.clone(), Some(s), None),
                // 非法的显式主题原样交给推理引擎，由工具校验后请求澄清；不回退到旧主题
                Err(_) => (None, format!("{hint}: {}", request.message), None, None),
            },
            None => match extract_subject(&request.message) {
                Some(s) => (Some(s.clone()), request.message.clone(), Some(s), None),
                None => (
                    None,
                    request.message.clone(),
                    base.active_subject.clone(),
                    subject_candidate(&request.message),
                ),
            },
        };

        let mut history = base.turns.clone();
        let new_from = history.len();
        history.push(Turn::user(content, resolved.clone()));

        Self {
            history,
            new_from,
            subject,
            candidate,
            subject_update: resolved,
            tool_calls: 0,
            upstream_failures: 0,
        }
    }

    fn new_turns(&self) -> &[Turn] {
        &self.history[self.new_from..]
    }

    /// 在 base 之上重放本次交换新增的轮次与主题更新
    fn apply_to(&self, base: &Session) -> Session {
        let mut next = base.clone();
        let issuing_turn = next.turns.len();
        for turn in self.new_turns() {
            let mut turn = turn.clone();
            if let Some(call) = turn.tool_call.as_mut() {
                call.issuing_turn = issuing_turn;
            }
            next.turns.push(turn);
        }
        if let Some(s) = &self.subject_update {
            next.active_subject = Some(s.clone());
        }
        next
    }
}

fn send_event(tx: Option<&UnboundedSender<ReactEvent>>, ev: ReactEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() > OBSERVATION_PREVIEW_CHARS {
        format!("{}...", s.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}

fn missing_subject_question(kind: SubjectKind) -> String {
    match kind {
        SubjectKind::Repository => {
            "Which GitHub repository do you mean? Please include it in the format <owner>/<repo>."
                .to_string()
        }
        SubjectKind::Package => {
            "Which NPM package do you mean? Please include the package name (for example npm:react)."
                .to_string()
        }
    }
}

/// 参数里缺少主题（不存在、null 或空字符串）
fn subject_missing(params: &Value, name: &str) -> bool {
    match params.get(name) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// 查询路由：各通道共享一个实例，交换之间除会话存储外没有共享可变状态
pub struct QueryRouter {
    engine: Arc<dyn ReasoningEngine>,
    executor: Arc<ToolExecutor>,
    store: Arc<dyn SessionStore>,
    recovery: RecoveryEngine,
    limits: RouterLimits,
}

impl QueryRouter {
    pub fn new(
        engine: Arc<dyn ReasoningEngine>,
        executor: Arc<ToolExecutor>,
        store: Arc<dyn SessionStore>,
        limits: RouterLimits,
    ) -> Self {
        Self {
            engine,
            executor,
            store,
            recovery: RecoveryEngine::new(),
            limits,
        }
    }

    pub fn limits(&self) -> RouterLimits {
        self.limits
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.executor.tool_names()
    }

    pub async fn handle(&self, request: ExchangeRequest) -> Result<ExchangeReply, AgentError> {
        self.handle_with(request, CancellationToken::new(), None).await
    }

    /// 处理一条消息；cancel 被触发后不会提交最终的 assistant 轮次
    pub async fn handle_with(
        &self,
        request: ExchangeRequest,
        cancel: CancellationToken,
        event_tx: Option<&UnboundedSender<ReactEvent>>,
    ) -> Result<ExchangeReply, AgentError> {
        let key = request.key();
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let base = self.store.load(&key).await?;
        let mut ex = Exchange::start(&base, &request);
        tracing::debug!(
            session = %key,
            version = base.version,
            subject = ?ex.subject,
            "exchange started"
        );

        let outcome = self.run_loop(&mut ex, &cancel, event_tx).await;

        let (content, clarification) = match &outcome {
            Err(AgentError::Cancelled) => {
                tracing::info!(session = %key, "exchange cancelled, nothing committed");
                return Err(AgentError::Cancelled);
            }
            Ok(Outcome::Answer(text)) => (text.clone(), false),
            Ok(Outcome::Clarification(text)) => (text.clone(), true),
            Err(e) => {
                match e {
                    AgentError::Internal(_) | AgentError::Store(_) | AgentError::JsonParseError(_) => {
                        tracing::error!(session = %key, "exchange failed: {}", e)
                    }
                    _ => tracing::warn!(session = %key, "exchange failed: {}", e),
                }
                send_event(event_tx, ReactEvent::Error { text: e.user_message() });
                (e.user_message(), false)
            }
        };
        ex.history.push(Turn::assistant(content.clone()));

        let committed = self.commit(&key, base, &ex, &cancel, event_tx).await;

        match (outcome, committed) {
            (Ok(_), Ok(saved)) => {
                send_event(event_tx, ReactEvent::MessageDone { text: content.clone() });
                Ok(ExchangeReply {
                    answer: content,
                    clarification,
                    tool_calls: ex.tool_calls,
                    version: saved.version,
                    subject: saved.active_subject,
                })
            }
            (Ok(_), Err(commit_err)) => Err(commit_err),
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(commit_err)) => {
                tracing::warn!(session = %key, "failed to persist failed exchange: {}", commit_err);
                Err(e)
            }
        }
    }

    /// 清空会话历史与主题
    pub async fn reset(&self, key: &SessionKey) -> Result<Session, AgentError> {
        let session = self.store.reset(key).await?;
        tracing::info!(session = %key, version = session.version, "session reset");
        Ok(session)
    }

    async fn run_loop(
        &self,
        ex: &mut Exchange,
        cancel: &CancellationToken,
        event_tx: Option<&UnboundedSender<ReactEvent>>,
    ) -> Result<Outcome, AgentError> {
        let descriptors = self.executor.list_descriptors();

        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            send_event(event_tx, ReactEvent::Thinking);

            let decision = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                d = self.engine.decide(&ex.history, &descriptors) => d?,
            };

            let request = match decision {
                Decision::Final(text) => return Ok(Outcome::Answer(text)),
                Decision::ToolCall(request) => request,
            };

            if ex.tool_calls >= self.limits.max_tool_calls {
                return Err(AgentError::BudgetExceeded {
                    limit: self.limits.max_tool_calls,
                });
            }
            ex.tool_calls += 1;
            send_event(
                event_tx,
                ReactEvent::StepUpdate {
                    step: ex.tool_calls,
                    max_steps: self.limits.max_tool_calls,
                },
            );

            if let Some(outcome) = self.act(ex, request, event_tx).await? {
                return Ok(outcome);
            }
        }
    }

    /// 执行一次工具调用；返回 Some 表示交换在此结束（澄清），Err 表示终止
    async fn act(
        &self,
        ex: &mut Exchange,
        request: ToolCallRequest,
        event_tx: Option<&UnboundedSender<ReactEvent>>,
    ) -> Result<Option<Outcome>, AgentError> {
        let ToolCallRequest { tool, mut params } = request;
        let subject_kind = self.executor.descriptor(&tool).and_then(|d| d.subject);

        let mut call_subject = None;
        if let Some(kind) = subject_kind {
            let name = kind.param_name();
            if params.is_object() && subject_missing(&params, name) {
                let injected = ex
                    .subject
                    .as_ref()
                    .filter(|s| s.kind() == kind)
                    .or_else(|| ex.candidate.as_ref().filter(|s| s.kind() == kind));
                match injected {
                    Some(s) => params[name] = Value::String(s.param_value()),
                    None => {
                        let question = missing_subject_question(kind);
                        send_event(
                            event_tx,
                            ReactEvent::Recovery {
                                action: "ask_user".to_string(),
                                detail: question.clone(),
                            },
                        );
                        return Ok(Some(Outcome::Clarification(question)));
                    }
                }
            }
            call_subject = params
                .get(name)
                .and_then(|v| v.as_str())
                .and_then(|v| Subject::parse_as(kind, v).ok());
        }

        send_event(
            event_tx,
            ReactEvent::ToolCall {
                tool: tool.clone(),
                args: params.clone(),
            },
        );
        let envelope = self.executor.invoke(&tool, params.clone()).await;
        let observation = envelope.to_json_string();
        send_event(
            event_tx,
            ReactEvent::Observation {
                tool: tool.clone(),
                ok: envelope.is_ok(),
                preview: preview(&observation),
            },
        );

        ex.history.push(Turn::tool(ToolCallRecord {
            call_id: Uuid::new_v4().to_string(),
            tool: tool.clone(),
            params,
            subject: call_subject.clone(),
            issuing_turn: ex.new_from,
            envelope: envelope.clone(),
        }));

        let error = match envelope {
            Envelope::Ok(_) => {
                if let Some(s) = call_subject {
                    ex.subject = Some(s.clone());
                    ex.subject_update = Some(s);
                }
                return Ok(None);
            }
            Envelope::Error(error) => error,
        };

        if error.kind == ToolErrorKind::UpstreamError {
            ex.upstream_failures += 1;
        }
        let action = self.recovery.on_tool_error(
            &error,
            ex.upstream_failures,
            self.limits.upstream_feedback_limit,
        );
        tracing::debug!(tool = %tool, kind = ?error.kind, ?action, "tool error");

        match action {
            RecoveryAction::FeedBack | RecoveryAction::RetryWithPrompt(_) => {
                send_event(
                    event_tx,
                    ReactEvent::Recovery {
                        action: "feed_back".to_string(),
                        detail: error.message.clone(),
                    },
                );
                Ok(None)
            }
            RecoveryAction::AskUser(question) => {
                send_event(
                    event_tx,
                    ReactEvent::Recovery {
                        action: "ask_user".to_string(),
                        detail: question.clone(),
                    },
                );
                Ok(Some(Outcome::Clarification(question)))
            }
            RecoveryAction::Abort(e) => Err(e),
        }
    }

    /// 以加载时的版本保存；冲突时重新加载并重放新增轮次，最多 save_retries 次
    async fn commit(
        &self,
        key: &SessionKey,
        base: Session,
        ex: &Exchange,
        cancel: &CancellationToken,
        event_tx: Option<&UnboundedSender<ReactEvent>>,
    ) -> Result<Session, AgentError> {
        let attempts = self.limits.save_retries + 1;
        let mut current = base;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let next = ex.apply_to(&current);
            match self.store.save(&next, current.version).await {
                Ok(saved) => {
                    tracing::debug!(session = %key, version = saved.version, attempt, "session saved");
                    return Ok(saved);
                }
                Err(StoreError::Conflict { expected, actual }) => {
                    tracing::warn!(
                        session = %key,
                        expected,
                        actual,
                        attempt,
                        "session version conflict, reloading"
                    );
                    send_event(event_tx, ReactEvent::SaveConflict { attempt });
                    if attempt < attempts {
                        current = self.store.load(key).await?;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AgentError::SessionConflict { attempts })
    }
}
