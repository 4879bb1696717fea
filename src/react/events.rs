//! 交换过程事件：供 CLI 等前端实时展示思考、工具调用与观察

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    /// 步数更新（已执行的工具调用数 / 上限）
    StepUpdate { step: usize, max_steps: usize },
    /// 正在调用推理引擎
    Thinking,
    /// 调用工具
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        tool: String,
        ok: bool,
        preview: String,
    },
    /// 错误恢复动作（FeedBack / AskUser / Abort）
    Recovery { action: String, detail: String },
    /// 保存时版本冲突，正在重新加载重试
    SaveConflict { attempt: usize },
    /// 最终回复
    MessageDone { text: String },
    /// 错误
    Error { text: String },
}
