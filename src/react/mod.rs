//! 认知层：Planner（推理引擎）、查询路由主循环与过程事件

pub mod events;
pub mod loop_;
pub mod planner;

pub use events::ReactEvent;
pub use loop_::{QueryRouter, RouterLimits};
pub use planner::{parse_llm_output, Decision, Planner, ReasoningEngine, ToolCallRequest};
