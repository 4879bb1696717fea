//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

pub use message::{Message, Role};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::LlmClient;
