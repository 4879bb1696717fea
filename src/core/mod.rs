//! 核心层：错误分类与恢复策略

pub mod error;
pub mod recovery;

pub use error::{AgentError, ErrorKind, RecoveryAction};
pub use recovery::RecoveryEngine;
