//! 会话网关：通道、会话实体、主题解析与会话存储
//!
//! - **message**: 通道类型、会话键、交换请求/结果
//! - **subject**: 仓库 / NPM 包主题的解析与提取
//! - **session**: 会话与对话轮次
//! - **session_store**: 版本化会话存储（比较交换保存），内存与 SQLite 两种实现

mod message;
#[cfg(feature = "async-sqlite")]
mod persistent_session;
mod session;
mod session_store;
mod subject;

pub use message::{Channel, ExchangeReply, ExchangeRequest, SessionKey};
#[cfg(feature = "async-sqlite")]
pub use persistent_session::SqliteSessionStore;
pub use session::{Session, ToolCallRecord, Turn, TurnRole};
pub use session_store::{create_session_store, MemorySessionStore, SessionStore, StoreError};
pub use subject::{
    extract_subject, subject_candidate, validate_package_name, RepoPath, Subject, SubjectError,
    SubjectKind,
};
