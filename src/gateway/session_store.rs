//! 会话存储抽象层
//!
//! load / save(expected_version) / reset：保存采用乐观并发（比较版本后交换），
//! 版本不一致时返回 Conflict，由调用方重新加载后重试。支持内存和持久化两种实现。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use super::message::SessionKey;
use super::session::Session;
use crate::config::StorageSection;

#[cfg(feature = "async-sqlite")]
use super::persistent_session::SqliteSessionStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("version conflict: expected {expected}, stored {actual}")]
    Conflict { expected: u64, actual: u64 },
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 读取会话；不存在时返回版本 0 的空会话
    async fn load(&self, key: &SessionKey) -> Result<Session, StoreError>;

    /// 仅当存储版本等于 expected_version 时写入；成功返回版本 +1 后的会话
    async fn save(&self, session: &Session, expected_version: u64) -> Result<Session, StoreError>;

    /// 清空历史与主题并递增版本
    async fn reset(&self, key: &SessionKey) -> Result<Session, StoreError>;
}

/// 保存前的统一处理：设置新版本并裁剪历史
pub(crate) fn prepare_for_save(session: &Session, expected_version: u64, max_turns: usize) -> Session {
    let mut next = session.clone();
    next.version = expected_version + 1;
    next.trim(max_turns);
    next
}

/// 内存会话存储（测试或 storage.backend = "memory"）
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionKey, Session>>,
    max_turns: usize,
}

impl MemorySessionStore {
    pub fn new(max_turns: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_turns,
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, key: &SessionKey) -> Result<Session, StoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(key)
            .cloned()
            .unwrap_or_else(|| Session::new(key.clone())))
    }

    async fn save(&self, session: &Session, expected_version: u64) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.write().await;
        let actual = sessions.get(&session.key).map(|s| s.version).unwrap_or(0);
        if actual != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                actual,
            });
        }
        let next = prepare_for_save(session, expected_version, self.max_turns);
        sessions.insert(next.key.clone(), next.clone());
        Ok(next)
    }

    async fn reset(&self, key: &SessionKey) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.write().await;
        let mut session = sessions
            .get(key)
            .cloned()
            .unwrap_or_else(|| Session::new(key.clone()));
        session.clear();
        session.version += 1;
        sessions.insert(key.clone(), session.clone());
        Ok(session)
    }
}

/// 创建会话存储
///
/// storage.backend = "sqlite" 且启用了 async-sqlite feature 时使用持久化存储；否则使用内存存储
pub async fn create_session_store(storage: &StorageSection, max_turns: usize) -> Arc<dyn SessionStore> {
    #[cfg(feature = "async-sqlite")]
    if storage.backend == "sqlite" {
        match SqliteSessionStore::new(&storage.path, max_turns).await {
            Ok(store) => {
                tracing::info!("Using persistent session store: {:?}", storage.path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open persistent store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if storage.backend == "sqlite" {
        tracing::warn!("Persistent session store requested but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory session store");
    Arc::new(MemorySessionStore::new(max_turns))
}
