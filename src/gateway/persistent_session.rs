//! 持久化会话存储
//!
//! 使用 SQLite 存储会话文档（按 (channel, user_id) 一行，整份会话序列化为 JSON），
//! 保存时以 version 列做比较交换，多个进程（CLI / API / Bot）共享同一数据库也不会丢失更新。

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::message::SessionKey;
use super::session::Session;
use super::session_store::{prepare_for_save, SessionStore, StoreError};

/// reset 在并发写入下的最大重试次数
const RESET_ATTEMPTS: usize = 5;

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(format!("session document: {e}"))
    }
}

pub struct SqliteSessionStore {
    pool: SqlitePool,
    max_turns: usize,
}

impl SqliteSessionStore {
    /// 打开（必要时创建）数据库文件并建表
    pub async fn new(db_path: impl AsRef<Path>, max_turns: usize) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Backend(format!("create {:?}: {e}", parent)))?;
            }
        }
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool, max_turns };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                channel TEXT NOT NULL,
                user_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                document TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (channel, user_id)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stored_version(&self, key: &SessionKey) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT version FROM sessions WHERE channel = ? AND user_id = ?")
            .bind(key.channel.as_str())
            .bind(&key.user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("version") as u64).unwrap_or(0))
    }

    /// 关闭连接池
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, key: &SessionKey) -> Result<Session, StoreError> {
        let row = sqlx::query(
            "SELECT version, document FROM sessions WHERE channel = ? AND user_id = ?",
        )
        .bind(key.channel.as_str())
        .bind(&key.user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let version: i64 = row.get("version");
                let document: String = row.get("document");
                let mut session: Session = serde_json::from_str(&document)?;
                session.key = key.clone();
                session.version = version as u64;
                Ok(session)
            }
            None => Ok(Session::new(key.clone())),
        }
    }

    async fn save(&self, session: &Session, expected_version: u64) -> Result<Session, StoreError> {
        let next = prepare_for_save(session, expected_version, self.max_turns);
        let document = serde_json::to_string(&next)?;
        let now = chrono::Utc::now().to_rfc3339();

        let result = if expected_version == 0 {
            sqlx::query(
                "INSERT INTO sessions (channel, user_id, version, document, updated_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT (channel, user_id) DO NOTHING",
            )
            .bind(next.key.channel.as_str())
            .bind(&next.key.user_id)
            .bind(next.version as i64)
            .bind(&document)
            .bind(&now)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE sessions SET version = ?, document = ?, updated_at = ?
                 WHERE channel = ? AND user_id = ? AND version = ?",
            )
            .bind(next.version as i64)
            .bind(&document)
            .bind(&now)
            .bind(next.key.channel.as_str())
            .bind(&next.key.user_id)
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 1 {
            Ok(next)
        } else {
            let actual = self.stored_version(&next.key).await?;
            Err(StoreError::Conflict {
                expected: expected_version,
                actual,
            })
        }
    }

    async fn reset(&self, key: &SessionKey) -> Result<Session, StoreError> {
        let mut last_err = None;
        for _ in 0..RESET_ATTEMPTS {
            let mut session = self.load(key).await?;
            let expected = session.version;
            session.clear();
            match self.save(&session, expected).await {
                Ok(saved) => return Ok(saved),
                Err(e @ StoreError::Conflict { .. }) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| StoreError::Backend("reset failed".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Channel, Subject, Turn};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_session_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("data").join("sessions.db");
        let key = SessionKey::new(Channel::Telegram, "42");

        let store = SqliteSessionStore::new(&db_path, 20).await.unwrap();
        let mut session = store.load(&key).await.unwrap();
        session.turns.push(Turn::user("facebook/react: top contributors?", None));
        session.turns.push(Turn::assistant("gaearon leads."));
        session.active_subject = Some(Subject::Repository("facebook/react".parse().unwrap()));
        let saved = store.save(&session, 0).await.unwrap();
        assert_eq!(saved.version, 1);
        store.close().await;

        let reopened = SqliteSessionStore::new(&db_path, 20).await.unwrap();
        let loaded = reopened.load(&key).await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.turns, saved.turns);
        assert_eq!(loaded.active_subject, saved.active_subject);
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteSessionStore::new(temp_dir.path().join("s.db"), 20)
            .await
            .unwrap();
        let key = SessionKey::new(Channel::Api, "bob");

        let s0 = store.load(&key).await.unwrap();
        let s1 = store.save(&s0, 0).await.unwrap();
        // 第二个写者也基于版本 0
        assert_eq!(
            store.save(&s0, 0).await.unwrap_err(),
            StoreError::Conflict { expected: 0, actual: 1 }
        );
        let s2 = store.save(&s1, 1).await.unwrap();
        assert_eq!(s2.version, 2);
        assert!(matches!(
            store.save(&s1, 1).await,
            Err(StoreError::Conflict { expected: 1, actual: 2 })
        ));
    }

    #[tokio::test]
    async fn test_reset_and_trim() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteSessionStore::new(temp_dir.path().join("s.db"), 2)
            .await
            .unwrap();
        let key = SessionKey::new(Channel::Cli, "carol");

        let mut s = store.load(&key).await.unwrap();
        for i in 0..3 {
            s.turns.push(Turn::user(format!("q{i}"), None));
            s.turns.push(Turn::assistant(format!("a{i}")));
        }
        let saved = store.save(&s, 0).await.unwrap();
        assert_eq!(saved.turns.len(), 2);
        assert_eq!(store.load(&key).await.unwrap().turns[0].content, "q2");

        let reset = store.reset(&key).await.unwrap();
        assert_eq!(reset.version, 2);
        let loaded = store.load(&key).await.unwrap();
        assert!(loaded.turns.is_empty());
        assert_eq!(loaded.version, 2);
    }
}
