use crate::errors::{AppError, AppResult};
use crate::lockout::expires_after;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Access,
    Recovery,
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub token: String,
    pub user_id: i64,
    pub kind: SessionKind,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open_session(
        &self,
        user_id: i64,
        kind: SessionKind,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> AppResult<SessionHandle> {
        let handle = SessionHandle {
            token: Uuid::new_v4().to_string(),
            user_id,
            kind,
            expires_at: expires_after(now, ttl)?,
        };

        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, entry| entry.expires_at > now);
        sessions.insert(handle.token.clone(), handle.clone());

        Ok(handle)
    }

    pub async fn resolve(&self, token: &str, kind: SessionKind, now: DateTime<Utc>) -> AppResult<SessionHandle> {
        let mut sessions = self.sessions.lock().await;
        let Some(handle) = sessions.get(token).cloned() else {
            return Err(AppError::Unauthorized("Invalid or expired session".to_string()));
        };
        if handle.kind != kind {
            return Err(AppError::Unauthorized("Invalid or expired session".to_string()));
        }
        if handle.expires_at <= now {
            sessions.remove(token);
            return Err(AppError::Unauthorized("Invalid or expired session".to_string()));
        }
        Ok(handle)
    }

    /// Resolves and removes under one lock, for single-use tokens.
    pub async fn take(&self, token: &str, kind: SessionKind, now: DateTime<Utc>) -> AppResult<SessionHandle> {
        let mut sessions = self.sessions.lock().await;
        let Some(handle) = sessions.remove(token) else {
            return Err(AppError::Unauthorized("Invalid or expired session".to_string()));
        };
        if handle.kind != kind {
            sessions.insert(token.to_string(), handle);
            return Err(AppError::Unauthorized("Invalid or expired session".to_string()));
        }
        if handle.expires_at <= now {
            return Err(AppError::Unauthorized("Invalid or expired session".to_string()));
        }
        Ok(handle)
    }

    pub async fn close_session(&self, token: &str) {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(token);
    }

    pub async fn close_user_sessions(&self, user_id: i64) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.user_id != user_id);
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionKind, SessionManager};
    use crate::errors::AppError;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn sessions_expire_and_are_kind_scoped() {
        let manager = SessionManager::new();
        let now = Utc::now();
        let handle = manager
            .open_session(7, SessionKind::Access, Duration::minutes(30), now)
            .await
            .expect("open");

        let resolved = manager
            .resolve(&handle.token, SessionKind::Access, now + Duration::minutes(29))
            .await
            .expect("resolve");
        assert_eq!(resolved.user_id, 7);

        assert!(matches!(
            manager.resolve(&handle.token, SessionKind::Recovery, now).await,
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            manager
                .resolve(&handle.token, SessionKind::Access, now + Duration::minutes(30))
                .await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn take_is_single_use() {
        let manager = SessionManager::new();
        let now = Utc::now();
        let handle = manager
            .open_session(3, SessionKind::Recovery, Duration::minutes(10), now)
            .await
            .expect("open");

        assert!(matches!(
            manager.take(&handle.token, SessionKind::Access, now).await,
            Err(AppError::Unauthorized(_))
        ));
        manager
            .take(&handle.token, SessionKind::Recovery, now)
            .await
            .expect("first take");
        assert!(manager.take(&handle.token, SessionKind::Recovery, now).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_takes_spend_a_token_once() {
        let manager = SessionManager::new();
        let now = Utc::now();
        for _ in 0..50 {
            let handle = manager
                .open_session(4, SessionKind::Recovery, Duration::minutes(10), now)
                .await
                .expect("open");

            let first = manager.clone();
            let second = manager.clone();
            let (token_a, token_b) = (handle.token.clone(), handle.token.clone());
            let (a, b) = tokio::join!(
                tokio::spawn(async move { first.take(&token_a, SessionKind::Recovery, now).await }),
                tokio::spawn(async move { second.take(&token_b, SessionKind::Recovery, now).await }),
            );
            let successes = [a.expect("join"), b.expect("join")]
                .iter()
                .filter(|outcome| outcome.is_ok())
                .count();
            assert_eq!(successes, 1);
        }
    }

    #[tokio::test]
    async fn oversized_ttl_is_rejected() {
        let manager = SessionManager::new();
        let now = Utc::now();
        let ttl = Duration::try_days(100_000_000).expect("representable");
        assert!(matches!(
            manager.open_session(1, SessionKind::Access, ttl, now).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn closing_user_sessions_drops_every_token() {
        let manager = SessionManager::new();
        let now = Utc::now();
        let first = manager
            .open_session(1, SessionKind::Access, Duration::minutes(5), now)
            .await
            .expect("open");
        manager
            .open_session(1, SessionKind::Recovery, Duration::minutes(5), now)
            .await
            .expect("open");
        let other = manager
            .open_session(2, SessionKind::Access, Duration::minutes(5), now)
            .await
            .expect("open");

        assert_eq!(manager.close_user_sessions(1).await, 2);
        assert!(manager.resolve(&first.token, SessionKind::Access, now).await.is_err());
        assert!(manager.resolve(&other.token, SessionKind::Access, now).await.is_ok());
    }
}
