//! In-process session store.
//!
//! A TTL-expiring map guarded by one lock, with a background evictor. This
//! scopes job listings to an owner; it is not a durable auth layer. It does
//! not survive restart or scale horizontally, and submissions without a
//! session are owned by the anonymous sentinel user.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::app_state::AppState;

/// Owner of unauthenticated submissions.
pub const ANONYMOUS_USER: Uuid = Uuid::nil();

pub const SESSION_COOKIE: &str = "session_id";

#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: ChronoDuration,
}

impl SessionStore {
    pub fn new(ttl_hours: i64) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            ttl: ChronoDuration::hours(ttl_hours),
        })
    }

    /// Create a session for `user_id` and return its opaque id.
    pub fn create(&self, user_id: Uuid) -> String {
        let session_id = format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        let session = Session {
            user_id,
            expires_at: Utc::now() + self.ttl,
        };
        self.sessions
            .write()
            .expect("session lock poisoned")
            .insert(session_id.clone(), session);
        session_id
    }

    /// Look up a session; expired entries read as absent.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        let sessions = self.sessions.read().expect("session lock poisoned");
        let session = sessions.get(session_id)?;
        if session.expires_at <= Utc::now() {
            return None;
        }
        Some(session.clone())
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions
            .write()
            .expect("session lock poisoned")
            .remove(session_id);
    }

    /// Drop expired entries; returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        before - sessions.len()
    }

    /// Periodically evict expired sessions until shutdown.
    pub fn spawn_evictor(self: &Arc<Self>, every: Duration, shutdown: CancellationToken) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = store.evict_expired();
                        if evicted > 0 {
                            tracing::debug!(evicted, "evicted expired sessions");
                        }
                    }
                }
            }
        });
    }
}

/// Resolves the requesting owner: a valid `session_id` cookie maps to its
/// user, anything else to the anonymous sentinel.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub Uuid);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(cookie_session_id)
            .and_then(|sid| state.sessions.get(&sid))
            .map(|session| session.user_id)
            .unwrap_or(ANONYMOUS_USER);
        Ok(CurrentUser(user_id))
    }
}

fn cookie_session_id(header: &str) -> Option<String> {
    header
        .split(';')
        .find_map(|part| part.trim().strip_prefix("session_id="))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_resolve_until_they_expire() {
        let store = SessionStore::new(1);
        let user = Uuid::new_v4();
        let sid = store.create(user);

        let session = store.get(&sid).expect("fresh session resolves");
        assert_eq!(session.user_id, user);

        store.remove(&sid);
        assert!(store.get(&sid).is_none());
    }

    #[test]
    fn zero_ttl_sessions_are_already_expired() {
        let store = SessionStore::new(0);
        let sid = store.create(Uuid::new_v4());
        assert!(store.get(&sid).is_none());
    }

    #[test]
    fn evict_expired_removes_only_dead_entries() {
        let expired = SessionStore::new(0);
        expired.create(Uuid::new_v4());
        expired.create(Uuid::new_v4());
        assert_eq!(expired.evict_expired(), 2);

        let live = SessionStore::new(1);
        live.create(Uuid::new_v4());
        assert_eq!(live.evict_expired(), 0);
    }

    #[test]
    fn session_ids_are_unique_and_opaque() {
        let store = SessionStore::new(1);
        let a = store.create(Uuid::new_v4());
        let b = store.create(Uuid::new_v4());
        assert_ne!(a, b);
        assert!(a.len() >= 32);
    }

    #[test]
    fn cookie_parsing_finds_the_session_id() {
        assert_eq!(
            cookie_session_id("theme=dark; session_id=abc123; lang=en"),
            Some("abc123".to_string())
        );
        assert_eq!(cookie_session_id("session_id=xyz"), Some("xyz".to_string()));
        assert_eq!(cookie_session_id("theme=dark"), None);
        assert_eq!(cookie_session_id(""), None);
    }
}
