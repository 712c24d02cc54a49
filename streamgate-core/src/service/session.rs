//! Stream session store
//!
//! Issues and validates the opaque short-lived tokens that authorize direct
//! stream requests. Single-process and in-memory by design: a restart
//! invalidates every session, and horizontal scaling would require an
//! external store.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Error, Result};

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(8 * 60 * 60);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// One authorized stream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSession {
    pub subject_id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct SessionStore {
    ttl: ChronoDuration,
    sessions: RwLock<HashMap<String, StreamSession>>,
    shutdown: CancellationToken,
}

impl SessionStore {
    /// Create the store and spawn its background sweeper.
    #[must_use]
    pub fn new(ttl: Duration, cleanup_interval: Duration) -> Arc<Self> {
        let ttl = if ttl.is_zero() { DEFAULT_SESSION_TTL } else { ttl };
        let cleanup_interval = if cleanup_interval.is_zero() {
            DEFAULT_CLEANUP_INTERVAL
        } else {
            cleanup_interval
        };

        let store = Arc::new(Self {
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(8)),
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        let sweeper = store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweeper.sweep_expired().await,
                    () = sweeper.shutdown.cancelled() => break,
                }
            }
        });

        store
    }

    /// Mint a session token for a verified subject.
    ///
    /// Fails only when the system RNG does.
    pub async fn create(&self, subject_id: &str, email: &str) -> Result<(String, DateTime<Utc>)> {
        let mut token_bytes = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut token_bytes)
            .map_err(|e| Error::Internal(format!("generate session token: {e}")))?;
        let token = URL_SAFE_NO_PAD.encode(token_bytes);

        let now = Utc::now();
        let expires_at = now + self.ttl;
        let session = StreamSession {
            subject_id: subject_id.to_string(),
            email: email.to_string(),
            created_at: now,
            expires_at,
        };

        self.sessions.write().await.insert(token.clone(), session);
        Ok((token, expires_at))
    }

    /// Look up a token. Expired entries are removed lazily on read.
    pub async fn validate(&self, token: &str) -> Option<StreamSession> {
        if token.is_empty() {
            return None;
        }

        let session = self.sessions.read().await.get(token).cloned()?;
        if Utc::now() > session.expires_at {
            self.sessions.write().await.remove(token);
            return None;
        }
        Some(session)
    }

    async fn sweep_expired(&self) {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| now <= session.expires_at);
        let removed = before - sessions.len();
        let remaining = sessions.len();
        drop(sessions);

        if removed > 0 {
            debug!(removed, remaining, "expired stream sessions removed");
        }
    }

    /// Stop the background sweeper.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    #[cfg(test)]
    async fn insert_raw(&self, token: &str, session: StreamSession) {
        self.sessions.write().await.insert(token.to_string(), session);
    }

    #[cfg(test)]
    async fn contains(&self, token: &str) -> bool {
        self.sessions.read().await.contains_key(token)
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
