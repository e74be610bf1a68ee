// Session Token Store
// In-memory session table keyed by session id, with a pluggable persistence hook

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::claims::{AccessToken, IdentityClaims, RefreshToken};
use super::error::AuthError;

/// Server-side record of a successful authentication
#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub claims: IdentityClaims,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub provider_access_token: Option<AccessToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_refresh_token: Option<RefreshToken>,
}

impl Session {
    /// Issue a new session valid for `ttl` from `now`
    pub fn issue(
        claims: IdentityClaims,
        provider_access_token: Option<AccessToken>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        // A non-positive TTL would break expires_at > issued_at
        let ttl = ttl.max(Duration::seconds(1));
        Self {
            session_id: generate_session_id(),
            user_id: claims.subject.clone(),
            claims,
            issued_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            provider_access_token,
            provider_refresh_token: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: Option<RefreshToken>) -> Self {
        self.provider_refresh_token = refresh_token;
        self
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

// The session id is a bearer credential
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &"[redacted]")
            .field("user_id", &self.user_id)
            .field("claims", &self.claims)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("provider_access_token", &self.provider_access_token)
            .field("provider_refresh_token", &self.provider_refresh_token)
            .finish()
    }
}

/// 256 bits from the OS-seeded RNG, base64url without padding
pub fn generate_session_id() -> String {
    let random_bytes: [u8; 32] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Hook invoked after every change to the in-memory table.
///
/// Implementations write through to durable storage. Failures are logged and
/// do not fail the request: the in-memory table stays authoritative for the
/// running process.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionPersistence: Send + Sync {
    async fn save(&self, session: &Session) -> anyhow::Result<()>;

    async fn delete(&self, session_id: &str) -> anyhow::Result<()>;
}

/// Persistence hook that keeps nothing
pub struct NoPersistence;

#[async_trait]
impl SessionPersistence for NoPersistence {
    async fn save(&self, _session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    async fn delete(&self, _session_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Process-wide session table
pub struct TokenStore {
    sessions: RwLock<HashMap<String, Session>>,
    persistence: Arc<dyn SessionPersistence>,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore {
    pub fn new() -> Self {
        Self::with_persistence(Arc::new(NoPersistence))
    }

    pub fn with_persistence(persistence: Arc<dyn SessionPersistence>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            persistence,
        }
    }

    /// Insert a freshly issued session.
    ///
    /// Returns false, leaving the table untouched, when the id is already
    /// present.
    pub async fn write(&self, session: Session) -> bool {
        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&session.session_id) {
                return false;
            }
            sessions.insert(session.session_id.clone(), session.clone());
        }

        debug!(user_id = %session.user_id, expires_at = %session.expires_at, "Session stored");
        self.persist(&session).await;
        true
    }

    /// Look up a live session
    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.get_at(session_id, Utc::now()).await
    }

    /// Look up a session that is live at `now`; an expired entry is dropped
    pub async fn get_at(&self, session_id: &str, now: DateTime<Utc>) -> Option<Session> {
        {
            let sessions = self.sessions.read().await;
            match sessions.get(session_id) {
                None => return None,
                Some(session) if session.is_live_at(now) => return Some(session.clone()),
                Some(_) => {}
            }
        }

        self.remove_if_expired(session_id, now).await;
        None
    }

    /// Atomically replace a live session with a new one carrying the same
    /// identity and a refreshed expiry. The old id stops resolving.
    pub async fn renew_at(
        &self,
        session_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        let renewed = {
            let mut sessions = self.sessions.write().await;
            let current = match sessions.remove(session_id) {
                Some(session) if session.is_live_at(now) => session,
                Some(_) => {
                    drop(sessions);
                    self.unpersist(session_id).await;
                    return Err(AuthError::SessionExpired);
                }
                None => return Err(AuthError::SessionExpired),
            };

            let renewed = Session::issue(current.claims, current.provider_access_token, ttl, now)
                .with_refresh_token(current.provider_refresh_token);
            sessions.insert(renewed.session_id.clone(), renewed.clone());
            renewed
        };

        debug!(user_id = %renewed.user_id, "Session renewed");
        self.unpersist(session_id).await;
        self.persist(&renewed).await;
        Ok(renewed)
    }

    /// Swap the provider tokens held by a live session. The session keeps its
    /// id and expiry; a `None` refresh token keeps the current one.
    pub async fn update_provider_tokens_at(
        &self,
        session_id: &str,
        access_token: AccessToken,
        refresh_token: Option<RefreshToken>,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        let updated = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(session_id)
                .filter(|session| session.is_live_at(now))
                .ok_or(AuthError::SessionExpired)?;

            session.provider_access_token = Some(access_token);
            if let Some(refresh_token) = refresh_token {
                session.provider_refresh_token = Some(refresh_token);
            }
            session.clone()
        };

        debug!(user_id = %updated.user_id, "Provider tokens updated");
        self.persist(&updated).await;
        Ok(updated)
    }

    /// Remove a session; returns whether it existed
    pub async fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        if removed {
            self.unpersist(session_id).await;
        }
        removed
    }

    /// Drop every session expired at `now`
    pub async fn evict_expired_at(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = {
            let mut sessions = self.sessions.write().await;
            let expired: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| !session.is_live_at(now))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                sessions.remove(id);
            }
            expired
        };

        for id in &expired {
            self.unpersist(id).await;
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    async fn remove_if_expired(&self, session_id: &str, now: DateTime<Utc>) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let expired = sessions
                .get(session_id)
                .is_some_and(|session| !session.is_live_at(now));
            if expired {
                sessions.remove(session_id);
            }
            expired
        };
        if removed {
            self.unpersist(session_id).await;
        }
    }

    async fn persist(&self, session: &Session) {
        if let Err(e) = self.persistence.save(session).await {
            warn!(user_id = %session.user_id, "Session persistence failed: {}", e);
        }
    }

    async fn unpersist(&self, session_id: &str) {
        if let Err(e) = self.persistence.delete(session_id).await {
            warn!("Session persistence delete failed: {}", e);
        }
    }
}
