// OAuth State Management
// Pending authorization requests keyed by their single-use state nonce

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::Mutex;
use tracing::debug;

/// An authorization request awaiting its provider callback
#[derive(Clone)]
pub struct AuthorizationRequest {
    /// Anti-CSRF nonce, also the table key
    pub state: String,

    /// Redirect URI sent to the provider; the token request repeats it
    pub redirect_uri: String,

    pub requested_scopes: Vec<String>,

    /// OIDC nonce expected back in the identity token
    pub nonce: String,

    pub pkce_verifier: String,

    /// Same-origin path to send the user to after sign-in
    pub return_to: Option<String>,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationRequest {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for AuthorizationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationRequest")
            .field("redirect_uri", &self.redirect_uri)
            .field("requested_scopes", &self.requested_scopes)
            .field("return_to", &self.return_to)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Generate a state or nonce value: 256 random bits, base64url
pub fn generate_nonce() -> String {
    let random_bytes: [u8; 32] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Why a state could not be consumed. Callers outside the coordinator see
/// both as `InvalidState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateRejection {
    /// Never issued, already consumed or evicted
    Unknown,
    /// Issued, but its lifetime elapsed before the callback
    Expired,
}

/// Table of pending authorization requests
pub struct PendingRequests {
    requests: Mutex<HashMap<String, AuthorizationRequest>>,
    lifetime: Duration,
}

impl PendingRequests {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
            lifetime,
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Create and store a request under a fresh state nonce.
    ///
    /// A generated nonce that already exists in the table is discarded and
    /// regenerated, so two live requests never share a state.
    pub async fn create_at(
        &self,
        redirect_uri: String,
        requested_scopes: Vec<String>,
        pkce_verifier: String,
        return_to: Option<String>,
        now: DateTime<Utc>,
    ) -> AuthorizationRequest {
        let mut requests = self.requests.lock().await;

        let mut state = generate_nonce();
        while requests.contains_key(&state) {
            state = generate_nonce();
        }

        let request = AuthorizationRequest {
            state: state.clone(),
            redirect_uri,
            requested_scopes,
            nonce: generate_nonce(),
            pkce_verifier,
            return_to,
            created_at: now,
            expires_at: now
                .checked_add_signed(self.lifetime)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        requests.insert(state, request.clone());

        debug!(expires_at = %request.expires_at, "Authorization request created");
        request
    }

    /// Remove and return the request for `state` if it is still live.
    ///
    /// Removal and the expiry check happen under one lock, so concurrent
    /// callers presenting the same state get at most one `Ok`. An expired
    /// request is removed as well.
    pub async fn consume_at(
        &self,
        state: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthorizationRequest, StateRejection> {
        let request = self
            .requests
            .lock()
            .await
            .remove(state)
            .ok_or(StateRejection::Unknown)?;

        if request.is_expired_at(now) {
            debug!("Authorization request expired before callback");
            return Err(StateRejection::Expired);
        }

        Ok(request)
    }

    /// Drop requests whose callback never arrived
    pub async fn evict_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut requests = self.requests.lock().await;
        let before = requests.len();
        requests.retain(|_, request| !request.is_expired_at(now));
        before - requests.len()
    }

    pub async fn len(&self) -> usize {
        self.requests.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.requests.lock().await.is_empty()
    }
}
