/// Session Coordinator
///
/// Orchestrates a sign-in: starts the provider redirect, completes the
/// callback, and issues, renews and revokes sessions.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::config::AuthConfig;
use super::error::AuthError;
use super::provider::{ExchangeOutcome, ProviderClient};
use super::state::{AuthorizationRequest, StateRejection};
use super::store::{Session, TokenStore};

/// Lifecycle of a single login attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginPhase {
    Idle,
    AwaitingProviderRedirect,
    AwaitingCallback,
    Completed,
    Failed,
    Expired,
}

/// Events that move a login attempt between phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginEvent {
    Initiated,
    RedirectedToProvider,
    ExchangeSucceeded,
    ExchangeFailed,
    StateTtlElapsed,
}

impl LoginPhase {
    /// Apply `event`; events that do not apply in the current phase leave it
    /// unchanged
    pub fn transition(self, event: LoginEvent) -> LoginPhase {
        use LoginEvent::*;
        use LoginPhase::*;

        match (self, event) {
            (Idle, Initiated) => AwaitingProviderRedirect,
            (AwaitingProviderRedirect, RedirectedToProvider) => AwaitingCallback,
            (AwaitingProviderRedirect | AwaitingCallback, ExchangeSucceeded) => Completed,
            (AwaitingProviderRedirect | AwaitingCallback, ExchangeFailed) => Failed,
            (AwaitingCallback, StateTtlElapsed) => Expired,
            (phase, _) => phase,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoginPhase::Completed | LoginPhase::Failed | LoginPhase::Expired
        )
    }
}

/// What the caller needs to send the user to the provider
#[derive(Debug, Clone)]
pub struct RedirectInstruction {
    /// Provider authorization URL
    pub url: String,

    /// State nonce the caller keeps in transient storage (the state cookie)
    /// and presents again at callback time
    pub state: String,

    /// How long the caller should keep the state
    pub state_max_age_seconds: i64,

    /// Phase of the attempt once the caller has sent the user on
    pub phase: LoginPhase,
}

/// One callback, with the phase the attempt ended in
#[derive(Debug)]
pub struct LoginAttempt {
    pub id: uuid::Uuid,
    pub phase: LoginPhase,
    pub result: Result<(Session, Option<String>), AuthError>,
}

/// Central sign-in orchestrator
pub struct SessionCoordinator {
    provider: Arc<ProviderClient>,
    store: Arc<TokenStore>,
    session_ttl: chrono::Duration,
    default_scopes: Vec<String>,
    retry_backoff: Duration,
}

impl SessionCoordinator {
    pub fn new(config: &AuthConfig, provider: Arc<ProviderClient>, store: Arc<TokenStore>) -> Self {
        Self {
            provider,
            store,
            session_ttl: config.session_ttl(),
            default_scopes: config.requested_scopes.clone(),
            retry_backoff: config.retry_backoff(),
        }
    }

    pub fn provider(&self) -> Arc<ProviderClient> {
        Arc::clone(&self.provider)
    }

    pub fn store(&self) -> Arc<TokenStore> {
        Arc::clone(&self.store)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        self.session_ttl
    }

    /// Start a login attempt.
    ///
    /// # Arguments
    /// * `requested_scopes` - Scopes to request; `None` uses the configured set
    /// * `return_to` - Where to send the user after sign-in; anything but a
    ///   same-origin absolute path is dropped
    pub async fn initiate(
        &self,
        requested_scopes: Option<&[String]>,
        return_to: Option<&str>,
    ) -> Result<RedirectInstruction, AuthError> {
        let scopes = requested_scopes.unwrap_or(self.default_scopes.as_slice());
        let return_to = return_to.and_then(sanitize_return_to);

        let phase = LoginPhase::Idle.transition(LoginEvent::Initiated);
        let (url, request) = self
            .provider
            .build_authorization_url(scopes, return_to)
            .await?;

        // From here the callback can arrive at any time
        let phase = phase.transition(LoginEvent::RedirectedToProvider);
        debug!(phase = ?phase, scopes = %request.requested_scopes.join(" "), "Login initiated");

        Ok(RedirectInstruction {
            url: url.to_string(),
            state: request.state,
            state_max_age_seconds: self.provider.state_ttl().num_seconds(),
            phase,
        })
    }

    /// Complete a login attempt from the provider callback.
    ///
    /// # Arguments
    /// * `code` - Authorization code from the callback
    /// * `state` - State parameter from the callback
    /// * `carried_state` - State the caller kept since `initiate`
    ///
    /// # Returns
    /// The new session and the post-login destination, if one was requested
    pub async fn complete_callback(
        &self,
        code: &str,
        state: &str,
        carried_state: Option<&str>,
    ) -> Result<(Session, Option<String>), AuthError> {
        self.complete_callback_at(code, state, carried_state, Utc::now())
            .await
    }

    pub async fn complete_callback_at(
        &self,
        code: &str,
        state: &str,
        carried_state: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(Session, Option<String>), AuthError> {
        self.run_callback_at(code, state, carried_state, now)
            .await
            .result
    }

    /// Complete a callback and report the terminal phase of the attempt
    pub async fn run_callback_at(
        &self,
        code: &str,
        state: &str,
        carried_state: Option<&str>,
        now: DateTime<Utc>,
    ) -> LoginAttempt {
        let id = uuid::Uuid::new_v4();
        let mut phase = LoginPhase::AwaitingCallback;

        let result = self
            .try_complete(code, state, carried_state, now, &mut phase)
            .await;

        // Terminal phases absorb the event, so an expired attempt stays expired
        let phase = match &result {
            Ok(_) => phase.transition(LoginEvent::ExchangeSucceeded),
            Err(_) => phase.transition(LoginEvent::ExchangeFailed),
        };

        match &result {
            Ok((session, _)) => {
                info!(
                    attempt = %id,
                    phase = ?phase,
                    user_id = %session.user_id,
                    expires_at = %session.expires_at,
                    "Login completed"
                );
            }
            Err(e @ (AuthError::ProviderRejected(_) | AuthError::NetworkFailure(_))) => {
                error!(
                    attempt = %id,
                    phase = ?phase,
                    kind = e.kind(),
                    "Login failed at the provider: {}",
                    e
                );
            }
            Err(e) => {
                warn!(
                    attempt = %id,
                    phase = ?phase,
                    kind = e.kind(),
                    "Login rejected: {}",
                    e
                );
            }
        }

        LoginAttempt { id, phase, result }
    }

    async fn try_complete(
        &self,
        code: &str,
        state: &str,
        carried_state: Option<&str>,
        now: DateTime<Utc>,
        phase: &mut LoginPhase,
    ) -> Result<(Session, Option<String>), AuthError> {
        if !states_match(state, carried_state) {
            return Err(AuthError::StateMismatch);
        }

        let request = match self.provider.take_pending_at(state, now).await {
            Ok(request) => request,
            Err(StateRejection::Expired) => {
                *phase = phase.transition(LoginEvent::StateTtlElapsed);
                return Err(AuthError::InvalidState);
            }
            Err(StateRejection::Unknown) => return Err(AuthError::InvalidState),
        };

        let outcome = self.redeem(code, &request).await?;

        let session = self.issue_session(outcome, now).await;
        Ok((session, request.return_to))
    }

    /// Redeem the code. Only the token request itself is retried, once, on a
    /// transport failure; once the provider has answered, the code is spent.
    async fn redeem(
        &self,
        code: &str,
        request: &AuthorizationRequest,
    ) -> Result<ExchangeOutcome, AuthError> {
        let tokens = match self.provider.request_tokens(code, request).await {
            Err(e) if e.is_retryable() => {
                warn!(
                    backoff_ms = self.retry_backoff.as_millis() as u64,
                    "Token request failed, retrying once: {}", e
                );
                tokio::time::sleep(self.retry_backoff).await;
                self.provider.request_tokens(code, request).await?
            }
            other => other?,
        };

        self.provider.accept_tokens(tokens, request).await
    }

    async fn issue_session(&self, outcome: ExchangeOutcome, now: DateTime<Utc>) -> Session {
        loop {
            let session = Session::issue(
                outcome.claims.clone(),
                outcome.access_token.clone(),
                self.session_ttl,
                now,
            )
            .with_refresh_token(outcome.refresh_token.clone());
            if self.store.write(session.clone()).await {
                return session;
            }
        }
    }

    /// Re-issue a live session under a new id with a refreshed expiry
    pub async fn renew(&self, session_id: &str) -> Result<Session, AuthError> {
        self.renew_at(session_id, Utc::now()).await
    }

    pub async fn renew_at(&self, session_id: &str, now: DateTime<Utc>) -> Result<Session, AuthError> {
        let session = self.store.renew_at(session_id, self.session_ttl, now).await?;
        info!(user_id = %session.user_id, expires_at = %session.expires_at, "Session renewed");
        Ok(session)
    }

    /// Obtain a fresh provider access token with the session's refresh token.
    /// The session keeps its id and expiry.
    pub async fn refresh_provider_token(&self, session_id: &str) -> Result<Session, AuthError> {
        self.refresh_provider_token_at(session_id, Utc::now()).await
    }

    pub async fn refresh_provider_token_at(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        let session = self
            .store
            .get_at(session_id, now)
            .await
            .ok_or(AuthError::SessionExpired)?;
        let refresh_token = session
            .provider_refresh_token
            .ok_or(AuthError::RefreshUnavailable)?;

        let refreshed = match self.provider.refresh_access_token(&refresh_token).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                warn!(user_id = %session.user_id, kind = e.kind(), "Provider token refresh failed: {}", e);
                return Err(e);
            }
        };

        let session = self
            .store
            .update_provider_tokens_at(
                session_id,
                refreshed.access_token,
                refreshed.refresh_token,
                now,
            )
            .await?;
        info!(user_id = %session.user_id, "Provider access token refreshed");
        Ok(session)
    }

    /// End a session; unknown ids are ignored
    pub async fn logout(&self, session_id: &str) {
        if self.store.remove(session_id).await {
            info!("Session ended by logout");
        } else {
            debug!("Logout for unknown or expired session");
        }
    }

    /// Drop expired sessions and abandoned authorization requests.
    ///
    /// # Returns
    /// `(sessions, requests)` evicted
    pub async fn evict_expired_at(&self, now: DateTime<Utc>) -> (usize, usize) {
        let sessions = self.store.evict_expired_at(now).await;
        let requests = self.provider.evict_expired_at(now).await;
        if sessions + requests > 0 {
            debug!(sessions, requests, "Evicted expired entries");
        }
        (sessions, requests)
    }

    /// Run eviction every `every` until the handle is aborted
    pub fn spawn_eviction_task(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                coordinator.evict_expired_at(Utc::now()).await;
            }
        });

        info!("Session eviction started with interval: {}s", every.as_secs());
        handle
    }
}

/// Opaque byte equality in constant time; a missing carried state never
/// matches
fn states_match(state: &str, carried_state: Option<&str>) -> bool {
    match carried_state {
        Some(carried) => bool::from(state.as_bytes().ct_eq(carried.as_bytes())),
        None => false,
    }
}

/// Accept only same-origin absolute paths as post-login destinations
pub fn sanitize_return_to(return_to: &str) -> Option<String> {
    let valid = return_to.starts_with('/')
        && !return_to.starts_with("//")
        && !return_to.contains('\\')
        && !return_to.chars().any(char::is_control);

    valid.then(|| return_to.to_string())
}
