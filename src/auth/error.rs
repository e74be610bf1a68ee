// Authentication Error Types
// Failure taxonomy for the authorization-code flow and session lifecycle

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    // Callback / state errors
    #[error("Authorization state is unknown, expired or already used")]
    InvalidState,

    #[error("Authorization state does not match the state carried by the client")]
    StateMismatch,

    // Provider errors
    #[error("Identity provider rejected the request: {0}")]
    ProviderRejected(String),

    #[error("Identity provider unreachable: {0}")]
    NetworkFailure(String),

    #[error("Invalid identity token: {0}")]
    InvalidToken(String),

    // Session errors
    #[error("Session not found or expired")]
    SessionExpired,

    #[error("Session holds no provider refresh token")]
    RefreshUnavailable,

    // Configuration errors
    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidConfig { key: String, reason: String },
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest includes the URL in its Display output; strip it so query
        // parameters never reach logs or callers
        let err = err.without_url();
        if err.is_timeout() {
            AuthError::NetworkFailure("request timed out".to_string())
        } else {
            AuthError::NetworkFailure(err.to_string())
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        AuthError::InvalidToken(err.to_string())
    }
}

impl AuthError {
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::InvalidState | AuthError::StateMismatch => 400,

            AuthError::InvalidToken(_)
            | AuthError::SessionExpired
            | AuthError::RefreshUnavailable => 401,

            AuthError::ProviderRejected(_) => 502,

            AuthError::NetworkFailure(_) => 504,

            AuthError::InvalidConfig { .. } => 500,
        }
    }

    /// Stable identifier used in JSON error bodies and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::InvalidState => "invalid_state",
            AuthError::StateMismatch => "state_mismatch",
            AuthError::ProviderRejected(_) => "provider_rejected",
            AuthError::NetworkFailure(_) => "network_failure",
            AuthError::InvalidToken(_) => "invalid_token",
            AuthError::SessionExpired => "session_expired",
            AuthError::RefreshUnavailable => "refresh_unavailable",
            AuthError::InvalidConfig { .. } => "invalid_config",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::NetworkFailure(_))
    }
}
