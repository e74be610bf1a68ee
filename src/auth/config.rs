// Authentication Configuration
// Identity provider credentials, session lifetime and cookie settings

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::error::AuthError;

/// Upper bound for `session_ttl_seconds` (10 years)
pub const MAX_SESSION_TTL_SECONDS: u64 = 315_360_000;

/// Upper bound for `state_ttl_seconds` (1 day)
pub const MAX_STATE_TTL_SECONDS: u64 = 86_400;

/// Main authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Public base URL of this service; the provider redirects back to
    /// `<redirect_base_url>/auth/callback`
    pub redirect_base_url: String,

    /// Session lifetime in seconds (default: 30 days)
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: u64,

    /// Lifetime of a pending authorization request (default: 10 minutes)
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: u64,

    /// Scopes requested when the caller does not name any
    #[serde(default = "default_scopes")]
    pub requested_scopes: Vec<String>,

    /// Timeout for every call to the identity provider
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,

    /// Fixed delay before the single retry of a failed code exchange
    #[serde(default = "default_retry_backoff")]
    pub exchange_retry_backoff_ms: u64,

    /// How often expired sessions and authorization requests are swept
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval_seconds: u64,

    #[serde(default)]
    pub cookie: CookieConfig,

    #[serde(default)]
    pub provider: ProviderConfig,
}

impl AuthConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), AuthError> {
        let base = url::Url::parse(&self.redirect_base_url).map_err(|e| {
            AuthError::InvalidConfig {
                key: "auth.redirect_base_url".to_string(),
                reason: e.to_string(),
            }
        })?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return Err(AuthError::InvalidConfig {
                key: "auth.redirect_base_url".to_string(),
                reason: "must be an http:// or https:// URL".to_string(),
            });
        }

        if !(1..=MAX_SESSION_TTL_SECONDS).contains(&self.session_ttl_seconds) {
            return Err(AuthError::InvalidConfig {
                key: "auth.session_ttl_seconds".to_string(),
                reason: format!("must be between 1 and {}", MAX_SESSION_TTL_SECONDS),
            });
        }

        if !(1..=MAX_STATE_TTL_SECONDS).contains(&self.state_ttl_seconds) {
            return Err(AuthError::InvalidConfig {
                key: "auth.state_ttl_seconds".to_string(),
                reason: format!("must be between 1 and {}", MAX_STATE_TTL_SECONDS),
            });
        }

        if self.http_timeout_seconds == 0 {
            return Err(AuthError::InvalidConfig {
                key: "auth.http_timeout_seconds".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        self.cookie.validate()?;
        self.provider.validate()?;

        Ok(())
    }

    /// The redirect URI registered with the provider
    pub fn callback_url(&self) -> String {
        format!(
            "{}/auth/callback",
            self.redirect_base_url.trim_end_matches('/')
        )
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        ttl_from_seconds(self.session_ttl_seconds)
    }

    pub fn state_ttl(&self) -> chrono::Duration {
        ttl_from_seconds(self.state_ttl_seconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.exchange_retry_backoff_ms)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_seconds.max(1))
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            redirect_base_url: "http://localhost:4000".to_string(),
            session_ttl_seconds: default_session_ttl(),
            state_ttl_seconds: default_state_ttl(),
            requested_scopes: default_scopes(),
            http_timeout_seconds: default_http_timeout(),
            exchange_retry_backoff_ms: default_retry_backoff(),
            eviction_interval_seconds: default_eviction_interval(),
            cookie: CookieConfig::default(),
            provider: ProviderConfig::default(),
        }
    }
}

/// Cookie configuration for the session and the transient state cookie
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieConfig {
    /// Session cookie name
    #[serde(default = "default_cookie_name")]
    pub name: String,

    /// Name of the short-lived cookie carrying the state nonce across the
    /// provider redirect
    #[serde(default = "default_state_cookie_name")]
    pub state_name: String,

    /// Secure flag (HTTPS only)
    #[serde(default = "default_true")]
    pub secure: bool,

    #[serde(default = "default_same_site")]
    pub same_site: SameSitePolicy,

    #[serde(default = "default_cookie_path")]
    pub path: String,
}

impl CookieConfig {
    fn validate(&self) -> Result<(), AuthError> {
        if self.name.is_empty() {
            return Err(AuthError::InvalidConfig {
                key: "auth.cookie.name".to_string(),
                reason: "cannot be empty".to_string(),
            });
        }

        if self.state_name.is_empty() || self.state_name == self.name {
            return Err(AuthError::InvalidConfig {
                key: "auth.cookie.state_name".to_string(),
                reason: "must be non-empty and differ from the session cookie name".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: default_cookie_name(),
            state_name: default_state_cookie_name(),
            secure: true,
            same_site: SameSitePolicy::Lax,
            path: default_cookie_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SameSitePolicy {
    Strict,
    Lax,
    None,
}

impl SameSitePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSitePolicy::Strict => "Strict",
            SameSitePolicy::Lax => "Lax",
            SameSitePolicy::None => "None",
        }
    }
}

/// Identity provider configuration
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// OAuth2 client ID
    #[serde(default)]
    pub client_id: String,

    /// OAuth2 client secret
    #[serde(default)]
    pub client_secret: String,

    /// OIDC issuer identifier, e.g. `https://accounts.google.com`
    #[serde(default)]
    pub issuer: String,

    /// Explicit endpoints; any left unset are taken from discovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// Additional authorization URL parameters (e.g. `access_type = "offline"`)
    #[serde(default)]
    pub extra_authorize_params: BTreeMap<String, String>,
}

impl ProviderConfig {
    fn validate(&self) -> Result<(), AuthError> {
        if self.client_id.is_empty() {
            return Err(AuthError::InvalidConfig {
                key: "auth.provider.client_id".to_string(),
                reason: "cannot be empty".to_string(),
            });
        }

        if self.client_secret.is_empty() {
            return Err(AuthError::InvalidConfig {
                key: "auth.provider.client_secret".to_string(),
                reason: "cannot be empty".to_string(),
            });
        }

        if self.issuer.is_empty() {
            return Err(AuthError::InvalidConfig {
                key: "auth.provider.issuer".to_string(),
                reason: "cannot be empty".to_string(),
            });
        }

        for (key, value) in [
            ("authorization_endpoint", &self.authorization_endpoint),
            ("token_endpoint", &self.token_endpoint),
            ("jwks_uri", &self.jwks_uri),
        ] {
            if let Some(endpoint) = value {
                url::Url::parse(endpoint).map_err(|e| AuthError::InvalidConfig {
                    key: format!("auth.provider.{}", key),
                    reason: e.to_string(),
                })?;
            }
        }

        Ok(())
    }

    /// True when every endpoint is configured and discovery can be skipped
    pub fn has_static_endpoints(&self) -> bool {
        self.authorization_endpoint.is_some()
            && self.token_endpoint.is_some()
            && self.jwks_uri.is_some()
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacted]")
            .field("issuer", &self.issuer)
            .field("authorization_endpoint", &self.authorization_endpoint)
            .field("token_endpoint", &self.token_endpoint)
            .field("jwks_uri", &self.jwks_uri)
            .field("extra_authorize_params", &self.extra_authorize_params)
            .finish()
    }
}

/// Seconds as a `chrono::Duration`, saturating for unvalidated values
fn ttl_from_seconds(seconds: u64) -> chrono::Duration {
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

// Default value functions
fn default_session_ttl() -> u64 {
    2_592_000 // 30 days
}

fn default_state_ttl() -> u64 {
    600
}

fn default_scopes() -> Vec<String> {
    vec![
        "openid".to_string(),
        "email".to_string(),
        "profile".to_string(),
    ]
}

fn default_http_timeout() -> u64 {
    10
}

fn default_retry_backoff() -> u64 {
    250
}

fn default_eviction_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_same_site() -> SameSitePolicy {
    SameSitePolicy::Lax
}

fn default_cookie_name() -> String {
    "authgate_session".to_string()
}

fn default_state_cookie_name() -> String {
    "authgate_state".to_string()
}

fn default_cookie_path() -> String {
    "/".to_string()
}
