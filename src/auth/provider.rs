/// OIDC Provider Client
///
/// Authorization-code flow against a single OpenID Connect provider: builds
/// the authorization URL, redeems the returned code at the token endpoint and
/// verifies the identity token against the provider's published keys.
use chrono::{DateTime, Utc};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::claims::{AccessToken, IdentityClaims, RefreshToken};
use super::config::AuthConfig;
use super::error::AuthError;
use super::pkce::PkcePair;
use super::state::{AuthorizationRequest, PendingRequests, StateRejection};

/// Scope that makes the request an OpenID Connect request
pub const IDENTITY_SCOPE: &str = "openid";

const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";

/// Identity tokens must be signed with an asymmetric key published in the
/// provider's JWKS
const ALLOWED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::EdDSA,
];

/// Provider endpoints, configured or discovered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEndpoints {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
}

/// Subset of the OIDC discovery document this client relies on
#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    jwks_uri: String,
}

/// Authorization code token request (client_secret_post)
#[derive(Serialize)]
struct TokenRequest<'a> {
    grant_type: &'static str,
    code: &'a str,
    redirect_uri: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
    code_verifier: &'a str,
}

/// Refresh token grant (client_secret_post)
#[derive(Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'static str,
    refresh_token: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
}

/// Token endpoint success response
#[derive(Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
}

/// Token endpoint error response (RFC 6749 section 5.2)
#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Some providers encode `email_verified` as a string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FlexibleBool {
    Bool(bool),
    Text(String),
}

impl FlexibleBool {
    fn value(&self) -> bool {
        match self {
            FlexibleBool::Bool(b) => *b,
            FlexibleBool::Text(s) => s.eq_ignore_ascii_case("true"),
        }
    }
}

/// Identity token claims as they appear in the JWT payload. `iss`, `aud` and
/// `exp` are checked by the JWT validation itself.
#[derive(Debug, Clone, Deserialize)]
struct IdTokenClaims {
    iss: String,
    sub: String,
    exp: i64,
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<FlexibleBool>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

/// Result of a successful code exchange
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub claims: IdentityClaims,
    pub access_token: Option<AccessToken>,
    pub refresh_token: Option<RefreshToken>,
}

/// Result of a refresh token grant. `refresh_token` is set only when the
/// provider rotated it.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: AccessToken,
    pub refresh_token: Option<RefreshToken>,
}

/// OAuth2/OIDC client for the configured identity provider
pub struct ProviderClient {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    extra_params: BTreeMap<String, String>,
    endpoints: ProviderEndpoints,
    http_client: reqwest::Client,
    pending: PendingRequests,
    jwks: RwLock<Option<JwkSet>>,
}

impl ProviderClient {
    /// Build a client from configuration, running OIDC discovery for any
    /// endpoint that is not configured explicitly
    pub async fn from_config(config: &AuthConfig) -> Result<Self, AuthError> {
        let http_client = build_http_client(config)?;
        let provider = &config.provider;

        let endpoints = if provider.has_static_endpoints() {
            ProviderEndpoints {
                issuer: provider.issuer.clone(),
                authorization_endpoint: provider.authorization_endpoint.clone().unwrap_or_default(),
                token_endpoint: provider.token_endpoint.clone().unwrap_or_default(),
                jwks_uri: provider.jwks_uri.clone().unwrap_or_default(),
            }
        } else {
            let discovered = discover(&http_client, &provider.issuer).await?;
            ProviderEndpoints {
                issuer: discovered.issuer,
                authorization_endpoint: provider
                    .authorization_endpoint
                    .clone()
                    .unwrap_or(discovered.authorization_endpoint),
                token_endpoint: provider
                    .token_endpoint
                    .clone()
                    .unwrap_or(discovered.token_endpoint),
                jwks_uri: provider.jwks_uri.clone().unwrap_or(discovered.jwks_uri),
            }
        };

        Ok(Self::assemble(config, endpoints, http_client))
    }

    /// Build a client with known endpoints; no network access
    pub fn with_endpoints(
        config: &AuthConfig,
        endpoints: ProviderEndpoints,
    ) -> Result<Self, AuthError> {
        let http_client = build_http_client(config)?;
        Ok(Self::assemble(config, endpoints, http_client))
    }

    fn assemble(
        config: &AuthConfig,
        endpoints: ProviderEndpoints,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            client_id: config.provider.client_id.clone(),
            client_secret: config.provider.client_secret.clone(),
            redirect_uri: config.callback_url(),
            extra_params: config.provider.extra_authorize_params.clone(),
            endpoints,
            http_client,
            pending: PendingRequests::new(config.state_ttl()),
            jwks: RwLock::new(None),
        }
    }

    pub fn endpoints(&self) -> &ProviderEndpoints {
        &self.endpoints
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Lifetime of a pending authorization request
    pub fn state_ttl(&self) -> chrono::Duration {
        self.pending.lifetime()
    }

    /// Build the provider authorization URL and record the pending request
    pub async fn build_authorization_url(
        &self,
        requested_scopes: &[String],
        return_to: Option<String>,
    ) -> Result<(url::Url, AuthorizationRequest), AuthError> {
        self.build_authorization_url_at(requested_scopes, return_to, Utc::now())
            .await
    }

    pub async fn build_authorization_url_at(
        &self,
        requested_scopes: &[String],
        return_to: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(url::Url, AuthorizationRequest), AuthError> {
        let mut url = url::Url::parse(&self.endpoints.authorization_endpoint).map_err(|e| {
            AuthError::InvalidConfig {
                key: "auth.provider.authorization_endpoint".to_string(),
                reason: e.to_string(),
            }
        })?;

        let scopes = normalize_scopes(requested_scopes);
        let pkce = PkcePair::generate();
        let request = self
            .pending
            .create_at(
                self.redirect_uri.clone(),
                scopes,
                pkce.code_verifier.clone(),
                return_to,
                now,
            )
            .await;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.client_id);
            query.append_pair("redirect_uri", &request.redirect_uri);
            query.append_pair("response_type", "code");
            query.append_pair("scope", &request.requested_scopes.join(" "));
            query.append_pair("state", &request.state);
            query.append_pair("nonce", &request.nonce);
            query.append_pair("code_challenge", &pkce.code_challenge);
            query.append_pair("code_challenge_method", "S256");

            for (key, value) in &self.extra_params {
                query.append_pair(key, value);
            }
        }

        Ok((url, request))
    }

    /// Consume the pending request for `state`, then redeem `code`
    pub async fn exchange_code(&self, code: &str, state: &str) -> Result<ExchangeOutcome, AuthError> {
        let request = self.consume_state(state).await?;
        self.redeem_code(code, &request).await
    }

    /// Remove the pending request for `state`; fails if it is unknown, expired
    /// or already consumed
    pub async fn consume_state(&self, state: &str) -> Result<AuthorizationRequest, AuthError> {
        self.consume_state_at(state, Utc::now()).await
    }

    pub async fn consume_state_at(
        &self,
        state: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthorizationRequest, AuthError> {
        self.take_pending_at(state, now)
            .await
            .map_err(|_| AuthError::InvalidState)
    }

    /// Like [`consume_state_at`](Self::consume_state_at), but tells an expired
    /// request apart from an unknown one
    pub async fn take_pending_at(
        &self,
        state: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthorizationRequest, StateRejection> {
        self.pending.consume_at(state, now).await
    }

    /// Redeem an authorization code for tokens and verify the identity token.
    /// The pending request must already have been consumed.
    pub async fn redeem_code(
        &self,
        code: &str,
        request: &AuthorizationRequest,
    ) -> Result<ExchangeOutcome, AuthError> {
        let tokens = self.request_tokens(code, request).await?;
        self.accept_tokens(tokens, request).await
    }

    /// Check a token response from [`request_tokens`](Self::request_tokens).
    ///
    /// The code has been spent by the time this runs, so its failures
    /// (including JWKS transport errors) must not lead to a second token
    /// request.
    pub async fn accept_tokens(
        &self,
        tokens: TokenResponse,
        request: &AuthorizationRequest,
    ) -> Result<ExchangeOutcome, AuthError> {
        let id_token = tokens.id_token.ok_or_else(|| {
            AuthError::InvalidToken("token response carried no id_token".to_string())
        })?;

        if let Some(token_type) = &tokens.token_type
            && !token_type.eq_ignore_ascii_case("bearer")
        {
            debug!(token_type = %token_type, "Provider returned non-bearer access token");
        }

        let claims = self.verify_id_token(&id_token, &request.nonce).await?;

        Ok(ExchangeOutcome {
            claims,
            access_token: tokens.access_token.map(AccessToken::new),
            refresh_token: tokens.refresh_token.map(RefreshToken::new),
        })
    }

    /// POST the authorization code grant to the token endpoint. This is the
    /// only step of the exchange that is safe to repeat after a transport
    /// failure.
    pub async fn request_tokens(
        &self,
        code: &str,
        request: &AuthorizationRequest,
    ) -> Result<TokenResponse, AuthError> {
        let token_request = TokenRequest {
            grant_type: "authorization_code",
            code,
            redirect_uri: &request.redirect_uri,
            client_id: &self.client_id,
            client_secret: &self.client_secret,
            code_verifier: &request.pkce_verifier,
        };

        self.post_token_endpoint(&token_request).await
    }

    /// Trade a refresh token for a new provider access token
    pub async fn refresh_access_token(
        &self,
        refresh_token: &RefreshToken,
    ) -> Result<RefreshedTokens, AuthError> {
        let refresh_request = RefreshRequest {
            grant_type: "refresh_token",
            refresh_token: refresh_token.expose(),
            client_id: &self.client_id,
            client_secret: &self.client_secret,
        };

        let tokens = self.post_token_endpoint(&refresh_request).await?;
        let access_token = tokens.access_token.ok_or_else(|| {
            AuthError::ProviderRejected("refresh response carried no access_token".to_string())
        })?;

        Ok(RefreshedTokens {
            access_token: AccessToken::new(access_token),
            refresh_token: tokens.refresh_token.map(RefreshToken::new),
        })
    }

    async fn post_token_endpoint<T: Serialize>(&self, form: &T) -> Result<TokenResponse, AuthError> {
        let response = self
            .http_client
            .post(&self.endpoints.token_endpoint)
            .form(form)
            .send()
            .await?;

        // Body read failures are transport failures; only a complete body
        // that does not parse is the provider's fault
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let reason = match serde_json::from_slice::<TokenErrorResponse>(&body) {
                Ok(err) => match err.error_description {
                    Some(description) => format!("{}: {} (HTTP {})", err.error, description, status.as_u16()),
                    None => format!("{} (HTTP {})", err.error, status.as_u16()),
                },
                Err(_) => format!("token endpoint returned HTTP {}", status.as_u16()),
            };
            warn!(status = status.as_u16(), "Token request rejected by provider");
            return Err(AuthError::ProviderRejected(reason));
        }

        serde_json::from_slice::<TokenResponse>(&body)
            .map_err(|_| AuthError::ProviderRejected("malformed token response".to_string()))
    }

    /// Verify an identity token's signature, issuer, audience, expiry and
    /// nonce, returning its claims
    pub async fn verify_id_token(
        &self,
        id_token: &str,
        expected_nonce: &str,
    ) -> Result<IdentityClaims, AuthError> {
        let header = decode_header(id_token)?;

        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            return Err(AuthError::InvalidToken(format!(
                "unsupported signing algorithm {:?}",
                header.alg
            )));
        }

        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidToken("identity token has no key id".to_string()))?;
        let decoding_key = self.decoding_key(&kid).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[&self.client_id]);
        validation.set_issuer(&[&self.endpoints.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let claims = decode::<IdTokenClaims>(id_token, &decoding_key, &validation)?.claims;

        if claims.nonce.as_deref() != Some(expected_nonce) {
            return Err(AuthError::InvalidToken("nonce mismatch".to_string()));
        }

        let expiry = DateTime::from_timestamp(claims.exp, 0)
            .ok_or_else(|| AuthError::InvalidToken("exp out of range".to_string()))?;

        Ok(IdentityClaims {
            subject: claims.sub,
            email: claims.email,
            email_verified: claims.email_verified.as_ref().is_some_and(FlexibleBool::value),
            issuer: claims.iss,
            audience: self.client_id.clone(),
            expiry,
            name: claims.name,
            picture: claims.picture,
        })
    }

    /// Find the key for `kid`, refetching the JWKS once when it is not cached
    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        if let Some(jwks) = self.jwks.read().await.as_ref()
            && let Some(jwk) = jwks.find(kid)
        {
            return Ok(DecodingKey::from_jwk(jwk)?);
        }

        debug!(kid = %kid, "Signing key not cached, fetching JWKS");
        let jwks = self.fetch_jwks().await?;
        let key = jwks.find(kid).map(DecodingKey::from_jwk).transpose()?;
        *self.jwks.write().await = Some(jwks);

        key.ok_or_else(|| AuthError::InvalidToken(format!("unknown signing key {}", kid)))
    }

    async fn fetch_jwks(&self) -> Result<JwkSet, AuthError> {
        let response = self.http_client.get(&self.endpoints.jwks_uri).send().await?;

        if !response.status().is_success() {
            return Err(AuthError::ProviderRejected(format!(
                "JWKS endpoint returned HTTP {}",
                response.status().as_u16()
            )));
        }

        response
            .json::<JwkSet>()
            .await
            .map_err(|_| AuthError::ProviderRejected("malformed JWKS document".to_string()))
    }

    /// Drop authorization requests whose callback never arrived
    pub async fn evict_expired_at(&self, now: DateTime<Utc>) -> usize {
        self.pending.evict_expired_at(now).await
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.len().await
    }
}

/// Fetch and check the provider's discovery document
pub async fn discover(
    http_client: &reqwest::Client,
    issuer: &str,
) -> Result<ProviderEndpoints, AuthError> {
    let issuer = issuer.trim_end_matches('/');
    let discovery_url = format!("{}{}", issuer, DISCOVERY_PATH);

    let response = http_client.get(&discovery_url).send().await?;
    if !response.status().is_success() {
        return Err(AuthError::ProviderRejected(format!(
            "discovery endpoint returned HTTP {}",
            response.status().as_u16()
        )));
    }

    let document: DiscoveryDocument = response
        .json()
        .await
        .map_err(|_| AuthError::ProviderRejected("malformed discovery document".to_string()))?;

    if document.issuer.trim_end_matches('/') != issuer {
        return Err(AuthError::InvalidConfig {
            key: "auth.provider.issuer".to_string(),
            reason: format!("discovery reports issuer {}", document.issuer),
        });
    }

    debug!(issuer = %document.issuer, "Provider discovery complete");

    Ok(ProviderEndpoints {
        issuer: document.issuer,
        authorization_endpoint: document.authorization_endpoint,
        token_endpoint: document.token_endpoint,
        jwks_uri: document.jwks_uri,
    })
}

/// Order-preserving, de-duplicated scope list that always contains the
/// identity scope (prepended when missing)
pub fn normalize_scopes(requested: &[String]) -> Vec<String> {
    let mut scopes: Vec<String> = Vec::with_capacity(requested.len() + 1);
    for scope in requested {
        let scope = scope.trim();
        if !scope.is_empty() && !scopes.iter().any(|s| s == scope) {
            scopes.push(scope.to_string());
        }
    }

    if !scopes.iter().any(|s| s == IDENTITY_SCOPE) {
        scopes.insert(0, IDENTITY_SCOPE.to_string());
    }
    scopes
}

fn build_http_client(config: &AuthConfig) -> Result<reqwest::Client, AuthError> {
    reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()
        .map_err(|e| AuthError::InvalidConfig {
            key: "auth.http_timeout_seconds".to_string(),
            reason: format!("failed to create HTTP client: {}", e),
        })
}
