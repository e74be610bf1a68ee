//! Mock OpenID Connect provider for integration tests.
//!
//! Serves discovery, JWKS, an authorization endpoint that approves every
//! request, and a token endpoint (authorization code and refresh token
//! grants) whose replies can be scripted.
#![allow(dead_code)]

use authgate::auth::{AuthConfig, CookieConfig, ProviderConfig};
use axum::{
    Form, Json, Router,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

pub const CLIENT_ID: &str = "authgate-test-client";
pub const CLIENT_SECRET: &str = "authgate-test-secret";
pub const SIGNING_KID: &str = "test-signing-key";
pub const TEST_SUBJECT: &str = "110169484474386276334";
pub const TEST_EMAIL: &str = "alice@example.com";
pub const ACCESS_TOKEN: &str = "ya29.mock-access-token";
pub const REFRESH_TOKEN: &str = "1//mock-refresh-token";
pub const REFRESHED_ACCESS_TOKEN: &str = "ya29.mock-refreshed-access-token";

const PROVIDER_KEY: &[u8] = include_bytes!("../fixtures/provider_rsa.pem");
const ROGUE_KEY: &[u8] = include_bytes!("../fixtures/rogue_rsa.pem");

/// Public modulus of `fixtures/provider_rsa.pem`, base64url
const PROVIDER_KEY_N: &str = "pUwLLIApxda7v5GVwpDr-mqTEHrJCodRjyr1-UMfFm9Eu1DQF_sPbROLW0R5HAj4HHj7GBVSBaPhdg200d7sL8-DUdRiweWgDMaD_lNFmcaaL52iePnjr15Ae2Llxim-cFXAEw5_OvATppOBwxwrMIWhtb8tIbjphSITMVT9IoZ-yt0UHr-C42nj8faBbqADhNbpfSPQjhV2x4aEu5BOY9tFBU40wEpMmLMSuAx0o6h5NckDzbYo8Xp88WalzifEdovs9ZUOxP3ZPH4qRfQ6WJNIaD2yhSdKJsJL27dx8Eevaa3Y9HdEKsc_I24P4WGGXtllDUG59XBej6gQ4WDxxw";

/// Adjustments applied to the identity token the mock signs
#[derive(Debug, Clone, Default)]
pub struct TokenOverrides {
    pub audience: Option<String>,
    pub issuer: Option<String>,
    pub nonce: Option<String>,
    /// Seconds until `exp`; negative for an already expired token
    pub expires_in: Option<i64>,
    pub kid: Option<String>,
    /// Sign with a key that is not in the JWKS, under the published kid
    pub rogue_key: bool,
    /// Leave `refresh_token` out of the code grant response
    pub omit_refresh_token: bool,
}

/// Scripted reply of the token endpoint
#[derive(Debug, Clone)]
pub enum TokenReply {
    Issue(TokenOverrides),
    Reject { status: u16, error: String },
    /// Abort the connection before a body is delivered
    DropConnection,
    /// Accept the request and answer only after `HANG_FOR`
    Hang,
}

/// Far beyond any client timeout used in the tests
const HANG_FOR: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Grant {
    nonce: String,
    code_challenge: String,
    redirect_uri: String,
}

struct ProviderState {
    issuer: String,
    grants: Mutex<HashMap<String, Grant>>,
    replies: Mutex<VecDeque<TokenReply>>,
    token_requests: AtomicUsize,
}

pub struct MockProvider {
    port: u16,
    state: Arc<ProviderState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockProvider {
    /// Start the mock provider on a random available port
    pub async fn start() -> anyhow::Result<Self> {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();

        let state = Arc::new(ProviderState {
            issuer: format!("http://127.0.0.1:{}", port),
            grants: Mutex::new(HashMap::new()),
            replies: Mutex::new(VecDeque::new()),
            token_requests: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/.well-known/openid-configuration", get(handle_discovery))
            .route("/jwks", get(handle_jwks))
            .route("/authorize", get(handle_authorize))
            .route("/token", post(handle_token))
            .with_state(Arc::clone(&state));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Mock provider failed");
        });

        Ok(Self {
            port,
            state,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn issuer(&self) -> String {
        self.state.issuer.clone()
    }

    /// Client configuration pointing at this provider; endpoints are left to
    /// discovery
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            redirect_base_url: "http://127.0.0.1:4000".to_string(),
            exchange_retry_backoff_ms: 10,
            http_timeout_seconds: 5,
            cookie: CookieConfig {
                secure: false,
                ..Default::default()
            },
            provider: ProviderConfig {
                client_id: CLIENT_ID.to_string(),
                client_secret: CLIENT_SECRET.to_string(),
                issuer: self.issuer(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Queue replies for upcoming token requests; once the queue is empty
    /// the endpoint issues valid tokens
    pub fn script(&self, replies: impl IntoIterator<Item = TokenReply>) {
        self.state.replies.lock().unwrap().extend(replies);
    }

    pub fn token_requests(&self) -> usize {
        self.state.token_requests.load(Ordering::SeqCst)
    }

    /// Approve an authorization URL as if the user consented.
    ///
    /// # Returns
    /// `(code, state)` as they would arrive on the callback
    pub fn approve(&self, authorization_url: &str) -> (String, String) {
        let url = url::Url::parse(authorization_url).expect("authorization URL");
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let code = self.state.register_grant(&params);
        (code, params["state"].clone())
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockProvider {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl ProviderState {
    fn register_grant(&self, params: &HashMap<String, String>) -> String {
        let code = format!("code-{}", uuid::Uuid::new_v4());
        let grant = Grant {
            nonce: params.get("nonce").cloned().unwrap_or_default(),
            code_challenge: params.get("code_challenge").cloned().unwrap_or_default(),
            redirect_uri: params.get("redirect_uri").cloned().unwrap_or_default(),
        };
        self.grants.lock().unwrap().insert(code.clone(), grant);
        code
    }

    fn sign_id_token(&self, grant: &Grant, overrides: &TokenOverrides) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = json!({
            "iss": overrides.issuer.clone().unwrap_or_else(|| self.issuer.clone()),
            "aud": overrides.audience.clone().unwrap_or_else(|| CLIENT_ID.to_string()),
            "sub": TEST_SUBJECT,
            "iat": now,
            "exp": now + overrides.expires_in.unwrap_or(3600),
            "nonce": overrides.nonce.clone().unwrap_or_else(|| grant.nonce.clone()),
            "email": TEST_EMAIL,
            "email_verified": "true",
            "name": "Alice Example",
        });

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(overrides.kid.clone().unwrap_or_else(|| SIGNING_KID.to_string()));

        let pem = if overrides.rogue_key { ROGUE_KEY } else { PROVIDER_KEY };
        let key = EncodingKey::from_rsa_pem(pem).expect("test signing key");
        encode(&header, &claims, &key).expect("sign identity token")
    }
}

async fn handle_discovery(State(state): State<Arc<ProviderState>>) -> Json<Value> {
    Json(json!({
        "issuer": state.issuer,
        "authorization_endpoint": format!("{}/authorize", state.issuer),
        "token_endpoint": format!("{}/token", state.issuer),
        "jwks_uri": format!("{}/jwks", state.issuer),
        "response_types_supported": ["code"],
        "id_token_signing_alg_values_supported": ["RS256"],
    }))
}

async fn handle_jwks() -> Json<Value> {
    Json(json!({
        "keys": [{
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": SIGNING_KID,
            "n": PROVIDER_KEY_N,
            "e": "AQAB",
        }]
    }))
}

/// Consent screen stand-in: redirect straight back with a code
async fn handle_authorize(
    State(state): State<Arc<ProviderState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let code = state.register_grant(&params);
    let Some(redirect_uri) = params.get("redirect_uri") else {
        return (StatusCode::BAD_REQUEST, "missing redirect_uri").into_response();
    };

    let mut location = url::Url::parse(redirect_uri).expect("redirect_uri");
    location
        .query_pairs_mut()
        .append_pair("code", &code)
        .append_pair("state", params.get("state").map(String::as_str).unwrap_or(""));

    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn invalid_grant(description: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "invalid_grant", "error_description": description })),
    )
        .into_response()
}

async fn handle_token(
    State(state): State<Arc<ProviderState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.token_requests.fetch_add(1, Ordering::SeqCst);

    let reply = state
        .replies
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(TokenReply::Issue(TokenOverrides::default()));

    let overrides = match reply {
        TokenReply::DropConnection => {
            let stream = futures::stream::once(async {
                Err::<Bytes, std::io::Error>(std::io::Error::other("connection reset"))
            });
            return Response::new(Body::from_stream(stream));
        }
        TokenReply::Hang => {
            tokio::time::sleep(HANG_FOR).await;
            return invalid_grant("answered too late");
        }
        TokenReply::Reject { status, error } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST);
            return (status, Json(json!({ "error": error }))).into_response();
        }
        TokenReply::Issue(overrides) => overrides,
    };

    if form.get("client_id").map(String::as_str) != Some(CLIENT_ID)
        || form.get("client_secret").map(String::as_str) != Some(CLIENT_SECRET)
    {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid_client" })),
        )
            .into_response();
    }

    match form.get("grant_type").map(String::as_str) {
        Some("authorization_code") => {}
        Some("refresh_token") => return refresh_grant(&form),
        _ => return invalid_grant("unsupported grant_type"),
    }

    let Some(grant) = form
        .get("code")
        .and_then(|code| state.grants.lock().unwrap().remove(code))
    else {
        return invalid_grant("unknown or used code");
    };

    if form.get("redirect_uri") != Some(&grant.redirect_uri) {
        return invalid_grant("redirect_uri mismatch");
    }

    let verifier = form.get("code_verifier").cloned().unwrap_or_default();
    let challenge =
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    if challenge != grant.code_challenge {
        return invalid_grant("PKCE verification failed");
    }

    let mut body = json!({
        "access_token": ACCESS_TOKEN,
        "token_type": "Bearer",
        "expires_in": 3599,
        "scope": "openid email profile",
        "id_token": state.sign_id_token(&grant, &overrides),
    });
    if !overrides.omit_refresh_token {
        body["refresh_token"] = json!(REFRESH_TOKEN);
    }
    Json(body).into_response()
}

fn refresh_grant(form: &HashMap<String, String>) -> Response {
    if form.get("refresh_token").map(String::as_str) != Some(REFRESH_TOKEN) {
        return invalid_grant("unknown refresh token");
    }

    Json(json!({
        "access_token": REFRESHED_ACCESS_TOKEN,
        "token_type": "Bearer",
        "expires_in": 3599,
    }))
    .into_response()
}
