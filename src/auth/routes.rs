/// Authentication Routes
///
/// HTTP handlers for the sign-in flow: login initiation, provider callback,
/// session inspection and renewal, provider token refresh, and logout.
use axum::{
    Form, Json, Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::config::CookieConfig;
use super::coordinator::{SessionCoordinator, sanitize_return_to};
use super::error::AuthError;
use super::guard::{AuthResult, SessionGuard, found, read_cookie};

/// Path the state cookie is scoped to
const STATE_COOKIE_PATH: &str = "/auth";

/// Shared state for the auth routes
pub struct AuthState {
    pub coordinator: Arc<SessionCoordinator>,
    pub guard: Arc<SessionGuard>,
    pub cookie: CookieConfig,
}

/// OAuth2 callback parameters, from the query string or a form post
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,

    /// Error reported by the provider
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginParams {
    /// Space- or comma-separated scopes; the configured set when absent
    scopes: Option<String>,
    return_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogoutParams {
    return_to: Option<String>,
}

/// JSON error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(skip)]
    pub status: StatusCode,
    pub error: String,
    pub message: String,
}

impl From<AuthError> for ErrorResponse {
    fn from(error: AuthError) -> Self {
        Self {
            status: StatusCode::from_u16(error.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            error: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

/// Split a `scopes` parameter on spaces and commas
fn parse_scopes(raw: &str) -> Vec<String> {
    raw.split([' ', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn build_cookie(config: &CookieConfig, name: &str, value: &str, path: &str, max_age: i64) -> String {
    format!(
        "{}={}; Path={}; HttpOnly; SameSite={}; Max-Age={}{}",
        name,
        value,
        path,
        config.same_site.as_str(),
        max_age.max(0),
        if config.secure { "; Secure" } else { "" }
    )
}

fn append_cookie(response: &mut Response, cookie: String) {
    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
        Err(e) => warn!("Dropping unrepresentable Set-Cookie header: {}", e),
    }
}

fn session_token(state: &AuthState, headers: &HeaderMap) -> Option<String> {
    state.guard.extract_session_token(headers)
}

/// Start a login: redirect to the provider and set the state cookie
async fn login(
    State(state): State<Arc<AuthState>>,
    Query(params): Query<LoginParams>,
) -> Result<Response, ErrorResponse> {
    let scopes = params
        .scopes
        .as_deref()
        .map(parse_scopes)
        .filter(|scopes| !scopes.is_empty());

    let instruction = state
        .coordinator
        .initiate(scopes.as_deref(), params.return_to.as_deref())
        .await?;

    let mut response = found(&instruction.url);
    append_cookie(
        &mut response,
        build_cookie(
            &state.cookie,
            &state.cookie.state_name,
            &instruction.state,
            STATE_COOKIE_PATH,
            instruction.state_max_age_seconds,
        ),
    );
    Ok(response)
}

async fn callback_query(
    State(state): State<Arc<AuthState>>,
    Query(params): Query<CallbackParams>,
    headers: HeaderMap,
) -> Response {
    handle_callback(&state, params, &headers).await
}

async fn callback_form(
    State(state): State<Arc<AuthState>>,
    headers: HeaderMap,
    Form(params): Form<CallbackParams>,
) -> Response {
    handle_callback(&state, params, &headers).await
}

/// Complete the login. The state cookie is cleared whatever the outcome,
/// since a callback always ends the attempt.
async fn handle_callback(state: &AuthState, params: CallbackParams, headers: &HeaderMap) -> Response {
    let clear_state = build_cookie(&state.cookie, &state.cookie.state_name, "", STATE_COOKIE_PATH, 0);

    let mut response = match complete(state, params, headers).await {
        Ok((session_cookie, destination)) => {
            let mut response = found(&destination);
            append_cookie(&mut response, session_cookie);
            response
        }
        Err(e) => ErrorResponse::from(e).into_response(),
    };

    append_cookie(&mut response, clear_state);
    response
}

async fn complete(
    state: &AuthState,
    params: CallbackParams,
    headers: &HeaderMap,
) -> Result<(String, String), AuthError> {
    if let Some(error) = params.error {
        let detail = match params.error_description {
            Some(description) => format!("{}: {}", error, description),
            None => error,
        };
        warn!(kind = "provider_rejected", "Provider reported an error on callback");
        return Err(AuthError::ProviderRejected(detail));
    }

    let callback_state = params.state.ok_or(AuthError::InvalidState)?;
    let code = params.code.ok_or_else(|| {
        AuthError::ProviderRejected("callback carried no authorization code".to_string())
    })?;
    let carried_state = read_cookie(headers, &state.cookie.state_name);

    let (session, return_to) = state
        .coordinator
        .complete_callback(&code, &callback_state, carried_state.as_deref())
        .await?;

    let cookie = build_cookie(
        &state.cookie,
        &state.cookie.name,
        &session.session_id,
        &state.cookie.path,
        state.coordinator.session_ttl().num_seconds(),
    );
    Ok((cookie, return_to.unwrap_or_else(|| "/".to_string())))
}

/// Current session status
async fn session_status(State(state): State<Arc<AuthState>>, headers: HeaderMap) -> Json<AuthResult> {
    let token = session_token(&state, &headers);
    Json(state.guard.authorize(token.as_deref()).await)
}

/// Re-issue the current session under a new id
async fn renew_session(
    State(state): State<Arc<AuthState>>,
    headers: HeaderMap,
) -> Result<Response, ErrorResponse> {
    let token = session_token(&state, &headers).ok_or(AuthError::SessionExpired)?;
    let session = state.coordinator.renew(&token).await?;

    let cookie = build_cookie(
        &state.cookie,
        &state.cookie.name,
        &session.session_id,
        &state.cookie.path,
        state.coordinator.session_ttl().num_seconds(),
    );
    let mut response = Json(AuthResult::from(session)).into_response();
    append_cookie(&mut response, cookie);
    Ok(response)
}

/// Replace the session's provider access token using its refresh token.
/// The session id and cookie are unchanged.
async fn refresh_provider_token(
    State(state): State<Arc<AuthState>>,
    headers: HeaderMap,
) -> Result<Json<AuthResult>, ErrorResponse> {
    let token = session_token(&state, &headers).ok_or(AuthError::SessionExpired)?;
    let session = state.coordinator.refresh_provider_token(&token).await?;
    Ok(Json(AuthResult::from(session)))
}

/// End the current session and clear the cookie
async fn logout(
    State(state): State<Arc<AuthState>>,
    Query(params): Query<LogoutParams>,
    headers: HeaderMap,
) -> Response {
    match session_token(&state, &headers) {
        Some(token) => state.coordinator.logout(&token).await,
        None => debug!("Logout called without a session token"),
    }

    let destination = params
        .return_to
        .as_deref()
        .and_then(sanitize_return_to)
        .unwrap_or_else(|| "/".to_string());

    let mut response = found(&destination);
    append_cookie(
        &mut response,
        build_cookie(&state.cookie, &state.cookie.name, "", &state.cookie.path, 0),
    );
    response
}

/// Create the authentication router; mount it under `/auth`
pub fn create_auth_router(state: Arc<AuthState>) -> Router {
    Router::new()
        .route("/login", get(login))
        .route("/callback", get(callback_query).post(callback_form))
        .route("/session", get(session_status))
        .route("/session/renew", post(renew_session))
        .route("/refresh", post(refresh_provider_token))
        .route("/logout", get(logout).post(logout))
        .with_state(state)
}
