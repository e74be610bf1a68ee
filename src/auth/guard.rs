/// Session Guard
///
/// Read-only session checks for protected requests, and the axum middleware
/// that sends unauthenticated users into the login flow.
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::claims::{AccessToken, IdentityClaims};
use super::store::{Session, TokenStore};

/// Outcome of a session check
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuthResult {
    Authenticated {
        claims: IdentityClaims,
        #[serde(skip_serializing_if = "Option::is_none")]
        provider_access_token: Option<AccessToken>,
        expires_at: DateTime<Utc>,
    },
    Unauthenticated,
}

impl AuthResult {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthResult::Authenticated { .. })
    }
}

impl From<Session> for AuthResult {
    fn from(session: Session) -> Self {
        AuthResult::Authenticated {
            claims: session.claims,
            provider_access_token: session.provider_access_token,
            expires_at: session.expires_at,
        }
    }
}

/// Authenticated user context injected into request extensions by
/// [`require_session`]
#[derive(Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub session_id: String,
    pub claims: IdentityClaims,
    pub provider_access_token: Option<AccessToken>,
}

impl fmt::Debug for AuthenticatedUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedUser")
            .field("user_id", &self.user_id)
            .field("session_id", &"[redacted]")
            .field("claims", &self.claims)
            .field("provider_access_token", &self.provider_access_token)
            .finish()
    }
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .cloned()
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

pub struct SessionGuard {
    store: Arc<TokenStore>,
    cookie_name: String,
    login_path: String,
}

impl SessionGuard {
    pub fn new(store: Arc<TokenStore>, cookie_name: impl Into<String>) -> Self {
        Self {
            store,
            cookie_name: cookie_name.into(),
            login_path: "/auth/login".to_string(),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Check a session token; missing, unknown and expired sessions are all
    /// `Unauthenticated`
    pub async fn authorize(&self, session_token: Option<&str>) -> AuthResult {
        self.authorize_at(session_token, Utc::now()).await
    }

    pub async fn authorize_at(&self, session_token: Option<&str>, now: DateTime<Utc>) -> AuthResult {
        match self.lookup_at(session_token, now).await {
            Some(session) => session.into(),
            None => AuthResult::Unauthenticated,
        }
    }

    async fn lookup_at(&self, session_token: Option<&str>, now: DateTime<Utc>) -> Option<Session> {
        let token = session_token.filter(|t| !t.is_empty())?;
        self.store.get_at(token, now).await
    }

    /// Session token from the session cookie, or a Bearer token
    pub fn extract_session_token(&self, headers: &HeaderMap) -> Option<String> {
        extract_bearer_token(headers).or_else(|| read_cookie(headers, &self.cookie_name))
    }

    /// Location of the login route carrying `original` as the return path
    fn login_redirect(&self, original: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(original.as_bytes()).collect();
        format!("{}?return_to={}", self.login_path, encoded)
    }
}

/// Required-session middleware.
///
/// Unauthenticated requests get `302 Found` to the login route with the
/// original path as `return_to`; authenticated requests continue with an
/// [`AuthenticatedUser`] in their extensions.
pub async fn require_session(
    State(guard): State<Arc<SessionGuard>>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = guard.extract_session_token(req.headers());

    match guard.lookup_at(token.as_deref(), Utc::now()).await {
        Some(session) => {
            req.extensions_mut().insert(AuthenticatedUser {
                user_id: session.user_id,
                session_id: session.session_id,
                claims: session.claims,
                provider_access_token: session.provider_access_token,
            });
            next.run(req).await
        }
        None => {
            let original = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            debug!(path = %req.uri().path(), "No valid session, redirecting to login");
            found(&guard.login_redirect(original))
        }
    }
}

/// `302 Found` to `location`
pub fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Value of cookie `name` from the request `Cookie` headers
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .find_map(|cookie| {
            let (key, value) = cookie.trim().split_once('=')?;
            (key == name && !value.is_empty()).then(|| value.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Extension, Router, body::Body, middleware, routing::get};
    use chrono::Duration;
    use tower::ServiceExt;

    fn claims() -> IdentityClaims {
        IdentityClaims {
            subject: "alice".to_string(),
            email: Some("alice@example.com".to_string()),
            email_verified: true,
            issuer: "https://accounts.example.com".to_string(),
            audience: "client-123".to_string(),
            expiry: Utc::now() + Duration::hours(1),
            name: Some("Alice".to_string()),
            picture: None,
        }
    }

    async fn guard_with_session(ttl: Duration, now: DateTime<Utc>) -> (SessionGuard, Session) {
        let store = Arc::new(TokenStore::new());
        let session = Session::issue(claims(), Some(AccessToken::new("provider-token")), ttl, now);
        assert!(store.write(session.clone()).await);
        (SessionGuard::new(store, "authgate_session"), session)
    }

    #[tokio::test]
    async fn test_authorize_live_session() {
        let now = Utc::now();
        let (guard, session) = guard_with_session(Duration::days(30), now).await;

        let result = guard.authorize_at(Some(&session.session_id), now).await;
        match result {
            AuthResult::Authenticated {
                claims,
                provider_access_token,
                ..
            } => {
                assert_eq!(claims.subject, "alice");
                assert_eq!(provider_access_token.unwrap().expose(), "provider-token");
            }
            AuthResult::Unauthenticated => panic!("expected an authenticated result"),
        }
    }

    #[tokio::test]
    async fn test_authorize_after_ttl() {
        let now = Utc::now();
        let (guard, session) = guard_with_session(Duration::days(30), now).await;

        let later = now + Duration::days(30) + Duration::seconds(1);
        let result = guard.authorize_at(Some(&session.session_id), later).await;
        assert!(!result.is_authenticated());
    }

    #[tokio::test]
    async fn test_authorize_missing_token() {
        let (guard, _) = guard_with_session(Duration::days(1), Utc::now()).await;

        assert!(!guard.authorize(None).await.is_authenticated());
        assert!(!guard.authorize(Some("")).await.is_authenticated());
        assert!(!guard.authorize(Some("unknown")).await.is_authenticated());
    }

    #[test]
    fn test_read_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; authgate_session=abc123; other=1"),
        );

        assert_eq!(read_cookie(&headers, "authgate_session"), Some("abc123".to_string()));
        assert_eq!(read_cookie(&headers, "missing"), None);
    }

    #[test]
    fn test_bearer_token_preferred() {
        let guard = SessionGuard::new(Arc::new(TokenStore::new()), "authgate_session");
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("authgate_session=cookie"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer header"));

        assert_eq!(guard.extract_session_token(&headers), Some("header".to_string()));
    }

    #[test]
    fn test_authenticated_user_debug_hides_session_id() {
        let user = AuthenticatedUser {
            user_id: "alice".to_string(),
            session_id: "session-id-value".to_string(),
            claims: claims(),
            provider_access_token: Some(AccessToken::new("provider-token")),
        };
        let rendered = format!("{:?}", user);
        assert!(!rendered.contains("session-id-value"));
        assert!(!rendered.contains("provider-token"));
    }

    #[test]
    fn test_session_status_omits_refresh_token() {
        let session = Session::issue(claims(), None, Duration::days(1), Utc::now())
            .with_refresh_token(Some(crate::auth::RefreshToken::new("refresh-value")));

        let json = serde_json::to_string(&AuthResult::from(session)).unwrap();
        assert!(json.contains("authenticated"));
        assert!(!json.contains("refresh-value"));
    }

    #[test]
    fn test_unauthenticated_serialization() {
        let json = serde_json::to_value(AuthResult::Unauthenticated).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "unauthenticated" }));
    }

    fn protected_app(guard: Arc<SessionGuard>) -> Router {
        Router::new()
            .route(
                "/drive",
                get(|Extension(user): Extension<AuthenticatedUser>| async move { user.user_id }),
            )
            .layer(middleware::from_fn_with_state(guard, require_session))
    }

    #[tokio::test]
    async fn test_require_session_redirects() {
        let guard = Arc::new(SessionGuard::new(Arc::new(TokenStore::new()), "authgate_session"));
        let response = protected_app(guard)
            .oneshot(axum::http::Request::builder().uri("/drive?folder=1").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/auth/login?return_to=%2Fdrive%3Ffolder%3D1"
        );
    }

    #[tokio::test]
    async fn test_require_session_passes_user() {
        let (guard, session) = guard_with_session(Duration::days(1), Utc::now()).await;
        let request = axum::http::Request::builder()
            .uri("/drive")
            .header(header::COOKIE, format!("authgate_session={}", session.session_id))
            .body(Body::empty())
            .unwrap();

        let response = protected_app(Arc::new(guard)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
