// Authentication Module
// OAuth2/OIDC authorization-code sign-in with server-side sessions

pub mod claims;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod guard;
pub mod pkce;
pub mod provider;
pub mod routes;
pub mod state;
pub mod store;

pub use claims::{AccessToken, IdentityClaims, RefreshToken};
pub use config::{AuthConfig, CookieConfig, ProviderConfig, SameSitePolicy};
pub use coordinator::{
    LoginAttempt, LoginEvent, LoginPhase, RedirectInstruction, SessionCoordinator,
};
pub use error::AuthError;
pub use guard::{AuthResult, AuthenticatedUser, SessionGuard, require_session};
pub use provider::{
    ExchangeOutcome, ProviderClient, ProviderEndpoints, RefreshedTokens, TokenResponse,
};
pub use routes::{AuthState, create_auth_router};
pub use state::{AuthorizationRequest, PendingRequests, StateRejection};
pub use store::{NoPersistence, Session, SessionPersistence, TokenStore};
