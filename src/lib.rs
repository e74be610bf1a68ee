use axum::{Router, routing::get};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

pub mod auth;
pub mod config;

use auth::{AuthState, ProviderClient, SessionCoordinator, SessionGuard, TokenStore};
use config::AppConfig;

/// Wire the provider client, session store, coordinator and guard from
/// configuration. Runs OIDC discovery when provider endpoints are not
/// configured.
pub async fn build_state(config: &AppConfig) -> anyhow::Result<Arc<AuthState>> {
    config.auth.validate()?;

    let provider = Arc::new(ProviderClient::from_config(&config.auth).await?);
    debug!(
        issuer = %provider.endpoints().issuer,
        token_endpoint = %provider.endpoints().token_endpoint,
        "Identity provider configured"
    );

    let store = Arc::new(TokenStore::new());
    let coordinator = Arc::new(SessionCoordinator::new(
        &config.auth,
        provider,
        Arc::clone(&store),
    ));
    let guard = Arc::new(SessionGuard::new(store, config.auth.cookie.name.clone()));

    Ok(Arc::new(AuthState {
        coordinator,
        guard,
        cookie: config.auth.cookie.clone(),
    }))
}

/// Build the application router: `/health` plus the auth routes under `/auth`
pub fn build_app(state: Arc<AuthState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .nest("/auth", auth::create_auth_router(state))
        .layer(TraceLayer::new_for_http())
}

async fn bind(config: &AppConfig) -> anyhow::Result<(TcpListener, Router, JoinHandle<()>)> {
    let state = build_state(config).await?;

    let listener = TcpListener::bind(config.server_addr())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", config.server_addr(), e))?;
    info!("listening on {}", listener.local_addr()?);

    let eviction = state
        .coordinator
        .spawn_eviction_task(config.auth.eviction_interval());

    Ok((listener, build_app(state), eviction))
}

async fn serve(
    listener: TcpListener,
    app: Router,
    eviction: JoinHandle<()>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    eviction.abort();
    result?;
    info!("server stopped");
    Ok(())
}

/// Run the server until `shutdown` completes
pub async fn run_server(
    config: AppConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let (listener, app, eviction) = bind(&config).await?;
    serve(listener, app, eviction, shutdown).await
}

/// Starts the server in a background task.
///
/// Port 0 in the configuration picks a free port.
///
/// # Returns
/// The bound port, once the server is accepting connections
pub async fn start_server_with_config(
    config: AppConfig,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<u16> {
    let (listener, app, eviction) = bind(&config).await?;
    let port = listener.local_addr()?.port();

    tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = serve(listener, app, eviction, shutdown).await {
            error!("server error: {}", e);
        }
    });

    Ok(port)
}
