use std::{net::SocketAddr, sync::Arc};

use axum::{extract::State, http::StatusCode, middleware, routing::get, Router};
use bridge_core::{Bridge, MatrixIntent, UnavailableRemoteClient};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;
mod status;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

const MAX_PROVISIONING_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings()?;
    let database_url = prepare_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let bridge_settings = settings.bridge_settings();
    let intent = MatrixIntent::new(
        &settings.homeserver_url,
        settings.as_token.clone(),
        bridge_settings.naming.bot_user_id(),
    )?;
    let bridge = Bridge::new(
        storage,
        Arc::new(UnavailableRemoteClient),
        Arc::new(intent),
        bridge_settings,
    );

    if let Some(endpoint) = settings.status_endpoint.clone() {
        info!(%endpoint, "forwarding health reports");
        status::spawn_status_forwarder(
            endpoint,
            settings.as_token.clone(),
            bridge.supervisor.subscribe_health(),
        );
    }

    match bridge.start().await {
        Ok(0) => info!("no logged-in accounts; bridge is unconfigured until an account links"),
        Ok(started) => info!(started, "reconnecting logged-in accounts"),
        Err(err) => warn!("failed to start logged-in accounts: {err:#}"),
    }

    if settings.shared_secret.is_empty() {
        warn!("shared_secret is empty; provisioning API will reject every request");
    }
    let state = AppState {
        bridge,
        shared_secret: settings.shared_secret.clone(),
    };
    let app = build_router(Arc::new(state), &settings.provisioning_prefix);

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, prefix = %settings.provisioning_prefix, "bridge listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>, provisioning_prefix: &str) -> Router {
    let provisioning = api::provisioning_router()
        .layer(middleware::from_fn(api::log_requests))
        .layer(RequestBodyLimitLayer::new(MAX_PROVISIONING_BODY_BYTES))
        .layer(middleware::from_fn(api::json_payload_too_large));

    let router = Router::new().route("/healthz", get(healthz));
    let prefix = provisioning_prefix.trim_matches('/');
    let router = if prefix.is_empty() {
        router.merge(provisioning)
    } else {
        router.nest(&format!("/{prefix}"), provisioning)
    };
    router.with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    state.bridge.storage.health_check().await.map_err(|err| {
        error!("health check failed: {err:#}");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok("ok")
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
