mod routes;

use crate::routes::{
    get_session, health_check, record_activity, session_events, session_health, start_session,
    stop_session,
};
use anyhow::Context;
use axum::http::{StatusCode, Uri};
use axum::routing::{get, post};
use axum::{Extension, Router};
use nbcompute_client::{ClientConfig, HttpComputeClient};
use nbcompute_controller::{Controller, ControllerConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone)]
pub struct State {
    pub controller: Arc<Controller>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let client_config = ClientConfig::from_env()?;
    info!(
        api_base_url = %client_config.api_base_url,
        application = %client_config.endpoint_application,
        "compute API configured"
    );
    let client = HttpComputeClient::new(client_config).context("build compute client")?;

    let config = ControllerConfig::from_env();
    info!(
        instance_size = %config.instance.instance_size,
        image = %config.instance.image,
        provisioning_deadline_secs = config.poll.provisioning_deadline.as_secs(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "controller configured"
    );
    let controller = Arc::new(Controller::new(Arc::new(client), config));

    let port: u16 = std::env::var("NBCOMPUTE_PORT")
        .ok()
        .map(|p| p.trim().parse::<u16>())
        .transpose()
        .context("NBCOMPUTE_PORT must be a port number")?
        .unwrap_or(8080);
    let addr: std::net::SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .context("parse bind address")?;

    let shutdown = CancellationToken::new();
    let sweeper = {
        let controller = controller.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { controller.run_idle_sweeper(shutdown).await })
    };

    let server = axum::Server::bind(&addr).serve(
        router(State {
            controller: controller.clone(),
        })
        .into_make_service(),
    );

    info!("Webserver running on http://{addr}");

    let graceful = server.with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
        }
    });

    if let Err(e) = graceful.await {
        error!("Shutdown error: {e}");
    }

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        error!("Idle sweeper task failed: {e}");
    }
    // nothing is persisted, so running instances would be orphaned
    controller.stop_all().await;
    info!("Shutdown complete");

    Ok(())
}

pub(crate) fn router(state: State) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/sessions/:identity", get(get_session))
        .route("/sessions/:identity/start", post(start_session))
        .route("/sessions/:identity/stop", post(stop_session))
        .route("/sessions/:identity/health", get(session_health))
        .route("/sessions/:identity/events", get(session_events))
        .route("/sessions/:identity/activity", post(record_activity))
        .fallback(fallback)
        .layer(Extension(state))
}

async fn fallback(uri: Uri) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("No route for {uri}"))
}
