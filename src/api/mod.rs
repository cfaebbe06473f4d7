//! Local HTTP status API
//!
//! Lets a UI poll the agreed view of each network and trigger admin actions:
//! - GET  /networks
//! - GET  /networks/:name/consensus
//! - GET  /networks/:name/miners
//! - GET  /networks/:name/service_url?path=..&latest=bool
//! - POST /networks/:name/reset
//! - POST /networks/:name/step       {"step": n}
//! - POST /networks/:name/threshold  {"threshold": n}
//! - POST /networks/:name/urls       {"urls": [..]}

pub mod consensus_routes;

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::network_state::Networks;

pub use consensus_routes::ApiError;

#[derive(Clone)]
pub struct ApiState {
    pub networks: Arc<Networks>,
}

pub fn create_router(networks: Arc<Networks>) -> Router {
    let state = ApiState { networks };
    Router::new()
        .route("/networks", get(consensus_routes::list_networks))
        .route(
            "/networks/:name/consensus",
            get(consensus_routes::get_consensus),
        )
        .route("/networks/:name/miners", get(consensus_routes::get_miners))
        .route(
            "/networks/:name/service_url",
            get(consensus_routes::get_service_url),
        )
        .route("/networks/:name/reset", post(consensus_routes::reset))
        .route("/networks/:name/step", post(consensus_routes::set_step))
        .route(
            "/networks/:name/threshold",
            post(consensus_routes::set_threshold),
        )
        .route("/networks/:name/urls", post(consensus_routes::add_urls))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the status API until `shutdown` resolves
pub async fn serve(
    addr: SocketAddr,
    networks: Arc<Networks>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        target: "volition::api",
        "[API] Status API listening on http://{}",
        listener.local_addr()?
    );
    axum::serve(listener, create_router(networks))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
