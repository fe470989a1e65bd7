//! Presence registry and signaling relay for the media mesh.
//!
//! Peers connect over a websocket at `/ws`, receive an assigned id and the full
//! roster on every membership change, and exchange opaque negotiation envelopes
//! that the relay forwards to exactly one named recipient.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod registry;
pub mod websocket;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use registry::{Membership, Registry, RegistryConfig, RegistryError, RelayError};

use crate::handlers::{health_check, list_peers, render_metrics};
use crate::websocket::{websocket_handler, SignalingState};

/// Build the relay router. `/metrics` is only mounted when a recorder handle is given.
pub fn router(registry: Registry, metrics: Option<PrometheusHandle>) -> Router {
    let http_routes = Router::new()
        .route("/health", get(health_check))
        .route("/peers", get(list_peers))
        .with_state(registry.clone());

    let ws_routes = Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(SignalingState::new(registry));

    let mut app = Router::new().merge(http_routes).merge(ws_routes);
    if let Some(handle) = metrics {
        app = app.merge(
            Router::new()
                .route("/metrics", get(render_metrics))
                .with_state(handle),
        );
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}
