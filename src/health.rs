//! Minimal liveness endpoint for container orchestrators.

use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub fn spawn_health_server(port: u16) -> JoinHandle<()> {
    tokio::spawn(async move {
        let app = Router::new()
            .route("/", get(|| async { "OK" }))
            .route("/healthz", get(|| async { "OK" }));
        let addr = format!("0.0.0.0:{port}");
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!("health endpoint listening on {addr}");
                if let Err(e) = axum::serve(listener, app).await {
                    error!("health server error: {e}");
                }
            }
            Err(e) => error!("failed to bind health endpoint on {addr}: {e}"),
        }
    })
}
