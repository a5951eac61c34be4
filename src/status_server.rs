// HTTP status endpoint

//! HTTP status endpoint
//!
//! A single read-only `GET /` returning the controller's current status
//! snapshot as JSON. Handlers never touch the controller loop directly —
//! they read a consistent copy of the snapshot behind a shared lock.

use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Default)]
pub struct StatusSnapshot {
    pub state: String,
    pub suspicion: f64,
    pub reason: String,
    pub wifi: serde_json::Value,
    pub last_probe: Option<serde_json::Value>,
}

pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

async fn get_status(axum::extract::State(status): axum::extract::State<SharedStatus>) -> Json<StatusSnapshot> {
    Json(status.read().await.clone())
}

/// Bind and serve the status endpoint in the background. Returns a join
/// handle so the controller can abort it on shutdown.
pub fn spawn(host: &str, port: u16, status: SharedStatus) -> Result<tokio::task::JoinHandle<()>, anyhow::Error> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let app = Router::new().route("/", get(get_status)).with_state(status);

    Ok(tokio::spawn(async move {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(err) = axum::serve(listener, app).await {
                    log::error!("status server exited: {err}");
                }
            }
            Err(err) => log::error!("status server failed to bind {addr}: {err}"),
        }
    }))
}
