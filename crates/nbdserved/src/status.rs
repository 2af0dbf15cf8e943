//! Localhost HTTP status endpoint.
//!
//! A small diagnostics listener on 127.0.0.1 serving a JSON snapshot
//! of the running device configuration. Enabled via the `http` Cargo
//! feature.

use std::io;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use tracing::info;

/// Snapshot of the device configuration, frozen at startup.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub device: String,
    pub size: u64,
    pub block_size: u32,
    pub concurrent_ops: u32,
    pub read_only: bool,
}

/// Serve `GET /status` on 127.0.0.1:`port` until the process exits.
pub async fn serve(port: u16, status: Status) -> io::Result<()> {
    let app = Router::new().route(
        "/status",
        get(move || {
            let status = status.clone();
            async move { Json(status) }
        }),
    );

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!("status endpoint on http://127.0.0.1:{}/status", port);
    axum::serve(listener, app).await
}
