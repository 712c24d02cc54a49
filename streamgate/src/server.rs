//! Server lifecycle management
//!
//! Two HTTP servers on separate ports: the data plane and the status
//! endpoint. The status server runs in its own task; either one stopping
//! is fatal for the process.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};

use streamgate_api::http::{create_router, create_status_router, AppState};
use streamgate_core::Config;

pub struct StreamgateServer {
    config: Arc<Config>,
    state: AppState,
}

impl StreamgateServer {
    pub fn new(config: Arc<Config>, state: AppState) -> Self {
        Self { config, state }
    }

    pub async fn start(self) -> Result<()> {
        let main_addr = format!("0.0.0.0:{}", self.config.port);
        let status_addr = format!("0.0.0.0:{}", self.config.status_port);

        let main_listener = tokio::net::TcpListener::bind(&main_addr)
            .await
            .with_context(|| format!("bind data plane address {main_addr}"))?;
        let status_listener = tokio::net::TcpListener::bind(&status_addr)
            .await
            .with_context(|| format!("bind status address {status_addr}"))?;

        info!(host = %self.config.host, "main server is running");
        info!(addr = %status_addr, "status server is running");

        let main_router = create_router(self.state.clone());
        let status_router = create_status_router(self.state);

        let status_handle = tokio::spawn(async move {
            axum::serve(status_listener, status_router).await
        });
        let main_handle = tokio::spawn(async move {
            axum::serve(main_listener, main_router).await
        });

        tokio::select! {
            result = main_handle => {
                error!("data plane server stopped");
                result?.context("data plane server failed")
            }
            result = status_handle => {
                error!("status server stopped");
                result?.context("status server failed")
            }
        }
    }
}
