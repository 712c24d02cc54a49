//! HTTP surface
//!
//! Two routers on separate ports: the data plane (direct stream + token
//! exchange) and the operational status endpoint, kept apart so operator
//! curiosity never contends with streaming traffic.

pub mod direct;
pub mod error;
pub mod exchange;
pub mod middleware;
pub mod range;
pub mod request_log;
pub mod status;

pub use self::error::{AppError, AppResult};

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

use streamgate_core::cache::MediaCache;
use streamgate_core::pool::WorkerPool;
use streamgate_core::service::{IdentityVerifier, MediaService, SessionStore};
use streamgate_core::Config;

use self::request_log::RequestLogStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: Arc<WorkerPool>,
    pub media: Arc<MediaService>,
    pub sessions: Option<Arc<SessionStore>>,
    pub verifier: Option<Arc<IdentityVerifier>>,
    pub request_logs: Arc<RequestLogStore>,
}

impl AppState {
    /// Wire up the shared state from configuration and the already-built
    /// metadata cache and worker pool.
    ///
    /// Session-token auth comes up only when an identity project is
    /// configured; the exchange route stays disabled otherwise.
    pub fn new(
        config: Arc<Config>,
        pool: Arc<WorkerPool>,
        cache: Arc<MediaCache>,
    ) -> anyhow::Result<Self> {
        let media = Arc::new(MediaService::new(cache, config.media_channel_id));

        let (sessions, verifier) = if config.stream_auth_enabled() {
            let verifier = IdentityVerifier::new(
                &config.firebase_project_id,
                streamgate_core::config::DEFAULT_ISSUER_PREFIX,
                &config.firebase_certs_url,
            )?;
            let sessions = SessionStore::new(
                std::time::Duration::from_secs(config.stream_session_ttl_seconds),
                std::time::Duration::from_secs(config.stream_session_cleanup_seconds),
            );
            tracing::info!(
                project_id = %config.firebase_project_id,
                ttl_seconds = config.stream_session_ttl_seconds,
                "stream auth enabled"
            );
            (Some(sessions), Some(Arc::new(verifier)))
        } else {
            tracing::info!("stream auth disabled (no identity project configured)");
            (None, None)
        };

        Ok(Self {
            config,
            pool,
            media,
            sessions,
            verifier,
            request_logs: Arc::new(RequestLogStore::new()),
        })
    }
}

#[derive(Debug, Serialize)]
struct RootResponse {
    message: &'static str,
    ok: bool,
    uptime: String,
    version: &'static str,
}

async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Server is running.",
        ok: true,
        uptime: format_uptime(streamgate_core::SERVER_START_TIME.elapsed().as_secs()),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Compact `1d2h3m4s` uptime rendering.
fn format_uptime(total_seconds: u64) -> String {
    let days = total_seconds / 86400;
    let hours = (total_seconds % 86400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{days}d"));
    }
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    out.push_str(&format!("{seconds}s"));
    out
}

/// Data-plane router: root, direct stream, token exchange.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(root))
        // `get` also routes HEAD to the same handler.
        .route("/direct/:message_id", get(direct::direct_stream))
        // Also served on the dedicated status port.
        .route("/status", get(status::status));

    if state.sessions.is_some() {
        router = router.route(
            "/auth/firebase/exchange",
            post(exchange::exchange).get(exchange::exchange),
        );
    }

    router.with_state(state)
}

/// Status router, served on its own port.
pub fn create_status_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status::status))
        .with_state(state)
}
