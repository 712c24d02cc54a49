mod server;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use streamgate_core::cache::MediaCache;
use streamgate_core::pool::{start_workers, StartOptions, Worker, WorkerPool};
use streamgate_core::upstream::{GatewayClient, SessionOptions, UpstreamSession};
use streamgate_core::Config;

use server::StreamgateServer;

#[derive(Parser)]
#[command(name = "streamgate", version, about = "Multi-account media streaming gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway with the given configuration.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Platform API id
    #[arg(long, env = "API_ID", default_value_t = 0)]
    api_id: i32,

    /// Platform API hash
    #[arg(long, env = "API_HASH", default_value = "")]
    api_hash: String,

    /// Primary bot token
    #[arg(long, env = "BOT_TOKEN", default_value = "")]
    bot_token: String,

    /// Platform gateway endpoint
    #[arg(long, env = "API_BASE_URL", default_value = streamgate_core::config::DEFAULT_API_BASE_URL)]
    api_base_url: String,

    /// Log channel id
    #[arg(long, env = "LOG_CHANNEL", default_value_t = 0)]
    log_channel_id: i64,

    /// Media channel served by the direct route
    #[arg(long, env = "MEDIA_CHANNEL_ID", default_value_t = 0)]
    media_channel_id: i64,

    /// Data plane port
    #[arg(long, env = "PORT", default_value_t = streamgate_core::config::DEFAULT_PORT)]
    port: u16,

    /// Status server port
    #[arg(long, env = "STATUS_PORT", default_value_t = streamgate_core::config::DEFAULT_STATUS_PORT)]
    status_port: u16,

    /// Public base URL for generated links (auto-detected when empty)
    #[arg(long, env = "HOST", default_value = "")]
    host: String,

    /// Detect the public IP instead of the local one
    #[arg(long, env = "USE_PUBLIC_IP", default_value_t = false)]
    use_public_ip: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Development mode (pretty logs)
    #[arg(long, env = "DEV", default_value_t = false)]
    dev: bool,

    /// Persist per-worker upstream sessions to ./sessions
    #[arg(long, env = "USE_SESSION_FILE", default_value_t = true)]
    use_session_file: bool,

    /// Per-worker startup budget in seconds
    #[arg(long, env = "WORKER_START_TIMEOUT_SECONDS", default_value_t = streamgate_core::config::DEFAULT_WORKER_START_TIMEOUT_SECS)]
    worker_start_timeout_seconds: u64,

    /// Identity project for stream auth (disabled when empty)
    #[arg(long, env = "FIREBASE_PROJECT_ID", default_value = "")]
    firebase_project_id: String,

    /// Identity signing-key endpoint
    #[arg(long, env = "FIREBASE_CERTS_URL", default_value = streamgate_core::config::DEFAULT_CERTS_URL)]
    firebase_certs_url: String,

    /// Stream session lifetime in seconds
    #[arg(long, env = "STREAM_SESSION_TTL_SECONDS", default_value_t = streamgate_core::config::DEFAULT_SESSION_TTL_SECS)]
    stream_session_ttl_seconds: u64,

    /// Expired-session sweep interval in seconds
    #[arg(long, env = "STREAM_SESSION_CLEANUP_SECONDS", default_value_t = streamgate_core::config::DEFAULT_SESSION_CLEANUP_SECS)]
    stream_session_cleanup_seconds: u64,

    /// Session cookie name
    #[arg(long, env = "STREAM_SESSION_COOKIE_NAME", default_value = streamgate_core::config::DEFAULT_SESSION_COOKIE_NAME)]
    stream_session_cookie_name: String,

    /// Mark the session cookie Secure
    #[arg(long, env = "STREAM_SESSION_COOKIE_SECURE", default_value_t = true)]
    stream_session_cookie_secure: bool,

    /// Session cookie domain
    #[arg(long, env = "STREAM_SESSION_COOKIE_DOMAIN", default_value = "")]
    stream_session_cookie_domain: String,

    /// Legacy HMAC secret for signed stream URLs
    #[arg(long, env = "STREAM_SECRET", default_value = "")]
    stream_secret: String,

    /// Legacy URL hash length (5..=32)
    #[arg(long, env = "HASH_LENGTH", default_value_t = streamgate_core::config::DEFAULT_HASH_LENGTH)]
    hash_length: u8,
}

impl RunArgs {
    fn into_config(self) -> Config {
        Config {
            api_id: self.api_id,
            api_hash: self.api_hash,
            bot_token: self.bot_token,
            api_base_url: self.api_base_url,
            log_channel_id: self.log_channel_id,
            media_channel_id: self.media_channel_id,
            multi_tokens: Vec::new(),
            port: self.port,
            status_port: self.status_port,
            host: self.host,
            use_public_ip: self.use_public_ip,
            log_level: self.log_level,
            dev: self.dev,
            use_session_file: self.use_session_file,
            worker_start_timeout_seconds: self.worker_start_timeout_seconds,
            firebase_project_id: self.firebase_project_id,
            firebase_certs_url: self.firebase_certs_url,
            stream_session_ttl_seconds: self.stream_session_ttl_seconds,
            stream_session_cleanup_seconds: self.stream_session_cleanup_seconds,
            stream_session_cookie_name: self.stream_session_cookie_name,
            stream_session_cookie_secure: self.stream_session_cookie_secure,
            stream_session_cookie_domain: self.stream_session_cookie_domain,
            stream_secret: self.stream_secret,
            hash_length: self.hash_length,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { command } = Cli::parse();
    let Command::Run(args) = command;

    let mut config = args.into_config();

    // 1. Logging, then configuration refinement under it.
    streamgate_core::logging::init_logging(config.dev, &config.log_level)?;
    info!("streamgate starting");

    // 2. Configuration: env token discovery, normalization, validation.
    config.load_multi_tokens_from_env();
    config.normalize();
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        anyhow::bail!("configuration validation failed with {} error(s)", errors.len());
    }
    config.resolve_host().await;

    let config = Arc::new(config);

    // 3. Metadata cache.
    let cache = Arc::new(MediaCache::default());

    // 4. Primary session.
    let session_dir = config.use_session_file.then(|| PathBuf::from("sessions"));
    if let Some(dir) = &session_dir {
        std::fs::create_dir_all(dir)?;
        info!("using session files for workers");
    }

    let pool = Arc::new(WorkerPool::new());
    let primary = connect_session(&config, 1, &config.bot_token, session_dir.as_deref()).await?;
    pool.add(Arc::new(Worker::new(1, primary)));

    // 5. Extra workers from MULTI_TOKEN env vars, bounded parallel startup.
    let start_opts = StartOptions {
        start_timeout: std::time::Duration::from_secs(config.worker_start_timeout_seconds.max(1)),
        ..StartOptions::default()
    };
    let connect_config = config.clone();
    let connect_dir = session_dir.clone();
    let started = start_workers(&pool, &config.multi_tokens, &start_opts, move |id, token| {
        let config = connect_config.clone();
        let dir = connect_dir.clone();
        async move { connect_session(&config, id, &token, dir.as_deref()).await }
    })
    .await;
    info!(
        workers = pool.len(),
        extra_started = started,
        extra_configured = config.multi_tokens.len(),
        "worker pool ready"
    );
    if started < config.multi_tokens.len() {
        warn!(
            missing = config.multi_tokens.len() - started,
            "continuing without some workers"
        );
    }

    // 6. Routes and servers.
    let state = streamgate_api::http::AppState::new(config.clone(), pool, cache)?;
    StreamgateServer::new(config, state).start().await
}

async fn connect_session(
    config: &Config,
    worker_id: usize,
    token: &str,
    session_dir: Option<&std::path::Path>,
) -> Result<Arc<UpstreamSession>> {
    let client = GatewayClient::connect(&config.api_base_url, config.api_id, &config.api_hash, token)
        .await
        .map_err(|e| anyhow::anyhow!("connect worker {worker_id}: {e}"))?;
    let opts = SessionOptions {
        state_file: session_dir.map(|dir| dir.join(format!("worker-{worker_id}.session"))),
    };
    Ok(Arc::new(UpstreamSession::new(Arc::new(client), opts)))
}
