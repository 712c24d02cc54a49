//! Gateway configuration
//!
//! Loaded once at startup and read immutably thereafter. Values come from
//! the CLI (flags with env fallbacks) plus `MULTI_TOKEN<N>` environment
//! discovery for the extra worker accounts.

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_STATUS_PORT: u16 = 9090;
pub const DEFAULT_HASH_LENGTH: u8 = 6;
pub const DEFAULT_WORKER_START_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 28800;
pub const DEFAULT_SESSION_CLEANUP_SECS: u64 = 60;
pub const DEFAULT_SESSION_COOKIE_NAME: &str = "fsb_stream_session";
pub const DEFAULT_ISSUER_PREFIX: &str = "https://securetoken.google.com";
pub const DEFAULT_CERTS_URL: &str =
    "https://www.googleapis.com/robot/v1/metadata/x509/securetoken@system.gserviceaccount.com";
pub const DEFAULT_API_BASE_URL: &str = "https://gateway.chatapi.dev";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Platform identity and channels
    pub api_id: i32,
    pub api_hash: String,
    pub bot_token: String,
    pub api_base_url: String,
    pub log_channel_id: i64,
    pub media_channel_id: i64,
    /// Extra bot tokens that become worker sessions.
    pub multi_tokens: Vec<String>,

    // HTTP surface
    pub port: u16,
    pub status_port: u16,
    /// Public base URL for generated links; auto-detected when empty.
    pub host: String,
    pub use_public_ip: bool,

    // Logging
    pub log_level: String,
    pub dev: bool,

    // Workers
    pub use_session_file: bool,
    pub worker_start_timeout_seconds: u64,

    // Stream auth
    pub firebase_project_id: String,
    pub firebase_certs_url: String,
    pub stream_session_ttl_seconds: u64,
    pub stream_session_cleanup_seconds: u64,
    pub stream_session_cookie_name: String,
    pub stream_session_cookie_secure: bool,
    pub stream_session_cookie_domain: String,
    /// Legacy HMAC shared secret; signature checks run when non-empty.
    pub stream_secret: String,

    /// Reserved for legacy URL schemes; clamped to 5..=32 on load.
    pub hash_length: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_id: 0,
            api_hash: String::new(),
            bot_token: String::new(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            log_channel_id: 0,
            media_channel_id: 0,
            multi_tokens: Vec::new(),
            port: DEFAULT_PORT,
            status_port: DEFAULT_STATUS_PORT,
            host: String::new(),
            use_public_ip: false,
            log_level: "info".to_string(),
            dev: false,
            use_session_file: true,
            worker_start_timeout_seconds: DEFAULT_WORKER_START_TIMEOUT_SECS,
            firebase_project_id: String::new(),
            firebase_certs_url: DEFAULT_CERTS_URL.to_string(),
            stream_session_ttl_seconds: DEFAULT_SESSION_TTL_SECS,
            stream_session_cleanup_seconds: DEFAULT_SESSION_CLEANUP_SECS,
            stream_session_cookie_name: DEFAULT_SESSION_COOKIE_NAME.to_string(),
            stream_session_cookie_secure: true,
            stream_session_cookie_domain: String::new(),
            stream_secret: String::new(),
            hash_length: DEFAULT_HASH_LENGTH,
        }
    }
}

impl Config {
    /// Fail-fast checks for settings the data plane cannot run without.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.api_id == 0 {
            errors.push("api_id is required".to_string());
        }
        if self.api_hash.is_empty() {
            errors.push("api_hash is required".to_string());
        }
        if self.bot_token.is_empty() {
            errors.push("bot_token is required".to_string());
        }
        if self.log_channel_id == 0 {
            errors.push("log_channel_id is required".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Clamp and normalize loaded values. Logs what it changes.
    pub fn normalize(&mut self) {
        self.log_channel_id = normalize_channel_id(self.log_channel_id);
        if self.media_channel_id != 0 {
            self.media_channel_id = normalize_channel_id(self.media_channel_id);
            tracing::info!(media_channel_id = self.media_channel_id, "media channel configured");
        } else {
            tracing::warn!("media_channel_id not set, the direct stream route will not work");
        }

        if !(5..=32).contains(&self.hash_length) {
            let clamped = if self.hash_length > 32 { 32 } else { DEFAULT_HASH_LENGTH };
            tracing::info!(
                from = self.hash_length,
                to = clamped,
                "hash_length out of range, clamping"
            );
            self.hash_length = clamped;
        }

        if self.stream_session_ttl_seconds == 0 {
            self.stream_session_ttl_seconds = DEFAULT_SESSION_TTL_SECS;
        }
        if self.stream_session_cleanup_seconds == 0 {
            self.stream_session_cleanup_seconds = DEFAULT_SESSION_CLEANUP_SECS;
        }
        if self.stream_session_cookie_name.is_empty() {
            self.stream_session_cookie_name = DEFAULT_SESSION_COOKIE_NAME.to_string();
        }

        if self.firebase_project_id.is_empty() && self.stream_secret.is_empty() {
            tracing::warn!("no stream auth configured, the direct route is publicly accessible");
        }
    }

    /// Whether session-token stream auth is enabled.
    #[must_use]
    pub fn stream_auth_enabled(&self) -> bool {
        !self.firebase_project_id.is_empty()
    }

    /// Discover extra worker tokens from `MULTI_TOKEN<N>` env variables.
    pub fn load_multi_tokens_from_env(&mut self) {
        let mut tokens: Vec<(String, String)> = std::env::vars()
            .filter(|(name, _)| {
                name.strip_prefix("MULTI_TOKEN")
                    .is_some_and(|suffix| !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()))
            })
            .filter(|(_, value)| !value.trim().is_empty())
            .collect();
        // Numeric order so worker ids are stable across restarts.
        tokens.sort_by_key(|(name, _)| {
            name.trim_start_matches("MULTI_TOKEN").parse::<u32>().unwrap_or(u32::MAX)
        });
        self.multi_tokens = tokens
            .into_iter()
            .map(|(_, value)| value.trim().to_string())
            .collect();
    }

    /// Resolve the public base URL when `host` is unset.
    pub async fn resolve_host(&mut self) {
        if !self.host.is_empty() {
            return;
        }
        let ip = if self.use_public_ip {
            match public_ip().await {
                Ok(ip) => {
                    tracing::warn!("using a public IP, consider setting `host` to a domain name");
                    ip
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cannot get public IP, using local IP");
                    local_ip().unwrap_or_else(|| "localhost".to_string())
                }
            }
        } else {
            local_ip().unwrap_or_else(|| "localhost".to_string())
        };
        self.host = format!("http://{}:{}", ip, self.port);
        tracing::info!(host = %self.host, "host not set, automatically detected");
    }
}

/// Normalize a platform channel id: absolute value with the first occurrence
/// of the `100` marker removed. Channel ids arrive in bot-API form
/// (`-100<id>`); the removal is by substring, matching the platform tooling
/// this gateway interoperates with.
#[must_use]
pub fn normalize_channel_id(raw: i64) -> i64 {
    let digits = raw.unsigned_abs().to_string();
    let stripped = digits.replacen("100", "", 1);
    stripped.parse().unwrap_or(0)
}

/// Local-route IP: the source address of an outbound UDP socket.
fn local_ip() -> Option<String> {
    use std::net::UdpSocket;
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

/// Public IP via a lookup service.
async fn public_ip() -> anyhow::Result<String> {
    let ip = reqwest::get("https://api.ipify.org?format=text")
        .await?
        .text()
        .await?;
    Ok(ip.trim().to_string())
}
