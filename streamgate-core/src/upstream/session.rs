//! Authenticated upstream session
//!
//! Wraps a transport with the flood-wait handler and the rate limiter, and
//! keeps the resolved channel peer cached for the session lifetime. Sessions
//! are shared across requests on the same worker.

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use super::limits::{FloodWaitConfig, TokenBucket};
use super::{check_read_args, ChannelHandle, ChannelMessage, UpstreamError, UpstreamTransport};
use crate::models::{AccountInfo, UpstreamLocator};

/// Session construction options.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Persist session state to this file (one file per worker).
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionState {
    account_id: i64,
    username: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

pub struct UpstreamSession {
    transport: Arc<dyn UpstreamTransport>,
    bucket: TokenBucket,
    flood: FloodWaitConfig,
    // Channel peers never change for the life of a session; plain RwLock is
    // fine because it is never held across an await.
    peers: RwLock<HashMap<i64, ChannelHandle>>,
    state_file: Option<PathBuf>,
}

impl UpstreamSession {
    pub fn new(transport: Arc<dyn UpstreamTransport>, opts: SessionOptions) -> Self {
        let session = Self {
            transport,
            bucket: TokenBucket::default(),
            flood: FloodWaitConfig::default(),
            peers: RwLock::new(HashMap::new()),
            state_file: opts.state_file,
        };
        session.persist_state();
        session
    }

    #[must_use]
    pub fn account(&self) -> AccountInfo {
        self.transport.account()
    }

    /// Resolve a channel, serving repeat lookups from the peer cache.
    pub async fn channel_peer(&self, channel_id: i64) -> Result<ChannelHandle, UpstreamError> {
        if let Some(peer) = self.peers.read().get(&channel_id) {
            return Ok(*peer);
        }

        let transport = &self.transport;
        let peer = self
            .call(|| transport.resolve_channel(channel_id))
            .await?;
        self.peers.write().insert(channel_id, peer);
        debug!(channel_id, access_hash = peer.access_hash, "channel peer resolved");
        Ok(peer)
    }

    /// Fetch messages by id from a channel.
    pub async fn get_messages(
        &self,
        channel_id: i64,
        ids: &[i64],
    ) -> Result<Vec<ChannelMessage>, UpstreamError> {
        let peer = self.channel_peer(channel_id).await?;
        let transport = &self.transport;
        self.call(|| transport.get_messages(&peer, ids)).await
    }

    /// Aligned chunk read. `limit` must be a power of two in the platform's
    /// allowed set and `offset` a multiple of it.
    pub async fn read_file(
        &self,
        locator: &UpstreamLocator,
        offset: i64,
        limit: i64,
    ) -> Result<Bytes, UpstreamError> {
        check_read_args(offset, limit)?;
        let transport = &self.transport;
        self.call(|| transport.read_file(locator, offset, limit)).await
    }

    /// Apply the flood-wait handler and rate limiter around one operation.
    async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let mut waits = 0u32;
        loop {
            self.bucket.acquire().await;
            match op().await {
                Err(UpstreamError::FloodWait { retry_after }) if waits < self.flood.max_retries => {
                    waits += 1;
                    warn!(
                        account = %self.transport.account(),
                        ?retry_after,
                        attempt = waits,
                        "flood wait, backing off"
                    );
                    tokio::time::sleep(retry_after).await;
                }
                other => return other,
            }
        }
    }

    fn persist_state(&self) {
        let Some(path) = &self.state_file else {
            return;
        };
        let account = self.transport.account();
        let state = SessionState {
            account_id: account.id,
            username: account.username,
            created_at: chrono::Utc::now(),
        };
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let data = serde_json::to_vec_pretty(&state)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            std::fs::write(path, data)
        };
        if let Err(e) = write() {
            warn!(path = %path.display(), error = %e, "failed to persist session state");
        }
    }
}
