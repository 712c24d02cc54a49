//! Descriptor lookup through the metadata cache
//!
//! Keys are `direct:<channel_id>:<message_id>:<worker_account_id>` — the
//! account id is part of the key because the upstream ties file references
//! to the bot account that fetched them. The TTL (240 s) sits well below the
//! ~60 minute reference lifetime.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::media_cache::DIRECT_DESCRIPTOR_TTL;
use crate::cache::MediaCache;
use crate::models::MediaDescriptor;
use crate::upstream::UpstreamSession;
use crate::{Error, Result};

pub struct MediaService {
    cache: Arc<MediaCache>,
    channel_id: i64,
    ttl: Duration,
}

impl MediaService {
    #[must_use]
    pub fn new(cache: Arc<MediaCache>, channel_id: i64) -> Self {
        Self {
            cache,
            channel_id,
            ttl: DIRECT_DESCRIPTOR_TTL,
        }
    }

    #[must_use]
    pub fn channel_id(&self) -> i64 {
        self.channel_id
    }

    fn cache_key(&self, message_id: i64, account_id: i64) -> String {
        format!("direct:{}:{}:{}", self.channel_id, message_id, account_id)
    }

    /// Fetch the descriptor for a message, serving repeats from the cache.
    pub async fn descriptor(
        &self,
        session: &UpstreamSession,
        message_id: i64,
    ) -> Result<MediaDescriptor> {
        let account_id = session.account().id;
        let key = self.cache_key(message_id, account_id);

        if let Some(cached) = self.cache.get(&key) {
            match MediaDescriptor::decode(&cached) {
                Ok(descriptor) => {
                    debug!(message_id, account_id, "descriptor served from cache");
                    return Ok(descriptor);
                }
                Err(e) => {
                    warn!(message_id, error = %e, "dropping undecodable cache entry");
                    self.cache.delete(&key);
                }
            }
        }

        debug!(
            channel_id = self.channel_id,
            message_id, account_id, "fetching descriptor from upstream"
        );
        let messages = session.get_messages(self.channel_id, &[message_id]).await?;
        let Some(message) = messages.into_iter().next() else {
            return Err(Error::NotFound("message not found in channel".to_string()));
        };
        let Some(media) = message.media else {
            return Err(Error::NotFound(
                "message was deleted or is not accessible".to_string(),
            ));
        };

        let descriptor = media.to_descriptor();
        match descriptor.encode() {
            Ok(encoded) => self.cache.put(&key, encoded, self.ttl),
            Err(e) => warn!(message_id, error = %e, "failed to cache descriptor"),
        }

        debug!(
            message_id,
            filename = %descriptor.filename,
            size_bytes = descriptor.size_bytes,
            "descriptor fetched and cached"
        );
        Ok(descriptor)
    }

    /// Drop the cached entry and fetch a fresh descriptor. Used after the
    /// upstream reports an expired reference mid-stream.
    pub async fn refetch_descriptor(
        &self,
        session: &UpstreamSession,
        message_id: i64,
    ) -> Result<MediaDescriptor> {
        let account_id = session.account().id;
        info!(
            channel_id = self.channel_id,
            message_id, account_id, "refetching descriptor after reference expiry"
        );
        self.cache.delete(&self.cache_key(message_id, account_id));
        self.descriptor(session, message_id).await
    }
}
