//! Upstream platform access
//!
//! One authenticated connection per bot account, behind the
//! [`UpstreamTransport`] seam. The session wrapper applies the flood-wait
//! handler and the rate limiter in fixed order around every call.

pub mod client;
pub mod limits;
pub mod session;
pub mod testing;

pub use client::GatewayClient;
pub use session::{SessionOptions, UpstreamSession};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::models::{AccountInfo, MediaDescriptor, UpstreamLocator};

/// Smallest read unit the platform accepts.
pub const MIN_CHUNK_SIZE: i64 = 4096;
/// Largest read unit the platform accepts.
pub const MAX_CHUNK_SIZE: i64 = 1024 * 1024;

/// Errors surfaced by the upstream platform.
///
/// Reference expiry is a dedicated kind: the stream handler recovers from it
/// with a refetch, so it must be recognizable without string matching.
#[derive(Error, Debug, Clone)]
pub enum UpstreamError {
    #[error("rate limited, retry after {retry_after:?}")]
    FloodWait { retry_after: Duration },

    #[error("file reference expired")]
    ReferenceExpired,

    #[error("message not found in channel")]
    NotFound,

    #[error("message was deleted or is not accessible")]
    Deleted,

    #[error("upstream request timed out")]
    Timeout,

    #[error("read cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected upstream response: {0}")]
    BadResponse(String),
}

impl UpstreamError {
    /// Hard errors terminate retry-with-another-worker loops.
    #[must_use]
    pub fn is_hard(&self) -> bool {
        matches!(self, Self::NotFound | Self::Deleted)
    }
}

/// Resolved channel peer, cached for the session lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHandle {
    pub channel_id: i64,
    pub access_hash: i64,
}

/// Media payload attached to a channel message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageMedia {
    Document {
        object_id: i64,
        access_hash: i64,
        reference: Vec<u8>,
        size: i64,
        filename: String,
        mime_type: String,
    },
    Photo {
        object_id: i64,
        access_hash: i64,
        reference: Vec<u8>,
        thumb_size: String,
    },
}

impl MessageMedia {
    /// Build the streaming descriptor for this media payload.
    ///
    /// Photos report size 0; the caller serves them as one inline read.
    #[must_use]
    pub fn to_descriptor(&self) -> MediaDescriptor {
        match self {
            Self::Document {
                object_id,
                access_hash,
                reference,
                size,
                filename,
                mime_type,
            } => MediaDescriptor {
                locator: UpstreamLocator::Document {
                    object_id: *object_id,
                    access_hash: *access_hash,
                    reference: reference.clone(),
                },
                size_bytes: *size,
                filename: filename.clone(),
                mime_type: mime_type.clone(),
                object_id: *object_id,
            },
            Self::Photo {
                object_id,
                access_hash,
                reference,
                thumb_size,
            } => MediaDescriptor {
                locator: UpstreamLocator::Photo {
                    object_id: *object_id,
                    access_hash: *access_hash,
                    reference: reference.clone(),
                    thumb_size: thumb_size.clone(),
                },
                size_bytes: 0,
                filename: format!("photo_{object_id}.jpg"),
                mime_type: "image/jpeg".to_string(),
                object_id: *object_id,
            },
        }
    }
}

/// One message as returned by the channel history API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub id: i64,
    pub media: Option<MessageMedia>,
}

/// Raw platform operations used by the data plane.
///
/// Implementations must be safe for concurrent use; the session wrapper
/// serializes throughput with its token bucket, not with a lock.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// The bot account this transport is authenticated as.
    fn account(&self) -> AccountInfo;

    /// Resolve a channel id into an addressable peer.
    async fn resolve_channel(&self, channel_id: i64) -> Result<ChannelHandle, UpstreamError>;

    /// Fetch messages by id from a resolved channel.
    async fn get_messages(
        &self,
        channel: &ChannelHandle,
        ids: &[i64],
    ) -> Result<Vec<ChannelMessage>, UpstreamError>;

    /// Read up to `limit` bytes at `offset`.
    ///
    /// `limit` must be a power of two in `[4096, 1_048_576]` and `offset` a
    /// multiple of `limit`. A read shorter than `limit` signals end of file.
    async fn read_file(
        &self,
        locator: &UpstreamLocator,
        offset: i64,
        limit: i64,
    ) -> Result<Bytes, UpstreamError>;
}

/// Validate platform read alignment constraints.
pub(crate) fn check_read_args(offset: i64, limit: i64) -> Result<(), UpstreamError> {
    if limit < MIN_CHUNK_SIZE || limit > MAX_CHUNK_SIZE || !(limit as u64).is_power_of_two() {
        return Err(UpstreamError::BadResponse(format!(
            "read limit {limit} outside allowed chunk set"
        )));
    }
    if offset < 0 || offset % limit != 0 {
        return Err(UpstreamError::BadResponse(format!(
            "read offset {offset} not aligned to limit {limit}"
        )));
    }
    Ok(())
}
