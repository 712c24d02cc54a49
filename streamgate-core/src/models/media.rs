//! Media descriptor and upstream locator types
//!
//! A descriptor is the in-memory record describing one remote media object.
//! Its locator carries the platform's opaque handle (object id, access hash
//! and a volatile reference blob that ages out upstream after ~60 minutes).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Opaque upstream handle used to read a media object's bytes.
///
/// The encoding is internally tagged so a cached descriptor round-trips with
/// the variant intact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpstreamLocator {
    Document {
        object_id: i64,
        access_hash: i64,
        #[serde(with = "base64_bytes")]
        reference: Vec<u8>,
    },
    Photo {
        object_id: i64,
        access_hash: i64,
        #[serde(with = "base64_bytes")]
        reference: Vec<u8>,
        thumb_size: String,
    },
}

impl UpstreamLocator {
    #[must_use]
    pub fn object_id(&self) -> i64 {
        match self {
            Self::Document { object_id, .. } | Self::Photo { object_id, .. } => *object_id,
        }
    }

    #[must_use]
    pub fn access_hash(&self) -> i64 {
        match self {
            Self::Document { access_hash, .. } | Self::Photo { access_hash, .. } => *access_hash,
        }
    }

    #[must_use]
    pub fn reference(&self) -> &[u8] {
        match self {
            Self::Document { reference, .. } | Self::Photo { reference, .. } => reference,
        }
    }
}

/// Descriptor for a remote media object.
///
/// `size_bytes == 0` marks an inline small blob (photo thumbnails and the
/// like) that is served with a single unaligned read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub locator: UpstreamLocator,
    pub size_bytes: i64,
    pub filename: String,
    pub mime_type: String,
    pub object_id: i64,
}

impl MediaDescriptor {
    /// Whether this descriptor points at an inline small blob.
    #[must_use]
    pub fn is_inline(&self) -> bool {
        self.size_bytes == 0
    }

    /// Encode for cache storage.
    pub fn encode(&self) -> Result<Bytes> {
        let data = serde_json::to_vec(self)?;
        Ok(Bytes::from(data))
    }

    /// Decode a cached descriptor.
    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| {
            Error::Internal(format!("corrupt cached descriptor: {e}"))
        })
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
