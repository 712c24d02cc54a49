//! Metadata cache
//!
//! Bounded, size-weighed cache of encoded media descriptors with a per-entry
//! TTL. The TTL is kept well below the upstream reference lifetime so the
//! risk of mid-stream expiry stays bounded; stale entries are also deleted
//! explicitly after a reference-expired error forces a refetch.

use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default capacity: 100 MiB of encoded descriptors.
pub const DEFAULT_CAPACITY_BYTES: u64 = 100 * 1024 * 1024;

/// TTL for direct-stream descriptors.
pub const DIRECT_DESCRIPTOR_TTL: Duration = Duration::from_secs(240);

#[derive(Clone)]
struct Entry {
    data: Bytes,
    ttl: Duration,
}

struct PerEntryTtl;

impl moka::Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Thread-safe byte cache keyed by request fingerprint.
pub struct MediaCache {
    inner: moka::sync::Cache<String, Entry>,
}

impl MediaCache {
    #[must_use]
    pub fn new(capacity_bytes: u64) -> Self {
        let inner = moka::sync::Cache::builder()
            .max_capacity(capacity_bytes)
            .weigher(|key: &String, entry: &Entry| {
                (key.len() + entry.data.len()).try_into().unwrap_or(u32::MAX)
            })
            .expire_after(PerEntryTtl)
            .build();
        debug!(capacity_bytes, "metadata cache initialized");
        Self { inner }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.inner.get(key).map(|entry| entry.data)
    }

    pub fn put(&self, key: &str, data: Bytes, ttl: Duration) {
        self.inner.insert(key.to_string(), Entry { data, ttl });
    }

    pub fn delete(&self, key: &str) {
        self.inner.invalidate(key);
    }
}

impl Default for MediaCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY_BYTES)
    }
}
