//! In-memory upstream fake for tests
//!
//! Seeded with deterministic file contents per `(channel, message)` pair.
//! Supports scripted read errors, reference rotation (to exercise the
//! expiry-recovery path) and configurable per-call latency.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{ChannelHandle, ChannelMessage, MessageMedia, UpstreamError, UpstreamTransport};
use crate::models::{AccountInfo, MediaDescriptor, UpstreamLocator};

struct SeededFile {
    object_id: i64,
    data: Bytes,
    filename: String,
    mime_type: String,
    /// Current reference generation; encoded into handed-out references so
    /// stale locators can be detected on read.
    generation: u64,
}

/// Deterministic file contents: byte at position `i` is `i % 251`.
#[must_use]
pub fn pattern_bytes(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

pub struct FakeUpstream {
    account: AccountInfo,
    files: Mutex<HashMap<(i64, i64), SeededFile>>,
    scripted_read_errors: Mutex<VecDeque<UpstreamError>>,
    scripted_message_errors: Mutex<VecDeque<UpstreamError>>,
    message_latency: Mutex<Duration>,
    pub resolve_calls: AtomicU64,
    pub message_calls: AtomicU64,
    pub read_calls: AtomicU64,
}

impl FakeUpstream {
    #[must_use]
    pub fn new(account_id: i64, username: &str) -> Self {
        Self {
            account: AccountInfo {
                id: account_id,
                username: username.to_string(),
            },
            files: Mutex::new(HashMap::new()),
            scripted_read_errors: Mutex::new(VecDeque::new()),
            scripted_message_errors: Mutex::new(VecDeque::new()),
            message_latency: Mutex::new(Duration::ZERO),
            resolve_calls: AtomicU64::new(0),
            message_calls: AtomicU64::new(0),
            read_calls: AtomicU64::new(0),
        }
    }

    /// Seed a document of `len` pattern bytes.
    pub fn seed_file(&self, channel_id: i64, message_id: i64, len: usize, filename: &str, mime: &str) {
        self.files.lock().insert(
            (channel_id, message_id),
            SeededFile {
                object_id: message_id * 1000,
                data: pattern_bytes(len),
                filename: filename.to_string(),
                mime_type: mime.to_string(),
                generation: 0,
            },
        );
    }

    /// Seed an inline photo blob.
    pub fn seed_photo(&self, channel_id: i64, message_id: i64, data: Bytes) {
        self.files.lock().insert(
            (channel_id, message_id),
            SeededFile {
                object_id: -(message_id * 1000),
                data,
                filename: String::new(),
                mime_type: String::new(),
                generation: 0,
            },
        );
    }

    /// The next `read_file` call fails with `err` (queueable).
    pub fn inject_read_error(&self, err: UpstreamError) {
        self.scripted_read_errors.lock().push_back(err);
    }

    /// The next `get_messages` call fails with `err` (queueable).
    pub fn inject_message_error(&self, err: UpstreamError) {
        self.scripted_message_errors.lock().push_back(err);
    }

    /// Delay every `get_messages` call, for racing tests.
    pub fn set_message_latency(&self, latency: Duration) {
        *self.message_latency.lock() = latency;
    }

    /// Age out the current reference: previously handed-out locators now
    /// fail with `ReferenceExpired` until the descriptor is refetched.
    pub fn rotate_reference(&self, channel_id: i64, message_id: i64) {
        if let Some(file) = self.files.lock().get_mut(&(channel_id, message_id)) {
            file.generation += 1;
        }
    }

    /// Expected file bytes for assertions.
    #[must_use]
    pub fn file_bytes(&self, channel_id: i64, message_id: i64) -> Option<Bytes> {
        self.files
            .lock()
            .get(&(channel_id, message_id))
            .map(|f| f.data.clone())
    }

    /// Descriptor as a fresh fetch would produce it.
    #[must_use]
    pub fn descriptor_for(&self, channel_id: i64, message_id: i64) -> Option<MediaDescriptor> {
        self.files
            .lock()
            .get(&(channel_id, message_id))
            .map(|file| Self::media_for(file).to_descriptor())
    }

    fn media_for(file: &SeededFile) -> MessageMedia {
        let reference = file.generation.to_be_bytes().to_vec();
        if file.object_id < 0 {
            MessageMedia::Photo {
                object_id: -file.object_id,
                access_hash: file.object_id ^ 0x5a5a,
                reference,
                thumb_size: "y".to_string(),
            }
        } else {
            MessageMedia::Document {
                object_id: file.object_id,
                access_hash: file.object_id ^ 0x5a5a,
                reference,
                size: file.data.len() as i64,
                filename: file.filename.clone(),
                mime_type: file.mime_type.clone(),
            }
        }
    }

    fn find_by_locator(
        files: &HashMap<(i64, i64), SeededFile>,
        locator: &UpstreamLocator,
    ) -> Option<(Bytes, u64)> {
        let object_id = match locator {
            UpstreamLocator::Document { object_id, .. } => *object_id,
            UpstreamLocator::Photo { object_id, .. } => -*object_id,
        };
        files
            .values()
            .find(|f| f.object_id == object_id)
            .map(|f| (f.data.clone(), f.generation))
    }
}

#[async_trait]
impl UpstreamTransport for FakeUpstream {
    fn account(&self) -> AccountInfo {
        self.account.clone()
    }

    async fn resolve_channel(&self, channel_id: i64) -> Result<ChannelHandle, UpstreamError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ChannelHandle {
            channel_id,
            access_hash: channel_id ^ 0x77,
        })
    }

    async fn get_messages(
        &self,
        channel: &ChannelHandle,
        ids: &[i64],
    ) -> Result<Vec<ChannelMessage>, UpstreamError> {
        self.message_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted_message_errors.lock().pop_front() {
            return Err(err);
        }
        let latency = *self.message_latency.lock();
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }

        let files = self.files.lock();
        let mut messages = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(file) = files.get(&(channel.channel_id, id)) {
                messages.push(ChannelMessage {
                    id,
                    media: Some(Self::media_for(file)),
                });
            }
        }
        Ok(messages)
    }

    async fn read_file(
        &self,
        locator: &UpstreamLocator,
        offset: i64,
        limit: i64,
    ) -> Result<Bytes, UpstreamError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted_read_errors.lock().pop_front() {
            return Err(err);
        }

        let files = self.files.lock();
        let Some((data, generation)) = Self::find_by_locator(&files, locator) else {
            return Err(UpstreamError::BadResponse("unknown file location".to_string()));
        };

        if locator.reference() != generation.to_be_bytes().as_slice() {
            return Err(UpstreamError::ReferenceExpired);
        }

        let offset = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
        if offset >= data.len() {
            return Ok(Bytes::new());
        }
        let end = (offset + limit as usize).min(data.len());
        Ok(data.slice(offset..end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seeded_read_matches_pattern() {
        let fake = FakeUpstream::new(1, "bot_one");
        fake.seed_file(900, 42, 10_000, "a.bin", "application/octet-stream");
        let descriptor = fake.descriptor_for(900, 42).unwrap();

        let data = fake.read_file(&descriptor.locator, 4096, 4096).await.unwrap();
        assert_eq!(data, pattern_bytes(10_000).slice(4096..8192));
    }

    #[tokio::test]
    async fn test_rotated_reference_fails_until_refetch() {
        let fake = FakeUpstream::new(1, "bot_one");
        fake.seed_file(900, 42, 5000, "a.bin", "application/octet-stream");
        let stale = fake.descriptor_for(900, 42).unwrap();

        fake.rotate_reference(900, 42);
        let err = fake.read_file(&stale.locator, 0, 4096).await.unwrap_err();
        assert!(matches!(err, UpstreamError::ReferenceExpired));

        let fresh = fake.descriptor_for(900, 42).unwrap();
        assert!(fake.read_file(&fresh.locator, 0, 4096).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_message_returns_empty_batch() {
        let fake = FakeUpstream::new(1, "bot_one");
        let channel = fake.resolve_channel(900).await.unwrap();
        let messages = fake.get_messages(&channel, &[7]).await.unwrap();
        assert!(messages.is_empty());
    }
}
