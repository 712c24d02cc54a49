//! Request log ring
//!
//! Keeps the last 300 direct-stream requests for the status surface.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;

const MAX_ENTRIES: usize = 300;

#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub timestamp: DateTime<Utc>,
    pub message_id: i64,
    pub worker_id: usize,
    pub worker_name: String,
    pub client_ip: String,
    pub range_start: i64,
    pub range_end: i64,
    pub content_length: i64,
    pub bytes_sent: i64,
    pub file_size: i64,
    pub status_code: u16,
    pub duration_ms: u64,
    pub user_agent: String,
    pub referer: String,
}

#[derive(Default)]
pub struct RequestLogStore {
    entries: RwLock<VecDeque<RequestLog>>,
}

impl RequestLogStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, entry: RequestLog) {
        let mut entries = self.entries.write();
        if entries.len() >= MAX_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Copy of all entries, oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<RequestLog> {
        self.entries.read().iter().cloned().collect()
    }
}
