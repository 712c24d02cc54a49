//! Worker pool and load balancing
//!
//! One worker per authenticated bot account. Selection scans all workers
//! and picks the minimum of `active_requests * 10_000 + total_requests`:
//! the active weight dominates so an idle worker always wins, and the total
//! term breaks ties toward the least-used account, spreading quota so no
//! single account's rate limit saturates.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::models::AccountInfo;
use crate::upstream::UpstreamSession;

/// Weight of one active request relative to one historical request.
const ACTIVE_REQUEST_WEIGHT: u64 = 10_000;
/// Length of the recent-latency ring.
const RECENT_LATENCY_SAMPLES: usize = 5;

#[derive(Debug, Default)]
pub struct WorkerMetrics {
    active_requests: AtomicI64,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_response_nanos: AtomicU64,
    last_request_at: Mutex<Option<DateTime<Utc>>>,
    // Ring of the last few request latencies; the lock is held only for
    // push/sum, never across I/O.
    recent_latencies: Mutex<VecDeque<Duration>>,
}

/// Point-in-time view of one worker, for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub username: String,
    pub active_requests: i64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub average_response_ms: f64,
    pub uptime_seconds: u64,
    pub last_request_at: Option<DateTime<Utc>>,
}

pub struct Worker {
    pub id: usize,
    pub account: AccountInfo,
    pub session: Arc<UpstreamSession>,
    started_at: Instant,
    metrics: WorkerMetrics,
}

impl Worker {
    #[must_use]
    pub fn new(id: usize, session: Arc<UpstreamSession>) -> Self {
        Self {
            id,
            account: session.account(),
            session,
            started_at: Instant::now(),
            metrics: WorkerMetrics::default(),
        }
    }

    /// Mark a request as started on this worker.
    pub fn start_request(&self) {
        self.metrics.active_requests.fetch_add(1, Ordering::SeqCst);
        self.metrics.total_requests.fetch_add(1, Ordering::SeqCst);
        *self.metrics.last_request_at.lock() = Some(Utc::now());
    }

    /// Mark a started request as finished. Must be called exactly once per
    /// `start_request`.
    pub fn end_request(&self, started_at: Instant, failed: bool) {
        self.metrics.active_requests.fetch_sub(1, Ordering::SeqCst);

        let elapsed = started_at.elapsed();
        self.metrics
            .total_response_nanos
            .fetch_add(elapsed.as_nanos().try_into().unwrap_or(u64::MAX), Ordering::SeqCst);

        let mut recent = self.metrics.recent_latencies.lock();
        if recent.len() >= RECENT_LATENCY_SAMPLES {
            recent.pop_front();
        }
        recent.push_back(elapsed);
        drop(recent);

        if failed {
            self.metrics.failed_requests.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[must_use]
    pub fn active_requests(&self) -> i64 {
        self.metrics.active_requests.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.metrics.total_requests.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn failed_requests(&self) -> u64 {
        self.metrics.failed_requests.load(Ordering::SeqCst)
    }

    /// Average of the last few request latencies, in milliseconds.
    #[must_use]
    pub fn average_recent_response_ms(&self) -> f64 {
        let recent = self.metrics.recent_latencies.lock();
        if recent.is_empty() {
            return 0.0;
        }
        let total: Duration = recent.iter().sum();
        total.as_secs_f64() * 1000.0 / recent.len() as f64
    }

    fn score(&self) -> u64 {
        let active = self.active_requests().max(0) as u64;
        active * ACTIVE_REQUEST_WEIGHT + self.total_requests()
    }

    #[must_use]
    pub fn snapshot(&self) -> WorkerSnapshot {
        let total = self.total_requests();
        let failed = self.failed_requests();
        let success_rate = if total > 0 {
            (total - failed) as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        WorkerSnapshot {
            id: self.id,
            username: self.account.username.clone(),
            active_requests: self.active_requests(),
            total_requests: total,
            failed_requests: failed,
            success_rate,
            average_response_ms: self.average_recent_response_ms(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            last_request_at: *self.metrics.last_request_at.lock(),
        }
    }
}

impl std::fmt::Display for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{Worker ({}|@{})}}", self.id, self.account.username)
    }
}

/// Registry of workers. The mutex guards membership and selection scans;
/// per-worker counters are read atomically without it.
#[derive(Default)]
pub struct WorkerPool {
    workers: Mutex<Vec<Arc<Worker>>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, worker: Arc<Worker>) {
        info!(worker = %worker, "worker added to pool");
        self.workers.lock().push(worker);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.lock().is_empty()
    }

    /// Pick the lowest-score worker.
    #[must_use]
    pub fn get_next(&self) -> Option<Arc<Worker>> {
        self.select(|_| true)
    }

    /// Pick the lowest-score worker whose id is not excluded.
    #[must_use]
    pub fn get_next_excluding(&self, exclude: &[usize]) -> Option<Arc<Worker>> {
        self.select(|worker| !exclude.contains(&worker.id))
    }

    fn select(&self, keep: impl Fn(&Worker) -> bool) -> Option<Arc<Worker>> {
        let workers = self.workers.lock();
        let selected = workers
            .iter()
            .filter(|w| keep(w))
            .min_by_key(|w| w.score())
            .cloned();
        drop(workers);

        if let Some(worker) = &selected {
            debug!(
                worker_id = worker.id,
                active = worker.active_requests(),
                total = worker.total_requests(),
                "worker selected"
            );
        }
        selected
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.workers.lock().iter().map(|w| w.snapshot()).collect()
    }
}

/// Startup policy for the worker fleet.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub start_timeout: Duration,
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(120),
            max_concurrent: 3,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Start one worker per token with bounded parallelism and retry passes.
///
/// `connect` turns `(worker_id, token)` into an authenticated session.
/// Tokens that still fail after all passes are logged and skipped; the pool
/// continues with the workers that came up. Returns the number started.
pub async fn start_workers<F, Fut>(
    pool: &Arc<WorkerPool>,
    tokens: &[String],
    opts: &StartOptions,
    connect: F,
) -> usize
where
    F: Fn(usize, String) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<Arc<UpstreamSession>>> + Send + 'static,
{
    if tokens.is_empty() {
        info!("no worker bot tokens provided, skipping worker startup");
        return 0;
    }

    let first_id = pool.len() + 1;
    let semaphore = Arc::new(Semaphore::new(opts.max_concurrent));
    let mut pending: Vec<usize> = (0..tokens.len()).collect();
    let mut started = 0usize;

    for attempt in 0..=opts.max_retries {
        if pending.is_empty() {
            break;
        }
        if attempt > 0 {
            info!(
                failed = pending.len(),
                attempt,
                max_retries = opts.max_retries,
                "retrying failed workers after delay"
            );
            tokio::time::sleep(opts.retry_delay).await;
        }

        let mut handles = Vec::with_capacity(pending.len());
        for index in pending.drain(..) {
            let semaphore = semaphore.clone();
            let connect = connect.clone();
            let token = tokens[index].clone();
            let worker_id = first_id + index;
            let timeout = opts.start_timeout;

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                let result = tokio::time::timeout(timeout, connect(worker_id, token)).await;
                let session = match result {
                    Ok(Ok(session)) => session,
                    Ok(Err(e)) => return (index, Err(e)),
                    Err(_) => {
                        return (index, Err(anyhow::anyhow!("timed out after {timeout:?}")))
                    }
                };
                (index, Ok(Arc::new(Worker::new(worker_id, session))))
            }));
        }

        for handle in handles {
            let Ok((index, result)) = handle.await else {
                error!("worker startup task panicked");
                continue;
            };
            match result {
                Ok(worker) => {
                    pool.add(worker);
                    started += 1;
                }
                Err(e) => {
                    error!(index, attempt = attempt + 1, error = %e, "failed to start worker");
                    pending.push(index);
                }
            }
        }
    }

    if !pending.is_empty() {
        warn!(
            failed = pending.len(),
            retries = opts.max_retries,
            indices = ?pending,
            "workers failed to start after all retries"
        );
    }
    info!(started, total = tokens.len(), "worker startup finished");
    started
}
