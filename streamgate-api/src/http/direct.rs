//! Direct stream route
//!
//! `GET|HEAD /direct/:message_id` serves a media object from the configured
//! channel with byte-range semantics. The pipeline: authorize, pick two
//! workers and race their descriptor fetches, fall back sequentially over
//! the remaining pool, account the winner, then stream aligned chunks into
//! the response with mid-stream reference-expiry recovery.
//!
//! Upstream calls run on a spawned task decoupled from the request context:
//! a client disconnecting mid-stream must not cancel the chunk read in
//! flight on the shared, rate-limited session. Disconnects are detected
//! when the body channel closes and classified as warnings.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use streamgate_core::models::MediaDescriptor;
use streamgate_core::pool::Worker;
use streamgate_core::service::signing::validate_signed_request;
use streamgate_core::stream::chunked_read;
use streamgate_core::upstream::{UpstreamError, MAX_CHUNK_SIZE};
use streamgate_core::Error;

use super::error::{AppError, AppResult};
use super::middleware::extract_stream_token;
use super::range::parse_range;
use super::request_log::RequestLog;
use super::AppState;

/// Per-attempt budget for a descriptor fetch.
const FETCH_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
/// Sequential fallback attempts after the race fails.
const MAX_FALLBACK_WORKERS: usize = 3;

#[derive(Debug, Default, Deserialize)]
pub struct DirectQuery {
    /// Stream session token.
    pub st: Option<String>,
    /// `d=true` forces a download disposition.
    pub d: Option<String>,
    /// Legacy signature pair.
    pub sig: Option<String>,
    pub exp: Option<String>,
}

pub async fn direct_stream(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Query(params): Query<DirectQuery>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    match handle_direct(state, &message_id, &params, &method, &headers).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_direct(
    state: AppState,
    message_id: &str,
    params: &DirectQuery,
    method: &Method,
    headers: &HeaderMap,
) -> AppResult<Response> {
    if state.media.channel_id() == 0 {
        error!("media_channel_id not configured");
        return Err(AppError::internal("media_channel_id not configured"));
    }

    let message_id: i64 = message_id
        .parse()
        .map_err(|_| AppError::bad_request("invalid message ID"))?;
    if message_id <= 0 {
        return Err(AppError::bad_request("invalid message ID"));
    }

    authorize(&state, message_id, params, headers).await?;

    debug!(message_id, channel_id = state.media.channel_id(), "direct stream request");

    // Choose up to two workers and race them; the rest of the pool backs
    // the sequential fallback.
    let primary = state.pool.get_next().ok_or_else(AppError::no_workers)?;
    let mut seen = vec![primary.id];
    let mut racers = vec![primary];
    if let Some(secondary) = state.pool.get_next_excluding(&seen) {
        seen.push(secondary.id);
        racers.push(secondary);
    }

    let (descriptor, worker) = fetch_descriptor(&state, racers, &mut seen, message_id).await?;

    // The race only fetched metadata; accounting starts here, on the
    // winner alone.
    worker.start_request();
    let started_at = Instant::now();
    let log_entry = RequestLog {
        timestamp: Utc::now(),
        message_id,
        worker_id: worker.id,
        worker_name: worker.account.username.clone(),
        client_ip: client_ip(headers),
        range_start: 0,
        range_end: 0,
        content_length: 0,
        bytes_sent: 0,
        file_size: descriptor.size_bytes,
        status_code: 0,
        duration_ms: 0,
        user_agent: header_str(headers, header::USER_AGENT),
        referer: header_str(headers, header::REFERER),
    };

    debug!(
        worker_id = worker.id,
        active = worker.active_requests(),
        "using worker for request"
    );

    if descriptor.is_inline() {
        serve_inline(&state, &worker, &descriptor, message_id, method, started_at, log_entry).await
    } else {
        serve_ranged(
            state, worker, descriptor, message_id, method, headers, params, started_at, log_entry,
        )
    }
}

/// Check the session token, falling back to the legacy signature when a
/// shared secret is configured. No configured auth means open access.
async fn authorize(
    state: &AppState,
    message_id: i64,
    params: &DirectQuery,
    headers: &HeaderMap,
) -> AppResult<()> {
    let legacy_secret = &state.config.stream_secret;
    if state.sessions.is_none() && legacy_secret.is_empty() {
        return Ok(());
    }

    if let Some(store) = &state.sessions {
        let token = extract_stream_token(
            params.st.as_deref(),
            headers,
            &state.config.stream_session_cookie_name,
        );
        if let Some(token) = token {
            if store.validate(&token).await.is_some() {
                return Ok(());
            }
            debug!(message_id, "stream session token rejected");
        }
    }

    if !legacy_secret.is_empty() {
        let sig = params.sig.as_deref().unwrap_or("");
        let exp = params.exp.as_deref().unwrap_or("");
        match validate_signed_request(legacy_secret, message_id, sig, exp) {
            Ok(()) => return Ok(()),
            Err(e) => warn!(message_id, error = %e, "signature validation failed"),
        }
    }

    Err(AppError::unauthorized("unauthorized: invalid or expired token"))
}

/// Race the given workers' descriptor fetches, then retry sequentially over
/// the remaining pool. Hard failures short-circuit; the winning worker is
/// returned with the descriptor because file references are tied to the
/// account that fetched them.
async fn fetch_descriptor(
    state: &AppState,
    racers: Vec<Arc<Worker>>,
    seen: &mut Vec<usize>,
    message_id: i64,
) -> AppResult<(MediaDescriptor, Arc<Worker>)> {
    let mut last_err: Option<Error> = None;

    let mut tasks = JoinSet::new();
    for worker in racers {
        let media = state.media.clone();
        tasks.spawn(async move {
            let result =
                match tokio::time::timeout(FETCH_ATTEMPT_TIMEOUT, media.descriptor(&worker.session, message_id))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::Upstream(UpstreamError::Timeout)),
                };
            (result, worker)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let Ok((result, worker)) = joined else {
            continue;
        };
        match result {
            Ok(descriptor) => {
                // Losers are cancelled; their buffered results are dropped.
                tasks.abort_all();
                info!(worker_id = worker.id, username = %worker.account.username, "descriptor race winner");
                return Ok((descriptor, worker));
            }
            Err(e) => {
                warn!(worker_id = worker.id, error = %e, "worker failed to fetch descriptor");
                if last_err.is_none() || e.is_hard() {
                    last_err = Some(e);
                }
            }
        }
    }

    for retry in 0..MAX_FALLBACK_WORKERS {
        if last_err.as_ref().is_some_and(Error::is_hard) {
            break;
        }
        let Some(fallback) = state.pool.get_next_excluding(seen) else {
            warn!(message_id, "no fallback workers available");
            break;
        };
        seen.push(fallback.id);
        info!(
            retry = retry + 1,
            fallback_worker_id = fallback.id,
            "retrying descriptor fetch with fallback worker"
        );

        let result = match tokio::time::timeout(
            FETCH_ATTEMPT_TIMEOUT,
            state.media.descriptor(&fallback.session, message_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Upstream(UpstreamError::Timeout)),
        };

        match result {
            Ok(descriptor) => {
                info!(fallback_worker_id = fallback.id, "descriptor fetched with fallback worker");
                return Ok((descriptor, fallback));
            }
            Err(e) => {
                warn!(fallback_worker_id = fallback.id, error = %e, "fallback worker also failed");
                let hard = e.is_hard();
                last_err = Some(e);
                if hard {
                    break;
                }
            }
        }
    }

    error!(message_id, "failed to fetch descriptor after retries");
    Err(last_err
        .map(AppError::from)
        .unwrap_or_else(|| AppError::bad_gateway("failed to fetch file from upstream")))
}

/// Small inline blobs (photos) are served with a single read.
async fn serve_inline(
    state: &AppState,
    worker: &Arc<Worker>,
    descriptor: &MediaDescriptor,
    message_id: i64,
    method: &Method,
    started_at: Instant,
    mut log_entry: RequestLog,
) -> AppResult<Response> {
    let disposition = format!("inline; filename=\"{}\"", descriptor.filename);

    if *method == Method::HEAD {
        // The descriptor is all a HEAD needs; no byte is read upstream.
        log_entry.status_code = StatusCode::OK.as_u16();
        finalize(state, worker, started_at, log_entry);
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, descriptor.mime_type.as_str())
            .header(header::CONTENT_DISPOSITION, disposition)
            .body(Body::empty())
            .map_err(|e| AppError::internal(format!("build response: {e}")));
    }

    match inline_bytes(state, worker, descriptor, message_id).await {
        Ok(data) => {
            log_entry.status_code = StatusCode::OK.as_u16();
            log_entry.bytes_sent = data.len() as i64;
            finalize(state, worker, started_at, log_entry);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, descriptor.mime_type.as_str())
                .header(header::CONTENT_LENGTH, data.len())
                .header(header::CONTENT_DISPOSITION, disposition)
                .body(Body::from(data))
                .map_err(|e| AppError::internal(format!("build response: {e}")))
        }
        Err(err) => {
            log_entry.status_code = err.status.as_u16();
            finalize(state, worker, started_at, log_entry);
            Err(err)
        }
    }
}

async fn inline_bytes(
    state: &AppState,
    worker: &Arc<Worker>,
    descriptor: &MediaDescriptor,
    message_id: i64,
) -> AppResult<Bytes> {
    match worker.session.read_file(&descriptor.locator, 0, MAX_CHUNK_SIZE).await {
        Ok(data) => Ok(data),
        Err(UpstreamError::ReferenceExpired) => {
            warn!(message_id, "reference expired for inline blob, refetching metadata");
            let fresh = state
                .media
                .refetch_descriptor(&worker.session, message_id)
                .await
                .map_err(|e| {
                    error!(message_id, error = %e, "refetch after reference expiry failed");
                    AppError::internal("file reference expired and refetch failed")
                })?;
            worker
                .session
                .read_file(&fresh.locator, 0, MAX_CHUNK_SIZE)
                .await
                .map_err(|e| {
                    error!(message_id, error = %e, "inline read failed after refetch");
                    AppError::internal("failed to get file after refetch")
                })
        }
        Err(e) => {
            error!(message_id, error = %e, "failed to read inline file");
            Err(AppError::internal("failed to get file"))
        }
    }
}

/// Documents stream through the chunked reader with range semantics.
#[allow(clippy::too_many_arguments)]
fn serve_ranged(
    state: AppState,
    worker: Arc<Worker>,
    descriptor: MediaDescriptor,
    message_id: i64,
    method: &Method,
    headers: &HeaderMap,
    params: &DirectQuery,
    started_at: Instant,
    mut log_entry: RequestLog,
) -> AppResult<Response> {
    let size = descriptor.size_bytes;
    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());

    let (status, start, end) = match range_header {
        None => (StatusCode::OK, 0, size - 1),
        Some(value) => match parse_range(value, size) {
            Ok((start, end)) => (StatusCode::PARTIAL_CONTENT, start, end),
            Err(e) => {
                warn!(message_id, error = %e, "failed to parse range header");
                let err = AppError::bad_request("invalid range header");
                log_entry.status_code = err.status.as_u16();
                finalize(&state, &worker, started_at, log_entry);
                return Err(err);
            }
        },
    };

    let content_length = end - start + 1;
    log_entry.range_start = start;
    log_entry.range_end = end;
    log_entry.content_length = content_length;
    log_entry.status_code = status.as_u16();

    let mime_type = if descriptor.mime_type.is_empty() {
        "application/octet-stream"
    } else {
        descriptor.mime_type.as_str()
    };
    let disposition = if params.d.as_deref() == Some("true") {
        "attachment"
    } else {
        "inline"
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, mime_type)
        .header(header::CONTENT_LENGTH, content_length)
        .header(
            header::CONTENT_DISPOSITION,
            format!("{disposition}; filename=\"{}\"", descriptor.filename),
        );
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{size}"),
        );
        debug!(start, end, file_size = size, "content range");
    }

    if *method == Method::HEAD {
        finalize(&state, &worker, started_at, log_entry);
        return builder
            .body(Body::empty())
            .map_err(|e| AppError::internal(format!("build response: {e}")));
    }

    // Small buffer: backpressure from the client throttles upstream reads.
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(2);
    tokio::spawn(copy_range(
        state, worker, descriptor, message_id, start, end, started_at, log_entry, tx,
    ));

    builder
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| AppError::internal(format!("build response: {e}")))
}

enum CopyFailure {
    ClientDisconnected,
    Upstream(Error),
}

/// Background copy task: pulls chunks from the reader and pushes them into
/// the response body channel, recovering once from reference expiry.
/// Always finishes the worker's request accounting.
#[allow(clippy::too_many_arguments)]
async fn copy_range(
    state: AppState,
    worker: Arc<Worker>,
    descriptor: MediaDescriptor,
    message_id: i64,
    start: i64,
    end: i64,
    started_at: Instant,
    mut log_entry: RequestLog,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    let expected = end - start + 1;
    let mut delivered: i64 = 0;

    match pump(&state, &worker, descriptor, message_id, start, end, &tx, &mut delivered).await {
        Ok(()) => {
            debug!(message_id, bytes_streamed = delivered, "direct stream completed");
        }
        Err(CopyFailure::ClientDisconnected) => {
            warn!(
                message_id,
                bytes_written = delivered,
                expected_bytes = expected,
                "client disconnected during stream"
            );
        }
        Err(CopyFailure::Upstream(e)) => {
            error!(
                message_id,
                bytes_written = delivered,
                expected_bytes = expected,
                error = %e,
                "error while copying stream"
            );
            // Headers are already on the wire; surfacing the error to the
            // body stream terminates the connection short.
            let _ = tx
                .send(Err(std::io::Error::other(e.to_string())))
                .await;
        }
    }

    log_entry.bytes_sent = delivered;
    finalize(&state, &worker, started_at, log_entry);
}

async fn pump(
    state: &AppState,
    worker: &Arc<Worker>,
    descriptor: MediaDescriptor,
    message_id: i64,
    start: i64,
    end: i64,
    tx: &mpsc::Sender<Result<Bytes, std::io::Error>>,
    delivered: &mut i64,
) -> Result<(), CopyFailure> {
    // Teardown token for the readers; deliberately not derived from the
    // HTTP request context.
    let cancel = CancellationToken::new();
    let mut reader: Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>> = Box::pin(
        chunked_read(worker.session.clone(), descriptor.locator, start, end, cancel.clone()),
    );
    let mut recovered = false;

    loop {
        match reader.next().await {
            None => return Ok(()),
            Some(Ok(chunk)) => {
                let len = chunk.len() as i64;
                if tx.send(Ok(chunk)).await.is_err() {
                    // Receiver gone: the client hung up. No further
                    // upstream work is started.
                    return Err(CopyFailure::ClientDisconnected);
                }
                *delivered += len;
            }
            Some(Err(UpstreamError::ReferenceExpired)) if !recovered => {
                recovered = true;
                warn!(message_id, "reference expired mid-stream, refetching and resuming");
                let fresh = state
                    .media
                    .refetch_descriptor(&worker.session, message_id)
                    .await
                    .map_err(CopyFailure::Upstream)?;
                reader = Box::pin(chunked_read(
                    worker.session.clone(),
                    fresh.locator,
                    start + *delivered,
                    end,
                    cancel.clone(),
                ));
            }
            Some(Err(e)) => return Err(CopyFailure::Upstream(e.into())),
        }
    }
}

/// Complete the worker accounting and append the request log entry.
fn finalize(state: &AppState, worker: &Arc<Worker>, started_at: Instant, mut entry: RequestLog) {
    entry.duration_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
    let failed = entry.status_code >= 400;
    state.request_logs.add(entry);
    worker.end_request(started_at, failed);
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .unwrap_or("unknown")
        .to_string()
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
