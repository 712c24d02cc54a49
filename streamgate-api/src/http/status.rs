//! Pool status route
//!
//! `GET /status` on the status port summarizes the worker fleet: per-worker
//! counters, fleet totals, and recent request activity. JSON by default; a
//! minimal HTML table when the caller asks for `text/html` or
//! `?format=html`. The rich operator dashboard is an external artifact and
//! renders from the JSON.

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use streamgate_core::pool::WorkerSnapshot;

use super::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct StatusQuery {
    pub format: Option<String>,
}

#[derive(Debug, Serialize)]
struct WorkerStatus {
    id: usize,
    username: String,
    active_requests: i64,
    total_requests: u64,
    failed_requests: u64,
    success_rate: f64,
    average_response_ms: f64,
    uptime_seconds: u64,
    last_request_ago: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    total_workers: usize,
    total_active_requests: i64,
    total_requests: u64,
    total_failed_requests: u64,
    overall_success_rate: f64,
    workers: Vec<WorkerStatus>,
    timestamp: DateTime<Utc>,
}

pub async fn status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
    headers: HeaderMap,
) -> Response {
    let wants_html = query.format.as_deref() == Some("html")
        || headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/html"));

    let snapshots = state.pool.snapshot();
    if snapshots.is_empty() {
        if wants_html {
            return Html(NO_WORKERS_HTML).into_response();
        }
        return Json(serde_json::json!({
            "message": "No workers available",
            "workers": [],
        }))
        .into_response();
    }

    let response = build_status(snapshots);
    if wants_html {
        Html(render_html(&response)).into_response()
    } else {
        (StatusCode::OK, Json(response)).into_response()
    }
}

fn build_status(snapshots: Vec<WorkerSnapshot>) -> StatusResponse {
    let now = Utc::now();
    let mut total_active = 0i64;
    let mut total_requests = 0u64;
    let mut total_failed = 0u64;

    let workers: Vec<WorkerStatus> = snapshots
        .into_iter()
        .map(|snapshot| {
            total_active += snapshot.active_requests;
            total_requests += snapshot.total_requests;
            total_failed += snapshot.failed_requests;
            WorkerStatus {
                id: snapshot.id,
                username: snapshot.username,
                active_requests: snapshot.active_requests,
                total_requests: snapshot.total_requests,
                failed_requests: snapshot.failed_requests,
                success_rate: snapshot.success_rate,
                average_response_ms: snapshot.average_response_ms,
                uptime_seconds: snapshot.uptime_seconds,
                last_request_ago: last_request_ago(now, snapshot.last_request_at),
            }
        })
        .collect();

    let overall_success_rate = if total_requests > 0 {
        (total_requests - total_failed) as f64 / total_requests as f64 * 100.0
    } else {
        0.0
    };

    StatusResponse {
        total_workers: workers.len(),
        total_active_requests: total_active,
        total_requests,
        total_failed_requests: total_failed,
        overall_success_rate,
        workers,
        timestamp: now,
    }
}

fn last_request_ago(now: DateTime<Utc>, last: Option<DateTime<Utc>>) -> String {
    let Some(last) = last else {
        return "never".to_string();
    };
    let elapsed = (now - last).num_seconds().max(0);
    if elapsed < 60 {
        format!("{elapsed}s")
    } else if elapsed < 3600 {
        format!("{}m", elapsed / 60)
    } else {
        format!("{}h", elapsed / 3600)
    }
}

const NO_WORKERS_HTML: &str = "<!DOCTYPE html>\n<html><head><title>streamgate status</title></head>\
<body><h1>streamgate</h1><p>No workers available</p></body></html>\n";

fn render_html(response: &StatusResponse) -> String {
    let mut html = String::with_capacity(2048);
    html.push_str("<!DOCTYPE html>\n<html><head><title>streamgate status</title></head><body>\n");
    let _ = writeln!(
        html,
        "<h1>streamgate</h1><p>{} workers, {} active, {} total requests, {:.1}% success</p>",
        response.total_workers,
        response.total_active_requests,
        response.total_requests,
        response.overall_success_rate,
    );
    html.push_str(
        "<table border=\"1\"><tr><th>ID</th><th>Worker</th><th>Active</th><th>Total</th>\
         <th>Failed</th><th>Success</th><th>Avg ms</th><th>Uptime</th><th>Last request</th></tr>\n",
    );
    for worker in &response.workers {
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>@{}</td><td>{}</td><td>{}</td><td>{}</td>\
             <td>{:.1}%</td><td>{:.1}</td><td>{}s</td><td>{}</td></tr>",
            worker.id,
            worker.username,
            worker.active_requests,
            worker.total_requests,
            worker.failed_requests,
            worker.success_rate,
            worker.average_response_ms,
            worker.uptime_seconds,
            worker.last_request_ago,
        );
    }
    html.push_str("</table></body></html>\n");
    html
}
