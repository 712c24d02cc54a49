//! Router-level tests for the direct stream pipeline against a seeded
//! in-memory upstream.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use http_body_util::BodyExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use streamgate_api::http::{create_router, create_status_router, AppState};
use streamgate_core::cache::MediaCache;
use streamgate_core::pool::{Worker, WorkerPool};
use streamgate_core::service::signing::generate_signed_url;
use streamgate_core::upstream::testing::{pattern_bytes, FakeUpstream};
use streamgate_core::upstream::{SessionOptions, UpstreamSession, UpstreamTransport};
use streamgate_core::Config;

const CHANNEL: i64 = 900;
const MIB: usize = 1024 * 1024;

struct Fixture {
    state: AppState,
    router: Router,
    pool: Arc<WorkerPool>,
}

fn fixture_with_config(fakes: Vec<Arc<FakeUpstream>>, mut config: Config) -> Fixture {
    config.media_channel_id = CHANNEL;

    let pool = Arc::new(WorkerPool::new());
    for (index, fake) in fakes.iter().enumerate() {
        let session = Arc::new(UpstreamSession::new(
            fake.clone() as Arc<dyn UpstreamTransport>,
            SessionOptions::default(),
        ));
        pool.add(Arc::new(Worker::new(index + 1, session)));
    }

    let cache = Arc::new(MediaCache::default());
    let state = AppState::new(Arc::new(config), pool.clone(), cache).unwrap();
    let router = create_router(state.clone());
    Fixture {
        state,
        router,
        pool,
    }
}

fn fixture(fakes: Vec<Arc<FakeUpstream>>) -> Fixture {
    fixture_with_config(fakes, Config::default())
}

fn seeded_fake(id: i64, len: usize) -> Arc<FakeUpstream> {
    let fake = Arc::new(FakeUpstream::new(id, &format!("bot_{id}")));
    fake.seed_file(CHANNEL, 42, len, "clip.mp4", "video/mp4");
    fake
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within timeout");
}

#[tokio::test]
async fn test_happy_path_range() {
    let fake = seeded_fake(1, 5_000_000);
    let fx = fixture(vec![fake]);
    let worker = fx.pool.get_next().unwrap();

    let request = Request::builder()
        .uri("/direct/42")
        .header(header::RANGE, "bytes=1048576-2097151")
        .body(Body::empty())
        .unwrap();
    let response = fx.router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let headers = response.headers().clone();
    assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
    assert_eq!(headers[header::CONTENT_RANGE], "bytes 1048576-2097151/5000000");
    assert_eq!(headers[header::CONTENT_LENGTH], "1048576");
    assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.len(), MIB);
    assert_eq!(body, pattern_bytes(5_000_000).slice(MIB..2 * MIB));

    wait_for(|| worker.active_requests() == 0).await;
    assert_eq!(worker.total_requests(), 1);
    assert_eq!(worker.failed_requests(), 0);

    let logs = fx.state.request_logs.recent();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status_code, 206);
    assert_eq!(logs[0].bytes_sent, MIB as i64);
}

#[tokio::test]
async fn test_no_range_returns_full_body() {
    let len = 100_000;
    let fake = seeded_fake(1, len);
    let fx = fixture(vec![fake]);

    let response = fx.router.oneshot(get("/direct/42")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_LENGTH],
        len.to_string().as_str()
    );

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, pattern_bytes(len));
}

#[tokio::test]
async fn test_single_byte_file_range() {
    let fake = Arc::new(FakeUpstream::new(1, "bot_1"));
    fake.seed_file(CHANNEL, 42, 1, "one.bin", "application/octet-stream");
    let fx = fixture(vec![fake]);

    let request = Request::builder()
        .uri("/direct/42")
        .header(header::RANGE, "bytes=0-0")
        .body(Body::empty())
        .unwrap();
    let response = fx.router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "1");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.len(), 1);
}

#[tokio::test]
async fn test_full_range_request() {
    let len = 50_000;
    let fake = seeded_fake(1, len);
    let fx = fixture(vec![fake]);

    let request = Request::builder()
        .uri("/direct/42")
        .header(header::RANGE, format!("bytes=0-{}", len - 1))
        .body(Body::empty())
        .unwrap();
    let response = fx.router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()[header::CONTENT_LENGTH],
        len.to_string().as_str()
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, pattern_bytes(len));
}

#[tokio::test]
async fn test_head_reads_no_bytes() {
    let fake = seeded_fake(1, 5_000_000);
    let fx = fixture(vec![fake.clone()]);

    let request = Request::builder()
        .method(Method::HEAD)
        .uri("/direct/42")
        .header(header::RANGE, "bytes=0-1048575")
        .body(Body::empty())
        .unwrap();
    let response = fx.router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "1048576");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(body.is_empty());
    // Metadata only: not a single content byte was read upstream.
    assert_eq!(fake.read_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_bad_message_ids_rejected_before_upstream() {
    let fake = seeded_fake(1, 100);
    let fx = fixture(vec![fake.clone()]);

    for uri in ["/direct/0", "/direct/-5", "/direct/abc"] {
        let response = fx.router.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
    }
    assert_eq!(fake.message_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_bad_range_rejected() {
    let fake = seeded_fake(1, 1000);
    let fx = fixture(vec![fake]);
    let worker = fx.pool.get_next().unwrap();

    let request = Request::builder()
        .uri("/direct/42")
        .header(header::RANGE, "bytes=900-100")
        .body(Body::empty())
        .unwrap();
    let response = fx.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The 400 is a failed request from the winner's perspective.
    wait_for(|| worker.active_requests() == 0).await;
    assert_eq!(worker.failed_requests(), 1);
}

#[tokio::test]
async fn test_unknown_message_returns_404() {
    let fake = seeded_fake(1, 100);
    let fx = fixture(vec![fake]);

    let response = fx.router.oneshot(get("/direct/999")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_empty_pool_returns_503() {
    let fx = fixture(vec![]);
    let response = fx.router.oneshot(get("/direct/42")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_reference_expiry_recovers_mid_stream() {
    let len = 2 * MIB + 4321;
    let fake = seeded_fake(1, len);
    let fx = fixture(vec![fake.clone()]);
    let worker = fx.pool.get_next().unwrap();

    // First request caches the descriptor.
    let response = fx.router.clone().oneshot(get("/direct/42")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.len(), len);

    // Reference ages out; the cached descriptor is now stale. The next
    // stream hits the expiry on its first read, refetches and resumes.
    fake.rotate_reference(CHANNEL, 42);
    let response = fx.router.clone().oneshot(get("/direct/42")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, pattern_bytes(len));

    // The recovery succeeded, so nothing is counted as failed.
    wait_for(|| worker.active_requests() == 0).await;
    assert_eq!(worker.failed_requests(), 0);
    assert_eq!(worker.total_requests(), 2);
}

#[tokio::test]
async fn test_worker_race_prefers_faster_worker() {
    let slow = seeded_fake(1, 100_000);
    slow.set_message_latency(Duration::from_millis(200));
    let fast = seeded_fake(2, 100_000);
    fast.set_message_latency(Duration::from_millis(10));

    let fx = fixture(vec![slow, fast]);
    let slow_worker = fx.pool.get_next_excluding(&[2]).unwrap();
    let fast_worker = fx.pool.get_next_excluding(&[1]).unwrap();

    let response = fx.router.oneshot(get("/direct/42")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.len(), 100_000);

    // Only the race winner is accounted; the loser never "started".
    wait_for(|| fast_worker.active_requests() == 0).await;
    assert_eq!(fast_worker.total_requests(), 1);
    assert_eq!(slow_worker.total_requests(), 0);
}

#[tokio::test]
async fn test_fallback_worker_succeeds_after_race_failures() {
    use streamgate_core::upstream::UpstreamError;

    let failing_a = seeded_fake(1, 100_000);
    let failing_b = seeded_fake(2, 100_000);
    let healthy = seeded_fake(3, 100_000);
    // Both racers fail once with a transient error.
    failing_a.inject_message_error(UpstreamError::Transport("connection reset".to_string()));
    failing_b.inject_message_error(UpstreamError::Transport("connection reset".to_string()));

    let fx = fixture(vec![failing_a, failing_b, healthy]);
    let response = fx.router.oneshot(get("/direct/42")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.len(), 100_000);
}

mod auth {
    use super::*;

    fn auth_config() -> Config {
        Config {
            firebase_project_id: "test-project".to_string(),
            // Unroutable on purpose; these tests never verify an ID token.
            firebase_certs_url: "https://certs.invalid/keys".to_string(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_request_without_token_is_unauthorized() {
        let fx = fixture_with_config(vec![seeded_fake(1, 1000)], auth_config());
        let response = fx.router.oneshot(get("/direct/42")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_garbage_token_is_unauthorized() {
        let fx = fixture_with_config(vec![seeded_fake(1, 1000)], auth_config());
        let request = Request::builder()
            .uri("/direct/42")
            .header("x-stream-token", "not-a-real-token")
            .body(Body::empty())
            .unwrap();
        let response = fx.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_valid_token_in_header_streams() {
        let fx = fixture_with_config(vec![seeded_fake(1, 1000)], auth_config());
        let sessions = fx.state.sessions.as_ref().unwrap();
        let (token, _) = sessions.create("user-1", "u@example.test").await.unwrap();

        let request = Request::builder()
            .uri("/direct/42")
            .header("x-stream-token", token)
            .body(Body::empty())
            .unwrap();
        let response = fx.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_valid_token_in_query_and_cookie() {
        let fx = fixture_with_config(vec![seeded_fake(1, 1000)], auth_config());
        let sessions = fx.state.sessions.as_ref().unwrap();
        let (token, _) = sessions.create("user-1", "u@example.test").await.unwrap();

        let response = fx
            .router
            .clone()
            .oneshot(get(&format!("/direct/42?st={token}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let cookie_name = &fx.state.config.stream_session_cookie_name;
        let request = Request::builder()
            .uri("/direct/42")
            .header(header::COOKIE, format!("{cookie_name}={token}"))
            .body(Body::empty())
            .unwrap();
        let response = fx.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_exchange_without_bearer_is_unauthorized() {
        let fx = fixture_with_config(vec![seeded_fake(1, 1000)], auth_config());
        let request = Request::builder()
            .method(Method::POST)
            .uri("/auth/firebase/exchange")
            .body(Body::empty())
            .unwrap();
        let response = fx.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}

mod legacy_hmac {
    use super::*;

    fn hmac_config() -> Config {
        Config {
            stream_secret: "k".to_string(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_valid_signature_accepted() {
        let fake = Arc::new(FakeUpstream::new(1, "bot_1"));
        fake.seed_file(CHANNEL, 7, 1000, "f.bin", "application/octet-stream");
        let fx = fixture_with_config(vec![fake], hmac_config());

        let (sig, exp) = generate_signed_url("k", 7, 60);
        let response = fx
            .router
            .oneshot(get(&format!("/direct/7?sig={sig}&exp={exp}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_tampered_signature_rejected() {
        let fake = Arc::new(FakeUpstream::new(1, "bot_1"));
        fake.seed_file(CHANNEL, 7, 1000, "f.bin", "application/octet-stream");
        let fx = fixture_with_config(vec![fake], hmac_config());

        let (sig, exp) = generate_signed_url("wrong-secret", 7, 60);
        let response = fx
            .router
            .oneshot(get(&format!("/direct/7?sig={sig}&exp={exp}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_expired_signature_rejected() {
        let fake = Arc::new(FakeUpstream::new(1, "bot_1"));
        fake.seed_file(CHANNEL, 7, 1000, "f.bin", "application/octet-stream");
        let fx = fixture_with_config(vec![fake], hmac_config());

        let (sig, exp) = generate_signed_url("k", 7, -60);
        let response = fx
            .router
            .oneshot(get(&format!("/direct/7?sig={sig}&exp={exp}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}

#[tokio::test]
async fn test_download_disposition_via_query() {
    let fake = seeded_fake(1, 1000);
    let fx = fixture(vec![fake]);

    let response = fx
        .router
        .clone()
        .oneshot(get("/direct/42?d=true"))
        .await
        .unwrap();
    let disposition = response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.starts_with("attachment"));

    let response = fx.router.oneshot(get("/direct/42")).await.unwrap();
    let disposition = response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.starts_with("inline"));
}

#[tokio::test]
async fn test_inline_photo_served_whole() {
    let fake = Arc::new(FakeUpstream::new(1, "bot_1"));
    let photo = pattern_bytes(30_000);
    fake.seed_photo(CHANNEL, 55, photo.clone());
    let fx = fixture(vec![fake]);

    let response = fx.router.oneshot(get("/direct/55")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
    let disposition = response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.starts_with("inline"));

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, photo);
}

#[tokio::test]
async fn test_client_disconnect_mid_stream() {
    let len = 8 * MIB;
    let fake = seeded_fake(1, len);
    let fx = fixture(vec![fake]);
    let worker = fx.pool.get_next().unwrap();

    let response = fx.router.oneshot(get("/direct/42")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Read one chunk, then hang up.
    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    assert!(!first.is_empty());
    drop(body);

    // The worker still finishes its accounting and nothing panics.
    wait_for(|| worker.active_requests() == 0).await;
    let logs = fx.state.request_logs.recent();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].bytes_sent < len as i64);
    // A disconnect is not a failed request.
    assert_eq!(worker.failed_requests(), 0);
}

#[tokio::test]
async fn test_status_endpoint_reports_pool() {
    let fake = seeded_fake(1, 1000);
    let fx = fixture(vec![fake]);
    let status_router = create_status_router(fx.state.clone());

    // Serve one request so the counters move.
    let response = fx.router.oneshot(get("/direct/42")).await.unwrap();
    let _ = response.into_body().collect().await.unwrap();

    let response = status_router.oneshot(get("/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["total_workers"], 1);
    assert_eq!(json["workers"][0]["username"], "bot_1");
    assert_eq!(json["workers"][0]["total_requests"], 1);
}

#[tokio::test]
async fn test_root_route_reports_uptime() {
    let fx = fixture(vec![seeded_fake(1, 100)]);
    let response = fx.router.oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["ok"], true);
    assert!(json["uptime"].as_str().unwrap().ends_with('s'));
}
