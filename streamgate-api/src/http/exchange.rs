//! Identity token exchange
//!
//! `POST|GET /auth/firebase/exchange` converts a verified federated ID
//! token into a short-lived stream session token, returned in the JSON body
//! and set as an HttpOnly cookie.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use tracing::{error, warn};

use super::error::{AppError, AppResult};
use super::middleware::extract_bearer_token;
use super::AppState;

#[derive(Debug, Serialize)]
struct ExchangeResponse {
    stream_token: String,
    token_type: &'static str,
    expires_at: i64,
    user_id: String,
    email: String,
}

pub async fn exchange(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match handle_exchange(&state, &headers).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_exchange(state: &AppState, headers: &HeaderMap) -> AppResult<Response> {
    let (Some(verifier), Some(sessions)) = (&state.verifier, &state.sessions) else {
        return Err(AppError::not_found("stream auth disabled"));
    };

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer_token)
        .ok_or_else(|| AppError::unauthorized("missing identity bearer token"))?;

    let claims = verifier.verify(bearer).await.map_err(|e| {
        warn!(error = %e, "identity token verification failed");
        AppError::unauthorized("invalid identity token")
    })?;

    let (token, expires_at) = sessions.create(&claims.subject, &claims.email).await.map_err(|e| {
        error!(error = %e, "failed to create stream session");
        AppError::internal("failed to create stream session")
    })?;

    let max_age = (expires_at - Utc::now()).num_seconds().max(0);
    let cookie = session_cookie(
        &state.config.stream_session_cookie_name,
        &token,
        max_age,
        state.config.stream_session_cookie_secure,
        &state.config.stream_session_cookie_domain,
    );

    let body = Json(ExchangeResponse {
        stream_token: token,
        token_type: "Bearer",
        expires_at: expires_at.timestamp(),
        user_id: claims.subject,
        email: claims.email,
    });

    Ok((
        StatusCode::OK,
        [
            (header::SET_COOKIE, cookie),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
        body,
    )
        .into_response())
}

fn session_cookie(name: &str, token: &str, max_age: i64, secure: bool, domain: &str) -> String {
    let mut cookie = format!("{name}={token}; Path=/; Max-Age={max_age}; HttpOnly; SameSite=Lax");
    if secure {
        cookie.push_str("; Secure");
    }
    if !domain.is_empty() {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    cookie
}
