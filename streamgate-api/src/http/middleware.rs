// Stream token extraction

use axum::http::{header, HeaderMap};

/// Pull the stream session token out of a request, in precedence order:
/// `st` query parameter, `x-stream-token` header, `Authorization: Bearer`,
/// then the session cookie.
pub fn extract_stream_token(
    st_param: Option<&str>,
    headers: &HeaderMap,
    cookie_name: &str,
) -> Option<String> {
    if let Some(token) = st_param.filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }

    if let Some(token) = headers
        .get("x-stream-token")
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }

    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer_token)
    {
        return Some(token.to_string());
    }

    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| cookie_value(cookies, cookie_name))
        .map(str::to_string)
}

/// Extract the token from an `Authorization: Bearer <t>` value.
pub fn extract_bearer_token(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.len() < 8 {
        return None;
    }
    let (scheme, token) = value.split_at(7);
    if !scheme.eq_ignore_ascii_case("bearer ") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn cookie_value<'a>(cookies: &'a str, name: &str) -> Option<&'a str> {
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name && !value.is_empty()).then_some(value)
    })
}
