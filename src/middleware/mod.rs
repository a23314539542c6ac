//! Request/response middleware applied by [`crate::app::with_middleware`].

pub mod cookies;
pub mod cors;
pub mod pollution;
pub mod rate_limit;
pub mod sanitize;
pub mod security;

pub use cookies::{parse_cookies, Cookies};
pub use cors::cors_layer;
pub use pollution::hpp;
pub use rate_limit::{rate_limit, RateLimiter};
pub use sanitize::{sanitize, SanitizeConfig};
pub use security::security_headers;

use axum::{
    body::Body,
    extract::Request,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Buffer a request body up to `limit` bytes, answering 413 past it.
pub(crate) async fn buffer_body(
    req: Request,
    limit: usize,
) -> Result<(axum::http::request::Parts, bytes::Bytes), Response> {
    let (parts, body) = req.into_parts();
    match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => Ok((parts, bytes)),
        Err(_) => Err((StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large").into_response()),
    }
}

/// Rebuild a request around a (possibly rewritten) body, keeping
/// `Content-Length` honest.
pub(crate) fn rebuild(mut parts: axum::http::request::Parts, bytes: bytes::Bytes) -> Request {
    parts.headers.insert(
        axum::http::header::CONTENT_LENGTH,
        axum::http::HeaderValue::from(bytes.len()),
    );
    Request::from_parts(parts, Body::from(bytes))
}

pub(crate) fn content_type_is(req: &Request, essence: &str) -> bool {
    req.headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(essence))
}
