use axum::http::{header, HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

const ALLOWED_HEADERS: [HeaderName; 10] = [
    header::CONTENT_TYPE,
    header::AUTHORIZATION,
    header::ACCESS_CONTROL_ALLOW_HEADERS,
    header::ACCESS_CONTROL_ALLOW_ORIGIN,
    header::ACCESS_CONTROL_ALLOW_METHODS,
    HeaderName::from_static("x-requested-with"),
    header::ACCEPT,
    header::ORIGIN,
    HeaderName::from_static("x-http-method-override"),
    HeaderName::from_static("device-remember-token"),
];

/// Credentialed CORS for the single front-end origin. Without a usable
/// origin no cross-origin request is allowed.
pub fn cors_layer(client_url: Option<&str>) -> CorsLayer {
    let origin = match client_url.map(HeaderValue::from_str) {
        Some(Ok(origin)) => AllowOrigin::exact(origin),
        Some(Err(e)) => {
            warn!(error = %e, "CLIENT_URL is not a valid origin; cross-origin requests disabled");
            AllowOrigin::list(Vec::<HeaderValue>::new())
        }
        None => AllowOrigin::list(Vec::<HeaderValue>::new()),
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(ALLOWED_HEADERS)
}
