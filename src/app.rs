use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue},
    middleware::{from_fn, from_fn_with_state},
    Router,
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};

use crate::config::ServerConfig;
use crate::error::{error_handler, install_panic_hook, panic_response};
use crate::middleware::{
    cors_layer, hpp, parse_cookies, rate_limit, sanitize, security_headers, RateLimiter,
    SanitizeConfig,
};
use crate::routes;
use crate::state::AppState;

pub fn build_app(state: AppState) -> Router {
    let server = state.config.server.clone();
    let router = Router::new()
        .merge(routes::router())
        .fallback(routes::not_found)
        .with_state(state);
    with_middleware(router, &server)
}

/// Wrap `router` in the request pipeline. Layers are added innermost first,
/// so a request meets them bottom-up.
pub fn with_middleware(router: Router, config: &ServerConfig) -> Router {
    let limit = config.body_limit;
    install_panic_hook();

    let router = router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(from_fn_with_state(config.environment, error_handler))
        .layer(cors_layer(config.client_url.as_deref()))
        .layer(from_fn(parse_cookies))
        .layer(DefaultBodyLimit::max(limit))
        .layer(RequestBodyLimitLayer::new(limit));

    let router = if config.environment.is_development() {
        router
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(|req: &axum::http::Request<_>| {
                        let method = req.method().clone();
                        let uri = req.uri().clone();
                        let request_id = req
                            .headers()
                            .get("x-request-id")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("-")
                            .to_string();
                        tracing::info_span!(
                            "http_request",
                            %method,
                            uri = %uri,
                            %request_id,
                            status = tracing::field::Empty
                        )
                    })
                    .on_response(
                        |res: &axum::http::Response<_>,
                         latency: std::time::Duration,
                         span: &tracing::Span| {
                            let status = res.status();
                            span.record("status", tracing::field::display(status));
                            if status.is_server_error() {
                                tracing::error!(%status, ?latency, "response");
                            } else {
                                tracing::info!(%status, ?latency, "response");
                            }
                        },
                    ),
            )
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    } else {
        router
    };

    router
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-xss-protection"),
            HeaderValue::from_static("1; mode=block"),
        ))
        .layer(from_fn_with_state(limit, hpp))
        .layer(from_fn_with_state(
            SanitizeConfig {
                body_limit: limit,
                allow_dots: true,
            },
            sanitize,
        ))
        .layer(from_fn_with_state(
            RateLimiter::new("/api", &config.rate_limit),
            rate_limit,
        ))
        .layer(from_fn(security_headers))
}
