//! Strips MongoDB operator keys (`$gt`, `$where`, ...) from user input.
//!
//! Covers the query string, JSON bodies and URL-encoded bodies. Keys are
//! checked at every nesting level; for bracketed form keys such as
//! `user[$ne]` each segment is checked.

use axum::{
    extract::{Request, State},
    http::Uri,
    middleware::Next,
    response::Response,
};
use serde_json::Value;
use tracing::{debug, warn};

use super::{buffer_body, content_type_is, rebuild};

#[derive(Debug, Clone, Copy)]
pub struct SanitizeConfig {
    pub body_limit: usize,
    /// Keep keys containing `.`; only `$`-prefixed keys are removed.
    pub allow_dots: bool,
}

impl SanitizeConfig {
    fn forbidden(&self, key: &str) -> bool {
        key.starts_with('$') || (!self.allow_dots && key.contains('.'))
    }

    /// Form keys may encode nesting as `a[b][c]`.
    fn forbidden_form_key(&self, key: &str) -> bool {
        key.split(['[', ']'])
            .filter(|segment| !segment.is_empty())
            .any(|segment| self.forbidden(segment))
    }
}

/// Remove forbidden keys in place; returns whether anything was removed.
pub fn strip_json(value: &mut Value, config: &SanitizeConfig) -> bool {
    match value {
        Value::Object(map) => {
            let before = map.len();
            map.retain(|key, _| !config.forbidden(key));
            let mut removed = map.len() != before;
            for child in map.values_mut() {
                removed |= strip_json(child, config);
            }
            removed
        }
        Value::Array(items) => {
            let mut removed = false;
            for item in items.iter_mut() {
                removed |= strip_json(item, config);
            }
            removed
        }
        _ => false,
    }
}

/// Filter `k=v&...` pairs; `None` when nothing changed or the input does not
/// parse.
pub fn strip_form(encoded: &str, config: &SanitizeConfig) -> Option<String> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(encoded).ok()?;
    let before = pairs.len();
    let kept: Vec<(String, String)> = pairs
        .into_iter()
        .filter(|(key, _)| !config.forbidden_form_key(key))
        .collect();
    if kept.len() == before {
        return None;
    }
    serde_urlencoded::to_string(&kept).ok()
}

pub(crate) fn replace_query(uri: &Uri, query: &str) -> Option<Uri> {
    let path = uri.path();
    let path_and_query = if query.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{query}")
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query.parse().ok()?);
    Uri::from_parts(parts).ok()
}

pub async fn sanitize(
    State(config): State<SanitizeConfig>,
    mut req: Request,
    next: Next,
) -> Response {
    if let Some(query) = req.uri().query() {
        if let Some(clean) = strip_form(query, &config) {
            if let Some(uri) = replace_query(req.uri(), &clean) {
                warn!(path = %req.uri().path(), "removed operator keys from query string");
                *req.uri_mut() = uri;
            }
        }
    }

    let is_json = content_type_is(&req, "application/json");
    let is_form = content_type_is(&req, "application/x-www-form-urlencoded");
    if !is_json && !is_form {
        return next.run(req).await;
    }

    let (parts, bytes) = match buffer_body(req, config.body_limit).await {
        Ok(buffered) => buffered,
        Err(rejection) => return rejection,
    };

    let cleaned = if is_json {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(mut value) => {
                if strip_json(&mut value, &config) {
                    serde_json::to_vec(&value).ok()
                } else {
                    None
                }
            }
            Err(e) => {
                // Malformed JSON is left for the handler's extractor to reject.
                debug!(error = %e, "body is not valid JSON; not sanitized");
                None
            }
        }
    } else {
        std::str::from_utf8(&bytes)
            .ok()
            .and_then(|text| strip_form(text, &config))
            .map(String::into_bytes)
    };

    let body = match cleaned {
        Some(clean) => {
            warn!(path = %parts.uri.path(), "removed operator keys from request body");
            bytes::Bytes::from(clean)
        }
        None => bytes,
    };
    next.run(rebuild(parts, body)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, routing::post, Router};
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    const DOTS_ALLOWED: SanitizeConfig = SanitizeConfig {
        body_limit: 10 * 1024,
        allow_dots: true,
    };
    const STRICT: SanitizeConfig = SanitizeConfig {
        body_limit: 10 * 1024,
        allow_dots: false,
    };

    #[test]
    fn operator_keys_are_removed_at_any_depth() {
        let mut value = json!({
            "email": {"$gt": ""},
            "$where": "sleep(1000)",
            "profile": {"bio": "hi", "tags": [{"$ne": 1, "ok": true}]},
            "a.b": 1
        });
        assert!(strip_json(&mut value, &DOTS_ALLOWED));
        assert_eq!(
            value,
            json!({
                "email": {},
                "profile": {"bio": "hi", "tags": [{"ok": true}]},
                "a.b": 1
            })
        );
    }

    #[test]
    fn dotted_keys_go_only_when_dots_are_disallowed() {
        let mut value = json!({"a.b": 1, "c": 2});
        assert!(!strip_json(&mut value.clone(), &DOTS_ALLOWED));
        assert!(strip_json(&mut value, &STRICT));
        assert_eq!(value, json!({"c": 2}));
    }

    #[test]
    fn clean_input_is_reported_unchanged() {
        let mut value = json!({"name": "Ada", "list": [1, 2, {"x": "$not-a-key"}]});
        assert!(!strip_json(&mut value, &DOTS_ALLOWED));
        assert_eq!(strip_form("name=Ada&age=36", &DOTS_ALLOWED), None);
    }

    #[test]
    fn bracketed_form_keys_are_checked_per_segment() {
        let cleaned = strip_form("email%5B%24gt%5D=&name=Ada&%24where=1", &DOTS_ALLOWED);
        assert_eq!(cleaned.as_deref(), Some("name=Ada"));
    }

    #[test]
    fn query_is_rewritten_in_place() {
        let uri: Uri = "http://localhost/api/v1/users?name=Ada".parse().unwrap();
        let replaced = replace_query(&uri, "name=Grace").unwrap();
        assert_eq!(replaced.to_string(), "http://localhost/api/v1/users?name=Grace");

        let uri: Uri = "/search?%24where=1".parse().unwrap();
        assert_eq!(replace_query(&uri, "").unwrap().to_string(), "/search");
    }

    async fn echo(req: Request) -> String {
        let query = req.uri().query().unwrap_or_default().to_string();
        let body = req.into_body().collect().await.unwrap().to_bytes();
        format!("{query}|{}", String::from_utf8_lossy(&body))
    }

    async fn send(uri: &str, content_type: &str, body: &'static str) -> String {
        let app = Router::new()
            .route("/echo", post(echo))
            .layer(axum::middleware::from_fn_with_state(DOTS_ALLOWED, sanitize));
        let res = app
            .oneshot(
                axum::http::Request::post(uri)
                    .header("content-type", content_type)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn json_body_is_rewritten_before_the_handler() {
        let echoed = send(
            "/echo?%24where=1&page=2",
            "application/json",
            r#"{"email":{"$gt":""},"name":"Ada"}"#,
        )
        .await;
        let (query, body) = echoed.split_once('|').unwrap();
        assert_eq!(query, "page=2");
        let body: Value = serde_json::from_str(body).unwrap();
        assert_eq!(body, json!({"email": {}, "name": "Ada"}));
    }

    #[tokio::test]
    async fn clean_and_malformed_bodies_pass_through_untouched() {
        let echoed = send("/echo", "application/json", r#"{"name":"Ada"}"#).await;
        assert_eq!(echoed, r#"|{"name":"Ada"}"#);

        let echoed = send("/echo", "application/json", "{not json").await;
        assert_eq!(echoed, "|{not json");
    }
}
