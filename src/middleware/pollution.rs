//! HTTP parameter pollution guard: a parameter repeated in the query string
//! or in a URL-encoded body keeps only its last value.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use super::sanitize::replace_query;
use super::{buffer_body, content_type_is, rebuild};

/// Collapse repeated keys to their last value, keeping first-seen order.
/// `None` when no key repeats or the input does not parse.
pub fn collapse_repeated(encoded: &str) -> Option<String> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(encoded).ok()?;
    let mut collapsed: Vec<(String, String)> = Vec::with_capacity(pairs.len());
    let mut repeated = false;
    for (key, value) in pairs {
        match collapsed.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => {
                slot.1 = value;
                repeated = true;
            }
            None => collapsed.push((key, value)),
        }
    }
    if !repeated {
        return None;
    }
    serde_urlencoded::to_string(&collapsed).ok()
}

pub async fn hpp(State(body_limit): State<usize>, mut req: Request, next: Next) -> Response {
    if let Some(query) = req.uri().query() {
        if let Some(clean) = collapse_repeated(query) {
            if let Some(uri) = replace_query(req.uri(), &clean) {
                debug!(path = %req.uri().path(), "collapsed repeated query parameters");
                *req.uri_mut() = uri;
            }
        }
    }

    if !content_type_is(&req, "application/x-www-form-urlencoded") {
        return next.run(req).await;
    }

    let (parts, bytes) = match buffer_body(req, body_limit).await {
        Ok(buffered) => buffered,
        Err(rejection) => return rejection,
    };
    let body = match std::str::from_utf8(&bytes).ok().and_then(collapse_repeated) {
        Some(clean) => {
            debug!(path = %parts.uri.path(), "collapsed repeated body parameters");
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
    use tower::ServiceExt;

    #[test]
    fn last_value_wins() {
        assert_eq!(
            collapse_repeated("sort=name&page=1&sort=date").as_deref(),
            Some("sort=date&page=1")
        );
    }

    #[test]
    fn distinct_keys_are_left_alone() {
        assert_eq!(collapse_repeated("a=1&b=2"), None);
        assert_eq!(collapse_repeated(""), None);
    }

    async fn echo(req: Request) -> String {
        let query = req.uri().query().unwrap_or_default().to_string();
        let body = req.into_body().collect().await.unwrap().to_bytes();
        format!("{query}|{}", String::from_utf8_lossy(&body))
    }

    #[tokio::test]
    async fn query_and_form_body_are_collapsed() {
        let app = Router::new()
            .route("/echo", post(echo))
            .layer(axum::middleware::from_fn_with_state(1024_usize, hpp));

        let res = app
            .oneshot(
                axum::http::Request::post("/echo?tag=a&tag=b")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("role=student&role=admin&name=Ada"))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"tag=b|role=admin&name=Ada");
    }
}
