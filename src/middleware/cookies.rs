//! Parses the `Cookie` header once per request and exposes the pairs as a
//! [`Cookies`] extension / extractor.

use std::collections::HashMap;
use std::convert::Infallible;

use axum::{
    async_trait,
    extract::{FromRequestParts, Request},
    http::{header::COOKIE, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookies(HashMap<String, String>);

impl Cookies {
    /// Parse every `Cookie` header. Later duplicates do not override the
    /// first occurrence of a name. Values keep their raw encoding.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut map = HashMap::new();
        for header in headers.get_all(COOKIE) {
            let Ok(raw) = header.to_str() else {
                continue;
            };
            for pair in raw.split(';') {
                let Some((name, value)) = pair.split_once('=') else {
                    continue;
                };
                let name = name.trim();
                if name.is_empty() {
                    continue;
                }
                let value = value.trim().trim_matches('"');
                map.entry(name.to_string())
                    .or_insert_with(|| value.to_string());
            }
        }
        Self(map)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub async fn parse_cookies(mut req: Request, next: Next) -> Response {
    let cookies = Cookies::from_headers(req.headers());
    req.extensions_mut().insert(cookies);
    next.run(req).await
}

#[async_trait]
impl<S> FromRequestParts<S> for Cookies
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(match parts.extensions.get::<Cookies>() {
            Some(cookies) => cookies.clone(),
            None => Cookies::from_headers(&parts.headers),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, routing::get, Router};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn headers(values: &[&'static str]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for v in values {
            map.append(COOKIE, axum::http::HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn pairs_are_split_and_trimmed() {
        let cookies = Cookies::from_headers(&headers(&["session=abc; theme=\"dark\" ;broken; =x"]));
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies.get("session"), Some("abc"));
        assert_eq!(cookies.get("theme"), Some("dark"));
        assert_eq!(cookies.get("broken"), None);
    }

    #[test]
    fn first_occurrence_wins_across_headers() {
        let cookies = Cookies::from_headers(&headers(&["a=1", "a=2; b=%20"]));
        assert_eq!(cookies.get("a"), Some("1"));
        assert_eq!(cookies.get("b"), Some("%20"));
    }

    #[test]
    fn missing_header_yields_empty_jar() {
        assert!(Cookies::from_headers(&HeaderMap::new()).is_empty());
    }

    #[tokio::test]
    async fn handlers_can_extract_parsed_cookies() {
        async fn who(cookies: Cookies) -> String {
            cookies.get("user").unwrap_or("anonymous").to_string()
        }
        let app = Router::new()
            .route("/", get(who))
            .layer(axum::middleware::from_fn(parse_cookies));

        let res = app
            .oneshot(
                axum::http::Request::get("/")
                    .header(COOKIE, "user=ada")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ada");
    }
}
