//! Fixed-window request limiter, counted per client IP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::warn;

use crate::config::RateLimitConfig;

pub const LIMITED_MESSAGE: &str = "Too many requests, please try again later.";

/// Prune expired windows once the table grows past this many clients.
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32, reset_after: Duration },
    Limited { reset_after: Duration },
}

#[derive(Debug)]
struct Window {
    started: Instant,
    hits: u32,
}

#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<DashMap<String, Window>>,
    prefix: &'static str,
    window: Duration,
    max_requests: u32,
}

impl RateLimiter {
    pub fn new(prefix: &'static str, config: &RateLimitConfig) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            prefix,
            window: config.window,
            max_requests: config.max_requests,
        }
    }

    /// Whether `path` sits under the limited prefix.
    pub fn applies_to(&self, path: &str) -> bool {
        match path.strip_prefix(self.prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Count a hit for `client` and decide whether it may proceed.
    pub fn check(&self, client: &str) -> Decision {
        let now = Instant::now();
        if self.windows.len() > PRUNE_THRESHOLD {
            self.prune(now);
        }

        let mut entry = self
            .windows
            .entry(client.to_string())
            .or_insert_with(|| Window { started: now, hits: 0 });
        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.hits = 0;
        }
        let reset_after = self.window.saturating_sub(now.duration_since(entry.started));

        if entry.hits >= self.max_requests {
            return Decision::Limited { reset_after };
        }
        entry.hits += 1;
        Decision::Allowed {
            remaining: self.max_requests - entry.hits,
            reset_after,
        }
    }

    fn prune(&self, now: Instant) {
        let window = self.window;
        self.windows
            .retain(|_, w| now.duration_since(w.started) < window);
    }

    fn policy_name(&self) -> String {
        format!("{}-in-{}min", self.max_requests, self.window.as_secs() / 60)
    }

    fn headers(&self, remaining: u32, reset_after: Duration) -> [(HeaderName, HeaderValue); 2] {
        let policy = self.policy_name();
        let policy_header = format!(
            "\"{policy}\"; q={}; w={}",
            self.max_requests,
            self.window.as_secs()
        );
        let state_header = format!(
            "\"{policy}\"; r={remaining}; t={}",
            reset_after.as_secs_f64().ceil() as u64
        );
        [
            (
                HeaderName::from_static("ratelimit-policy"),
                HeaderValue::from_str(&policy_header).unwrap_or(HeaderValue::from_static("")),
            ),
            (
                HeaderName::from_static("ratelimit"),
                HeaderValue::from_str(&state_header).unwrap_or(HeaderValue::from_static("")),
            ),
        ]
    }
}

fn client_key(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit(State(limiter): State<RateLimiter>, req: Request, next: Next) -> Response {
    if !limiter.applies_to(req.uri().path()) {
        return next.run(req).await;
    }

    let client = client_key(&req);
    match limiter.check(&client) {
        Decision::Allowed {
            remaining,
            reset_after,
        } => {
            let mut res = next.run(req).await;
            for (name, value) in limiter.headers(remaining, reset_after) {
                res.headers_mut().insert(name, value);
            }
            res
        }
        Decision::Limited { reset_after } => {
            warn!(%client, path = %req.uri().path(), "rate limit exceeded");
            let mut res = (StatusCode::TOO_MANY_REQUESTS, LIMITED_MESSAGE).into_response();
            for (name, value) in limiter.headers(0, reset_after) {
                res.headers_mut().insert(name, value);
            }
            res.headers_mut().insert(
                axum::http::header::RETRY_AFTER,
                HeaderValue::from(reset_after.as_secs_f64().ceil() as u64),
            );
            res
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(
            "/api",
            &RateLimitConfig {
                window: Duration::from_secs(window_secs),
                max_requests: max,
            },
        )
    }

    #[test]
    fn prefix_matches_whole_segments_only() {
        let l = limiter(1, 60);
        assert!(l.applies_to("/api"));
        assert!(l.applies_to("/api/v1/health"));
        assert!(!l.applies_to("/apis"));
        assert!(!l.applies_to("/"));
        assert!(!l.applies_to("/v1/api"));
    }

    #[tokio::test]
    async fn hundred_and_first_hit_is_limited() {
        let l = limiter(100, 900);
        for i in 0..100 {
            match l.check("10.0.0.1") {
                Decision::Allowed { remaining, .. } => assert_eq!(remaining, 99 - i),
                other => panic!("hit {i} limited: {other:?}"),
            }
        }
        assert!(matches!(l.check("10.0.0.1"), Decision::Limited { .. }));
        // Other clients keep their own budget.
        assert!(matches!(l.check("10.0.0.2"), Decision::Allowed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_it_elapses() {
        let l = limiter(2, 900);
        l.check("c");
        l.check("c");
        assert!(matches!(l.check("c"), Decision::Limited { .. }));

        tokio::time::advance(Duration::from_secs(899)).await;
        assert!(matches!(l.check("c"), Decision::Limited { .. }));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(
            l.check("c"),
            Decision::Allowed { remaining: 1, .. }
        ));
    }

    #[test]
    fn headers_follow_the_ratelimit_draft() {
        let l = limiter(100, 900);
        let [(p_name, p_value), (s_name, s_value)] = l.headers(42, Duration::from_secs(120));
        assert_eq!(p_name.as_str(), "ratelimit-policy");
        assert_eq!(p_value, "\"100-in-15min\"; q=100; w=900");
        assert_eq!(s_name.as_str(), "ratelimit");
        assert_eq!(s_value, "\"100-in-15min\"; r=42; t=120");
    }
}
