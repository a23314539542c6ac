use axum::http::StatusCode;

pub async fn hello() -> &'static str {
    "Hello World!"
}

/// Fallback for every unmatched path.
pub async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not Found")
}
