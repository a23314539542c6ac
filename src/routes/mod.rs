use axum::{routing::get, Router};

use crate::state::AppState;

pub mod health;
pub mod root;

pub use health::health;
pub use root::{hello, not_found};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(hello))
        .nest("/api/v1", Router::new().route("/health", get(health)))
}
