use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::sync::Once;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::config::Environment;

/// Error returned by request handlers. Rendered by [`error_handler`].
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Failure detail carried from the failing handler to [`error_handler`] on
/// the response extensions.
#[derive(Debug, Clone)]
pub struct ErrorDetail(pub String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let detail = match &self {
            AppError::Internal(e) => format!("{e:?}"),
        };
        let mut res = StatusCode::INTERNAL_SERVER_ERROR.into_response();
        res.extensions_mut().insert(ErrorDetail(detail));
        res
    }
}

thread_local! {
    /// Backtrace of the last panic on this thread, taken at the panic site.
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Chain a panic hook that records where the panic happened, so
/// [`panic_response`] can report the panicking frames after unwinding.
/// Installed once per process.
pub fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

/// Response for a panicking handler, for `CatchPanicLayer::custom`.
///
/// Runs on the thread that caught the panic, which is the one that raised it.
pub fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    let trace = PANIC_TRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| "backtrace unavailable".to_string());
    let detail = format!("panicked: {message}\n{trace}");
    let mut res = StatusCode::INTERNAL_SERVER_ERROR.into_response();
    res.extensions_mut().insert(ErrorDetail(detail));
    res
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Turns any response carrying an [`ErrorDetail`] into the generic 500 body.
/// The detail is logged and only echoed back in development.
pub async fn error_handler(
    State(environment): State<Environment>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let mut res = next.run(req).await;
    let Some(ErrorDetail(detail)) = res.extensions_mut().remove::<ErrorDetail>() else {
        return res;
    };

    error!(%method, %uri, error = %detail, "unhandled request error");
    let body = ErrorBody {
        status: "error",
        message: "Something went wrong",
        stack: environment.is_development().then_some(detail),
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}
