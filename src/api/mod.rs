//! HTTP surface over [`ImageService`](crate::service::ImageService).
pub mod handlers;
pub mod routes;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::{AppError, ErrorKind};

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::WorkflowNotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Injection | ErrorKind::UnsupportedWorkflow | ErrorKind::Parse => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorKind::BackendUnreachable => StatusCode::BAD_GATEWAY,
        ErrorKind::JobFailed => StatusCode::BAD_GATEWAY,
        ErrorKind::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::QueueFull | ErrorKind::QueueTimeout => StatusCode::SERVICE_UNAVAILABLE,
        // client closed request
        ErrorKind::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        ErrorKind::Config | ErrorKind::Io => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            tracing::error!(error = %self, code = kind.code(), "Request failed");
        }
        let body = json!({
            "error": self.to_string(),
            "code": kind.code(),
            "retryable": kind.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}
