//! Response envelope: `{ok: true, data}` or `{ok: false, error}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::backend;
use crate::backend::replication;

pub fn ok<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(json!({ "ok": true, "data": data }))).into_response()
}

#[derive(Debug, Clone, Copy, Serialize)]
pub enum ErrorType {
    #[serde(rename = "INTERNAL")]
    Internal,
    #[serde(rename = "NOT_FOUND")]
    NotFound,
    #[serde(rename = "VALIDATION")]
    Validation,
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "FORBIDDEN")]
    Forbidden,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: ErrorType,
    message: String,
}

impl ApiError {
    pub fn validation(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: ErrorType::Validation,
            message: message.into(),
        }
    }

    pub fn not_found(message: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: ErrorType::NotFound,
            message: message.into(),
        }
    }

    fn internal(status: StatusCode, message: String) -> Self {
        Self {
            status,
            kind: ErrorType::Internal,
            message,
        }
    }
}

impl From<backend::Error> for ApiError {
    fn from(err: backend::Error) -> Self {
        let status = if matches!(err, backend::Error::Offline) || err.transient() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        Self::internal(status, err.to_string())
    }
}

impl From<replication::Error> for ApiError {
    fn from(err: replication::Error) -> Self {
        match err {
            replication::Error::SlotMissing(_) => Self::not_found(&err.to_string()),
            replication::Error::MalformedLsn(_) => Self::validation(&err.to_string()),
            replication::Error::Backend(err) => err.into(),
            other => Self::internal(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "ok": false,
                "error": { "type": self.kind, "message": self.message },
            })),
        )
            .into_response()
    }
}
