use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    WebSocket(#[from] axum::Error),

    #[error("transport write timeout")]
    WriteTimeout,

    #[error("connection closed")]
    ConnectionClosed,
}
