use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Backend(#[from] crate::backend::Error),

    #[error("{0}")]
    Net(#[from] crate::net::Error),

    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    #[error("acknowledgment stalled")]
    AckStalled,

    #[error("unexpected message for session state: {0}")]
    Protocol(String),

    #[error("session cancelled")]
    Cancelled,

    #[error("client disconnected")]
    Disconnected,

    #[error("{0}")]
    Io(#[from] std::io::Error),
}
