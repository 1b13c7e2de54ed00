//! Admin surface: slot management, position and history queries.
//! Used for operations and by the test harness.

pub mod history;
pub mod replication;
pub mod response;

use axum::routing::{get, post};
use axum::Router;

use crate::frontend::listener::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/replication/init", post(replication::init))
        .route("/replication/lsn", get(replication::lsn))
        .route("/replication/slots", get(replication::slots))
        .route("/history", get(history::history))
}
