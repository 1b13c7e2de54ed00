//! Slot management endpoints.

use axum::extract::State;
use axum::response::Response;
use serde_json::json;

use super::response::{ok, ApiError};
use crate::backend::replication::ReplicationSlot;
use crate::frontend::listener::AppState;

/// `POST /replication/init`. Ensure the history and cursor tables
/// and the replication slot exist. Idempotent.
pub async fn init(State(state): State<AppState>) -> Result<Response, ApiError> {
    state.context.history.init().await?;
    state.context.cursors.init().await?;
    let lsn = state.slot.ensure().await?;

    Ok(ok(json!({ "slot": state.slot.name(), "lsn": lsn })))
}

/// `GET /replication/lsn`. Current server WAL position.
pub async fn lsn(State(state): State<AppState>) -> Result<Response, ApiError> {
    let lsn = ReplicationSlot::server_lsn(&state.database).await?;
    Ok(ok(json!({ "lsn": lsn })))
}

/// `GET /replication/slots`. All slots on the server.
pub async fn slots(State(state): State<AppState>) -> Result<Response, ApiError> {
    let slots = ReplicationSlot::all(&state.database).await?;
    Ok(ok(slots))
}
