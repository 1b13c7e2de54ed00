//! Listener serving the replica WebSocket route and the admin
//! HTTP surface on one port.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;

use super::session::{Session, SessionOptions};
use super::{Context, Error};
use crate::admin;
use crate::backend::replication::{Lsn, ReplicationSlot};
use crate::backend::Database;
use crate::net::WebSocketTransport;

// Transport write timeout.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub context: Context,
    pub database: Arc<Database>,
    pub slot: Arc<ReplicationSlot>,
}

pub struct Listener {
    addr: String,
}

impl Listener {
    pub fn new(addr: String) -> Self {
        Self { addr }
    }

    /// Accept replica and admin connections until shutdown.
    pub async fn listen(&self, state: AppState) -> Result<(), Error> {
        let shutdown = state.context.shutdown.clone();

        let app = Router::new()
            .route("/sync", get(sync))
            .merge(admin::router())
            .with_state(state);

        let listener = TcpListener::bind(&self.addr).await?;
        info!("listening on {}", self.addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct Handshake {
    #[serde(rename = "clientId")]
    client_id: String,
    // "0/0" for a first-ever connect.
    lsn: Option<String>,
}

// The websocket endpoint replicas connect to. Identity is
// verified upstream; the handshake carries the stable client id
// and the client's last known LSN.
async fn sync(
    ws: WebSocketUpgrade,
    Query(handshake): Query<Handshake>,
    State(state): State<AppState>,
) -> Response {
    if handshake.client_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "clientId is required").into_response();
    }

    let requested = match handshake.lsn.as_deref() {
        None | Some("") => Lsn::ZERO,
        Some(lsn) => match Lsn::from_str(lsn) {
            Ok(lsn) => lsn,
            Err(_) => return (StatusCode::BAD_REQUEST, "malformed lsn").into_response(),
        },
    };

    ws.on_upgrade(move |socket| async move {
        let transport = Box::new(WebSocketTransport::new(socket, WRITE_TIMEOUT));
        Session::spawn(
            transport,
            &handshake.client_id,
            requested,
            state.context.clone(),
            SessionOptions::from_config(),
        )
        .await;
    })
}
