//! Messages sent to client replicas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ChangeRecord;
use crate::backend::replication::Lsn;

/// Position of a chunk in a split delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    pub chunk: u32,
    pub total: u32,
}

/// Close codes a session can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseCode {
    Timeout,
    Protocol,
    Backpressure,
    ServerShutdown,
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Protocol => write!(f, "protocol"),
            Self::Backpressure => write!(f, "backpressure"),
            Self::ServerShutdown => write!(f, "server_shutdown"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// One chunk of history replay.
    #[serde(rename = "srv_catchup_changes", rename_all = "camelCase")]
    CatchupChanges {
        client_id: String,
        message_id: String,
        timestamp: DateTime<Utc>,
        changes: Vec<ChangeRecord>,
        sequence: Sequence,
        #[serde(rename = "lastLSN")]
        last_lsn: Lsn,
    },

    /// Replay finished; the live stream continues after `finalLSN`.
    #[serde(rename = "srv_catchup_completed", rename_all = "camelCase")]
    CatchupCompleted {
        client_id: String,
        message_id: String,
        timestamp: DateTime<Utc>,
        success: bool,
        change_count: usize,
        #[serde(rename = "startLSN")]
        start_lsn: Lsn,
        #[serde(rename = "finalLSN")]
        final_lsn: Lsn,
    },

    /// Newly ingested changes. `sequence` is set only when one
    /// transaction had to be split across messages.
    #[serde(rename = "srv_live_changes", rename_all = "camelCase")]
    LiveChanges {
        client_id: String,
        message_id: String,
        timestamp: DateTime<Utc>,
        changes: Vec<ChangeRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<Sequence>,
        #[serde(rename = "lastLSN")]
        last_lsn: Lsn,
    },

    /// Server position moved with nothing to deliver.
    #[serde(rename = "srv_lsn_update", rename_all = "camelCase")]
    LsnUpdate {
        client_id: String,
        message_id: String,
        timestamp: DateTime<Utc>,
        lsn: Lsn,
    },

    /// Session is failing with a close code.
    #[serde(rename = "srv_error", rename_all = "camelCase")]
    Error {
        client_id: String,
        message_id: String,
        timestamp: DateTime<Utc>,
        code: CloseCode,
        message: String,
    },
}

impl ServerMessage {
    pub fn catchup_changes(
        client_id: &str,
        changes: Vec<ChangeRecord>,
        sequence: Sequence,
        last_lsn: Lsn,
    ) -> Self {
        Self::CatchupChanges {
            client_id: client_id.into(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            changes,
            sequence,
            last_lsn,
        }
    }

    pub fn catchup_completed(
        client_id: &str,
        change_count: usize,
        start_lsn: Lsn,
        final_lsn: Lsn,
    ) -> Self {
        Self::CatchupCompleted {
            client_id: client_id.into(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            success: true,
            change_count,
            start_lsn,
            final_lsn,
        }
    }

    pub fn live_changes(
        client_id: &str,
        changes: Vec<ChangeRecord>,
        sequence: Option<Sequence>,
        last_lsn: Lsn,
    ) -> Self {
        Self::LiveChanges {
            client_id: client_id.into(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            changes,
            sequence,
            last_lsn,
        }
    }

    pub fn lsn_update(client_id: &str, lsn: Lsn) -> Self {
        Self::LsnUpdate {
            client_id: client_id.into(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            lsn,
        }
    }

    pub fn error(client_id: &str, code: CloseCode, message: &str) -> Self {
        Self::Error {
            client_id: client_id.into(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            code,
            message: message.into(),
        }
    }

    /// Highest LSN the message advances the client to, if any.
    pub fn last_lsn(&self) -> Option<Lsn> {
        match self {
            Self::CatchupChanges { last_lsn, .. } => Some(*last_lsn),
            Self::CatchupCompleted { final_lsn, .. } => Some(*final_lsn),
            Self::LiveChanges { last_lsn, .. } => Some(*last_lsn),
            Self::LsnUpdate { lsn, .. } => Some(*lsn),
            Self::Error { .. } => None,
        }
    }
}
