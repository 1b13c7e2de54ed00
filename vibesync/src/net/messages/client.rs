//! Messages sent by client replicas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::replication::Lsn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Keeps the session alive. Missing for twice the configured
    /// interval fails the session.
    #[serde(rename = "clt_heartbeat", rename_all = "camelCase")]
    Heartbeat {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Acknowledges one catchup chunk; the next chunk is held
    /// until this arrives.
    #[serde(rename = "clt_catchup_received", rename_all = "camelCase")]
    CatchupReceived {
        client_id: String,
        chunk: u32,
        lsn: Lsn,
    },

    /// Acknowledges live changes up to `lastLSN`.
    #[serde(rename = "clt_changes_ack", rename_all = "camelCase")]
    ChangesAck {
        client_id: String,
        #[serde(rename = "lastLSN")]
        last_lsn: Lsn,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
}

impl ClientMessage {
    pub fn client_id(&self) -> &str {
        match self {
            Self::Heartbeat { client_id, .. } => client_id,
            Self::CatchupReceived { client_id, .. } => client_id,
            Self::ChangesAck { client_id, .. } => client_id,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_heartbeat() {
        let message: ClientMessage = serde_json::from_str(
            r#"{"type": "clt_heartbeat", "clientId": "c1", "timestamp": "2025-01-15T10:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(message, ClientMessage::Heartbeat { .. }));
        assert_eq!(message.client_id(), "c1");
    }

    #[test]
    fn test_catchup_received() {
        let message: ClientMessage = serde_json::from_str(
            r#"{"type": "clt_catchup_received", "clientId": "c1", "chunk": 2, "lsn": "0/20"}"#,
        )
        .unwrap();
        match message {
            ClientMessage::CatchupReceived { chunk, lsn, .. } => {
                assert_eq!(chunk, 2);
                assert_eq!(lsn, Lsn::from_str("0/20").unwrap());
            }
            _ => panic!("not a catchup ack"),
        }
    }

    #[test]
    fn test_changes_ack_field_name() {
        let message: ClientMessage = serde_json::from_str(
            r#"{"type": "clt_changes_ack", "clientId": "c1", "lastLSN": "1/a0"}"#,
        )
        .unwrap();
        match message {
            ClientMessage::ChangesAck {
                last_lsn,
                timestamp,
                ..
            } => {
                assert_eq!(last_lsn, Lsn::from_str("1/a0").unwrap());
                assert!(timestamp.is_none());
            }
            _ => panic!("not an ack"),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result: Result<ClientMessage, _> =
            serde_json::from_str(r#"{"type": "clt_bogus", "clientId": "c1"}"#);
        assert!(result.is_err());
    }
}
