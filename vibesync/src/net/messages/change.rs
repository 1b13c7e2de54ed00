//! The immutable unit flowing through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::replication::Lsn;

/// Marker set by producers on changes that must reach every
/// session even when a later change to the same key is pending.
pub const INTENTIONAL_DUPLICATE: &str = "__intentionalDuplicate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(()),
        }
    }
}

/// A single decoded change. For inserts and updates, `data` is
/// the new row; for deletes, at minimum the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub table: String,
    pub operation: Operation,
    pub data: Value,
    pub updated_at: DateTime<Utc>,
    pub lsn: Lsn,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xid: Option<String>,
}

impl ChangeRecord {
    /// Primary key of the row, taken from the row image.
    pub fn primary_key(&self) -> Option<String> {
        match self.data.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    /// `(table, primary key)`, the coalescing identity.
    pub fn key(&self) -> Option<(String, String)> {
        self.primary_key().map(|pk| (self.table.clone(), pk))
    }

    /// Producer asked for this record to bypass coalescing.
    pub fn intentional_duplicate(&self) -> bool {
        matches!(
            self.data.get(INTENTIONAL_DUPLICATE),
            Some(Value::Bool(true))
        )
    }

    /// Approximate size on the wire, used for batch byte caps.
    pub fn wire_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}
