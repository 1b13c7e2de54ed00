//! Decode wal2json (format version 2) output into change records.
//!
//! Each slot row is one action: `B`/`C` frame a transaction,
//! `I`/`U`/`D` carry a row image. A row that fails to parse
//! rejects the whole batch; no torn batches enter history.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use super::slot::SlotChange;
use super::Error;
use crate::net::{ChangeRecord, Operation};

#[derive(Debug, Deserialize)]
struct Entry {
    action: String,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    columns: Option<Vec<Column>>,
    #[serde(default)]
    identity: Option<Vec<Column>>,
}

#[derive(Debug, Deserialize)]
struct Column {
    name: String,
    #[serde(default)]
    value: Value,
}

/// Decode one polled batch. Transactions arrive framed, so the
/// commit timestamp from the `B` row is applied to every row
/// image that follows it in the same transaction.
pub fn decode_batch(changes: &[SlotChange]) -> Result<Vec<ChangeRecord>, Error> {
    let mut records = Vec::with_capacity(changes.len());
    let mut commit_times: HashMap<String, DateTime<Utc>> = HashMap::new();

    for change in changes {
        let entry: Entry = serde_json::from_str(&change.data)?;

        let operation = match entry.action.as_str() {
            "B" => {
                if let (Some(xid), Some(ts)) = (&change.xid, &entry.timestamp) {
                    if let Some(ts) = parse_timestamp(ts) {
                        commit_times.insert(xid.clone(), ts);
                    }
                }
                continue;
            }
            "C" => {
                if let Some(xid) = &change.xid {
                    commit_times.remove(xid);
                }
                continue;
            }
            "I" => Operation::Insert,
            "U" => Operation::Update,
            "D" => Operation::Delete,
            // Truncates and messages don't map to row changes.
            other => {
                warn!("skipping unsupported wal action \"{}\" at {}", other, change.lsn);
                continue;
            }
        };

        let table = match entry.table {
            Some(ref table) if !table.is_empty() => canonical_table(table),
            _ => {
                warn!("skipping wal row image without a table at {}", change.lsn);
                continue;
            }
        };

        // Deletes only ship the replica identity.
        let columns = match operation {
            Operation::Delete => entry.identity,
            _ => entry.columns,
        };

        let data = match columns {
            Some(columns) => row_image(columns),
            None => {
                warn!(
                    "skipping {} on \"{}\" without a row image at {}",
                    operation, table, change.lsn
                );
                continue;
            }
        };

        let updated_at = change
            .xid
            .as_ref()
            .and_then(|xid| commit_times.get(xid).copied())
            .unwrap_or_else(Utc::now);

        records.push(ChangeRecord {
            table,
            operation,
            data,
            updated_at,
            lsn: change.lsn,
            xid: change.xid.clone(),
        });
    }

    Ok(records)
}

fn row_image(columns: Vec<Column>) -> Value {
    let mut image = Map::with_capacity(columns.len());
    for column in columns {
        image.insert(column.name, column.value);
    }
    Value::Object(image)
}

/// Logical table names are the canonical plural form.
pub fn canonical_table(name: &str) -> String {
    if name.ends_with('s') {
        return name.to_string();
    }

    if let Some(stem) = name.strip_suffix('y') {
        let penultimate = stem.chars().last();
        if !matches!(penultimate, Some('a' | 'e' | 'i' | 'o' | 'u')) {
            return format!("{}ies", stem);
        }
    }

    if name.ends_with('x') || name.ends_with("ch") || name.ends_with("sh") {
        return format!("{}es", name);
    }

    format!("{}s", name)
}

// wal2json prints timestamps like "2025-01-15 10:00:00.123456+00".
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%#z")
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::replication::Lsn;
    use std::str::FromStr;

    fn change(lsn: &str, xid: Option<&str>, data: &str) -> SlotChange {
        SlotChange {
            lsn: Lsn::from_str(lsn).unwrap(),
            xid: xid.map(String::from),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_decode_transaction() {
        let batch = vec![
            change(
                "0/10",
                Some("771"),
                r#"{"action":"B","timestamp":"2025-01-15 10:00:00.123456+00"}"#,
            ),
            change(
                "0/18",
                Some("771"),
                r#"{"action":"I","schema":"public","table":"task","columns":[{"name":"id","type":"text","value":"T1"},{"name":"status","type":"text","value":"open"}]}"#,
            ),
            change(
                "0/20",
                Some("771"),
                r#"{"action":"U","schema":"public","table":"task","columns":[{"name":"id","type":"text","value":"T1"},{"name":"status","type":"text","value":"done"}]}"#,
            ),
            change("0/28", Some("771"), r#"{"action":"C"}"#),
        ];

        let records = decode_batch(&batch).unwrap();
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].table, "tasks");
        assert_eq!(records[0].operation, Operation::Insert);
        assert_eq!(records[0].data["id"], "T1");
        assert_eq!(records[0].lsn, Lsn::from_str("0/18").unwrap());
        assert_eq!(records[0].xid.as_deref(), Some("771"));
        assert_eq!(
            records[0].updated_at.to_rfc3339(),
            "2025-01-15T10:00:00.123456+00:00"
        );

        assert_eq!(records[1].operation, Operation::Update);
        assert_eq!(records[1].data["status"], "done");
    }

    #[test]
    fn test_decode_delete_uses_identity() {
        let batch = vec![change(
            "0/30",
            Some("772"),
            r#"{"action":"D","schema":"public","table":"task","identity":[{"name":"id","type":"text","value":"T1"}]}"#,
        )];

        let records = decode_batch(&batch).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, Operation::Delete);
        assert_eq!(records[0].data, serde_json::json!({"id": "T1"}));
    }

    #[test]
    fn test_torn_batch_rejected_whole() {
        let batch = vec![
            change(
                "0/10",
                Some("771"),
                r#"{"action":"I","table":"task","columns":[{"name":"id","value":"T1"}]}"#,
            ),
            change("0/18", Some("771"), r#"{"action":"I","table":"#),
        ];

        assert!(decode_batch(&batch).is_err());
    }

    #[test]
    fn test_unsupported_actions_skipped() {
        let batch = vec![
            change("0/10", Some("771"), r#"{"action":"T","table":"task"}"#),
            change(
                "0/18",
                Some("771"),
                r#"{"action":"I","table":"task","columns":[{"name":"id","value":"T1"}]}"#,
            ),
        ];

        let records = decode_batch(&batch).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, Operation::Insert);
    }

    #[test]
    fn test_canonical_tables() {
        assert_eq!(canonical_table("task"), "tasks");
        assert_eq!(canonical_table("tasks"), "tasks");
        assert_eq!(canonical_table("category"), "categories");
        assert_eq!(canonical_table("day"), "days");
        assert_eq!(canonical_table("box"), "boxes");
        assert_eq!(canonical_table("branch"), "branches");
    }

    #[test]
    fn test_timestamp_formats() {
        assert!(parse_timestamp("2025-01-15 10:00:00.123456+00").is_some());
        assert!(parse_timestamp("2025-01-15 10:00:00+02").is_some());
        assert!(parse_timestamp("not a time").is_none());
    }
}
