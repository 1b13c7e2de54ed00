//! In-memory change history, used by tests and the standalone
//! harness. Same contract as the database-backed store.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::ChangeStore;
use crate::backend::replication::Lsn;
use crate::backend::Error;
use crate::net::ChangeRecord;

#[derive(Default)]
pub struct MemoryHistory {
    records: Mutex<BTreeMap<u64, ChangeRecord>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl ChangeStore for MemoryHistory {
    async fn init(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn append(&self, records: &[ChangeRecord]) -> Result<u64, Error> {
        let mut guard = self.records.lock();
        let mut appended = 0;

        for record in records {
            let lsn = record.lsn.as_u64();
            if !guard.contains_key(&lsn) {
                guard.insert(lsn, record.clone());
                appended += 1;
            }
        }

        Ok(appended)
    }

    async fn by_lsn_range(
        &self,
        start_exclusive: Lsn,
        end_inclusive: Option<Lsn>,
        limit: i64,
    ) -> Result<Vec<ChangeRecord>, Error> {
        let end = end_inclusive.unwrap_or(Lsn::from_u64(u64::MAX));
        let guard = self.records.lock();

        Ok(guard
            .range((
                Bound::Excluded(start_exclusive.as_u64()),
                Bound::Included(end.as_u64()),
            ))
            .take(limit.max(0) as usize)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn max_lsn(&self) -> Result<Option<Lsn>, Error> {
        Ok(self
            .records
            .lock()
            .keys()
            .next_back()
            .map(|lsn| Lsn::from_u64(*lsn)))
    }

    async fn purge(&self, lsn: Lsn, older_than: DateTime<Utc>) -> Result<u64, Error> {
        let mut guard = self.records.lock();
        let before = guard.len();

        guard.retain(|key, record| *key >= lsn.as_u64() || record.updated_at >= older_than);

        Ok((before - guard.len()) as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::Operation;
    use serde_json::json;
    use std::str::FromStr;

    fn record(lsn: &str, id: &str) -> ChangeRecord {
        ChangeRecord {
            table: "tasks".into(),
            operation: Operation::Insert,
            data: json!({"id": id}),
            updated_at: Utc::now(),
            lsn: Lsn::from_str(lsn).unwrap(),
            xid: None,
        }
    }

    #[tokio::test]
    async fn test_append_dedupes_by_lsn() {
        let history = MemoryHistory::new();
        let batch = vec![record("0/10", "T1"), record("0/20", "T2")];

        assert_eq!(history.append(&batch).await.unwrap(), 2);
        // Feeding the same batch twice produces zero new rows.
        assert_eq!(history.append(&batch).await.unwrap(), 0);
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_range_is_exclusive_inclusive() {
        let history = MemoryHistory::new();
        history
            .append(&[record("0/10", "T1"), record("0/20", "T2"), record("0/30", "T3")])
            .await
            .unwrap();

        let range = history
            .by_lsn_range(
                Lsn::from_str("0/10").unwrap(),
                Some(Lsn::from_str("0/30").unwrap()),
                100,
            )
            .await
            .unwrap();

        let lsns: Vec<String> = range.iter().map(|r| r.lsn.to_string()).collect();
        assert_eq!(lsns, vec!["0/20", "0/30"]);
    }

    #[tokio::test]
    async fn test_range_limit_and_order() {
        let history = MemoryHistory::new();
        history
            .append(&[record("0/30", "T3"), record("0/10", "T1"), record("0/20", "T2")])
            .await
            .unwrap();

        let range = history.by_lsn_range(Lsn::ZERO, None, 2).await.unwrap();
        let lsns: Vec<String> = range.iter().map(|r| r.lsn.to_string()).collect();
        assert_eq!(lsns, vec!["0/10", "0/20"]);

        assert_eq!(
            history.max_lsn().await.unwrap(),
            Some(Lsn::from_str("0/30").unwrap())
        );
    }

    #[tokio::test]
    async fn test_purge_respects_cursor_and_age() {
        let history = MemoryHistory::new();
        let mut old = record("0/10", "T1");
        old.updated_at = Utc::now() - chrono::Duration::hours(48);
        let mut recent = record("0/20", "T2");
        recent.updated_at = Utc::now();
        history.append(&[old, recent, record("0/30", "T3")]).await.unwrap();

        // Only rows below the cursor AND older than the window go.
        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let removed = history
            .purge(Lsn::from_str("0/30").unwrap(), cutoff)
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert_eq!(history.len(), 2);
    }
}
