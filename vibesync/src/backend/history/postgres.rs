//! Change history in the authoritative database.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::Row;

use super::ChangeStore;
use crate::backend::replication::Lsn;
use crate::backend::{Database, Error};
use crate::net::{ChangeRecord, Operation};

static SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS change_history (
    id BIGSERIAL PRIMARY KEY,
    lsn BIGINT NOT NULL,
    xid TEXT,
    tbl TEXT NOT NULL,
    op TEXT NOT NULL,
    data JSONB NOT NULL,
    ts TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE UNIQUE INDEX IF NOT EXISTS change_history_lsn_idx ON change_history (lsn);
"#;

pub struct PostgresHistory {
    database: Arc<Database>,
}

impl PostgresHistory {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    fn record(row: &Row) -> Result<ChangeRecord, Error> {
        let lsn: i64 = row.try_get("lsn")?;
        let op: String = row.try_get("op")?;

        Ok(ChangeRecord {
            lsn: Lsn::from_u64(lsn as u64),
            xid: row.try_get("xid")?,
            table: row.try_get("tbl")?,
            operation: Operation::from_str(&op).map_err(|_| Error::MissingData)?,
            data: row.try_get("data")?,
            updated_at: row.try_get("ts")?,
        })
    }
}

#[async_trait]
impl ChangeStore for PostgresHistory {
    async fn init(&self) -> Result<(), Error> {
        self.database.batch_execute(SCHEMA).await
    }

    async fn append(&self, records: &[ChangeRecord]) -> Result<u64, Error> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut lsns = Vec::with_capacity(records.len());
        let mut xids = Vec::with_capacity(records.len());
        let mut tables = Vec::with_capacity(records.len());
        let mut ops = Vec::with_capacity(records.len());
        let mut data = Vec::with_capacity(records.len());
        let mut timestamps = Vec::with_capacity(records.len());

        for record in records {
            lsns.push(record.lsn.as_u64() as i64);
            xids.push(record.xid.clone());
            tables.push(record.table.clone());
            ops.push(record.operation.to_string());
            data.push(record.data.clone());
            timestamps.push(record.updated_at);
        }

        // One statement, one transaction. Duplicates at the
        // history boundary are suppressed by the LSN index.
        self.database
            .execute(
                r#"
                INSERT INTO change_history (lsn, xid, tbl, op, data, ts)
                SELECT * FROM UNNEST(
                    $1::BIGINT[], $2::TEXT[], $3::TEXT[],
                    $4::TEXT[], $5::JSONB[], $6::TIMESTAMPTZ[]
                )
                ON CONFLICT (lsn) DO NOTHING
                "#,
                &[&lsns, &xids, &tables, &ops, &data, &timestamps],
            )
            .await
    }

    async fn by_lsn_range(
        &self,
        start_exclusive: Lsn,
        end_inclusive: Option<Lsn>,
        limit: i64,
    ) -> Result<Vec<ChangeRecord>, Error> {
        let start = start_exclusive.as_u64() as i64;
        let end = end_inclusive.unwrap_or(Lsn::from_u64(u64::MAX)).as_u64() as i64;

        let rows = self
            .database
            .query(
                r#"
                SELECT lsn, xid, tbl, op, data, ts FROM change_history
                WHERE lsn > $1 AND lsn <= $2
                ORDER BY lsn ASC
                LIMIT $3
                "#,
                &[&start, &end, &limit],
            )
            .await?;

        rows.iter().map(Self::record).collect()
    }

    async fn max_lsn(&self) -> Result<Option<Lsn>, Error> {
        let row = self
            .database
            .query_opt("SELECT MAX(lsn) AS lsn FROM change_history", &[])
            .await?
            .ok_or(Error::MissingData)?;

        let lsn: Option<i64> = row.try_get("lsn")?;
        Ok(lsn.map(|lsn| Lsn::from_u64(lsn as u64)))
    }

    async fn purge(&self, lsn: Lsn, older_than: DateTime<Utc>) -> Result<u64, Error> {
        self.database
            .execute(
                "DELETE FROM change_history WHERE lsn < $1 AND ts < $2",
                &[&(lsn.as_u64() as i64), &older_than],
            )
            .await
    }
}
