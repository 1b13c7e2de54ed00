//! Persisted per-client cursors. A session's cursor outlives it:
//! reconnecting clients resume from here.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::replication::Lsn;
use super::{Database, Error};

#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Create the cursor table if it doesn't exist. Idempotent.
    async fn init(&self) -> Result<(), Error>;

    /// Last acknowledged LSN for a client, if it ever connected.
    async fn load(&self, client_id: &str) -> Result<Option<Lsn>, Error>;

    /// Record the client's last acknowledged LSN.
    async fn save(&self, client_id: &str, lsn: Lsn) -> Result<(), Error>;

    /// Minimum cursor across all durable subscribers. The slot's
    /// confirmed-flush LSN never advances past this.
    async fn min_cursor(&self) -> Result<Option<Lsn>, Error>;
}

static SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS client_cursor (
    client_id TEXT PRIMARY KEY,
    last_ack_lsn BIGINT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

pub struct PostgresCursors {
    database: Arc<Database>,
}

impl PostgresCursors {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl CursorStore for PostgresCursors {
    async fn init(&self) -> Result<(), Error> {
        self.database.batch_execute(SCHEMA).await
    }

    async fn load(&self, client_id: &str) -> Result<Option<Lsn>, Error> {
        let row = self
            .database
            .query_opt(
                "SELECT last_ack_lsn FROM client_cursor WHERE client_id = $1",
                &[&client_id],
            )
            .await?;

        match row {
            Some(row) => {
                let lsn: i64 = row.try_get("last_ack_lsn")?;
                Ok(Some(Lsn::from_u64(lsn as u64)))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, client_id: &str, lsn: Lsn) -> Result<(), Error> {
        self.database
            .execute(
                r#"
                INSERT INTO client_cursor (client_id, last_ack_lsn, updated_at)
                VALUES ($1, $2, now())
                ON CONFLICT (client_id) DO UPDATE
                    SET last_ack_lsn = GREATEST(client_cursor.last_ack_lsn, EXCLUDED.last_ack_lsn),
                        updated_at = now()
                "#,
                &[&client_id, &(lsn.as_u64() as i64)],
            )
            .await?;

        Ok(())
    }

    async fn min_cursor(&self) -> Result<Option<Lsn>, Error> {
        let row = self
            .database
            .query_opt("SELECT MIN(last_ack_lsn) AS lsn FROM client_cursor", &[])
            .await?
            .ok_or(Error::MissingData)?;

        let lsn: Option<i64> = row.try_get("lsn")?;
        Ok(lsn.map(|lsn| Lsn::from_u64(lsn as u64)))
    }
}

/// In-memory cursors for tests and the standalone harness.
#[derive(Default)]
pub struct MemoryCursors {
    cursors: Mutex<HashMap<String, Lsn>>,
}

impl MemoryCursors {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursors {
    async fn init(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn load(&self, client_id: &str) -> Result<Option<Lsn>, Error> {
        Ok(self.cursors.lock().get(client_id).copied())
    }

    async fn save(&self, client_id: &str, lsn: Lsn) -> Result<(), Error> {
        let mut guard = self.cursors.lock();
        let entry = guard.entry(client_id.to_string()).or_insert(Lsn::ZERO);
        // Cursors only move forward.
        *entry = (*entry).max(lsn);
        Ok(())
    }

    async fn min_cursor(&self) -> Result<Option<Lsn>, Error> {
        Ok(self.cursors.lock().values().min().copied())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[tokio::test]
    async fn test_memory_cursors() {
        let cursors = MemoryCursors::new();
        assert!(cursors.load("c1").await.unwrap().is_none());
        assert!(cursors.min_cursor().await.unwrap().is_none());

        cursors
            .save("c1", Lsn::from_str("0/50").unwrap())
            .await
            .unwrap();
        cursors
            .save("c2", Lsn::from_str("0/30").unwrap())
            .await
            .unwrap();

        assert_eq!(
            cursors.load("c1").await.unwrap(),
            Some(Lsn::from_str("0/50").unwrap())
        );
        assert_eq!(
            cursors.min_cursor().await.unwrap(),
            Some(Lsn::from_str("0/30").unwrap())
        );
    }

    #[tokio::test]
    async fn test_cursor_never_rewinds() {
        let cursors = MemoryCursors::new();
        cursors
            .save("c1", Lsn::from_str("0/50").unwrap())
            .await
            .unwrap();
        cursors
            .save("c1", Lsn::from_str("0/20").unwrap())
            .await
            .unwrap();

        assert_eq!(
            cursors.load("c1").await.unwrap(),
            Some(Lsn::from_str("0/50").unwrap())
        );
    }
}
