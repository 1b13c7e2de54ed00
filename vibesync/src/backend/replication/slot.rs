//! Logical replication slot, managed over ordinary SQL.
//!
//! The slot is peeked, never consumed: records leave the slot
//! only when the confirmed-flush LSN advances past them.

use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tokio_postgres::Row;
use tracing::{debug, info};

use super::{Error, Lsn};
use crate::backend::Database;

/// One row returned by a slot peek, still encoded.
#[derive(Debug, Clone)]
pub struct SlotChange {
    pub lsn: Lsn,
    pub xid: Option<String>,
    pub data: String,
}

/// What `pg_replication_slots` knows about a slot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStatus {
    pub name: String,
    pub plugin: String,
    pub active: bool,
    pub restart_lsn: Option<Lsn>,
    pub confirmed_flush_lsn: Option<Lsn>,
}

pub struct ReplicationSlot {
    database: Arc<Database>,
    name: String,
}

impl ReplicationSlot {
    pub fn new(database: Arc<Database>, name: &str) -> Self {
        Self {
            database,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slot status, if the slot exists.
    pub async fn status(&self) -> Result<Option<SlotStatus>, Error> {
        let row = self
            .database
            .query_opt(
                r#"
                SELECT slot_name, plugin, active,
                       restart_lsn::TEXT AS restart_lsn,
                       confirmed_flush_lsn::TEXT AS confirmed_flush_lsn
                FROM pg_replication_slots
                WHERE slot_name = $1
                "#,
                &[&self.name],
            )
            .await?;

        row.map(|row| Self::slot_status(&row)).transpose()
    }

    /// All slots on the server. Used by the admin surface.
    pub async fn all(database: &Database) -> Result<Vec<SlotStatus>, Error> {
        let rows = database
            .query(
                r#"
                SELECT slot_name, plugin, active,
                       restart_lsn::TEXT AS restart_lsn,
                       confirmed_flush_lsn::TEXT AS confirmed_flush_lsn
                FROM pg_replication_slots
                ORDER BY slot_name
                "#,
                &[],
            )
            .await?;

        rows.iter().map(Self::slot_status).collect()
    }

    fn slot_status(row: &Row) -> Result<SlotStatus, Error> {
        let restart_lsn: Option<String> = row.try_get("restart_lsn").map_err(crate::backend::Error::from)?;
        let confirmed: Option<String> = row
            .try_get("confirmed_flush_lsn")
            .map_err(crate::backend::Error::from)?;

        Ok(SlotStatus {
            name: row.try_get("slot_name").map_err(crate::backend::Error::from)?,
            plugin: row.try_get("plugin").map_err(crate::backend::Error::from)?,
            active: row.try_get("active").map_err(crate::backend::Error::from)?,
            restart_lsn: restart_lsn.as_deref().map(Lsn::from_str).transpose()?,
            confirmed_flush_lsn: confirmed.as_deref().map(Lsn::from_str).transpose()?,
        })
    }

    /// Create the slot if it doesn't exist; verify the plugin if
    /// it does. Idempotent. Returns the server's current LSN.
    pub async fn ensure(&self) -> Result<Lsn, Error> {
        match self.status().await? {
            Some(status) => {
                if status.plugin != "wal2json" {
                    return Err(Error::WrongPlugin(self.name.clone(), status.plugin));
                }
                debug!("replication slot \"{}\" already exists", self.name);
            }
            None => {
                self.database
                    .execute(
                        "SELECT pg_create_logical_replication_slot($1, 'wal2json')",
                        &[&self.name],
                    )
                    .await?;
                info!("replication slot \"{}\" created", self.name);
            }
        }

        self.current_lsn().await
    }

    /// Server's current WAL position.
    pub async fn current_lsn(&self) -> Result<Lsn, Error> {
        Self::server_lsn(&self.database).await
    }

    pub async fn server_lsn(database: &Database) -> Result<Lsn, Error> {
        let row = database
            .query_opt("SELECT pg_current_wal_lsn()::TEXT AS lsn", &[])
            .await?
            .ok_or(Error::MissingData)?;

        let lsn: String = row.try_get("lsn").map_err(crate::backend::Error::from)?;
        Ok(Lsn::from_str(&lsn)?)
    }

    /// Peek up to `limit` change records without consuming them.
    pub async fn peek(&self, limit: i64) -> Result<Vec<SlotChange>, Error> {
        let rows = self
            .database
            .query(
                r#"
                SELECT lsn::TEXT AS lsn, xid::TEXT AS xid, data
                FROM pg_logical_slot_peek_changes(
                    $1, NULL, $2::INT,
                    'format-version', '2',
                    'include-timestamp', 'true'
                )
                "#,
                &[&self.name, &(limit as i32)],
            )
            .await
            .map_err(|err| self.missing_slot(err))?;

        let mut changes = Vec::with_capacity(rows.len());
        for row in rows {
            let lsn: String = row.try_get("lsn").map_err(crate::backend::Error::from)?;
            changes.push(SlotChange {
                lsn: Lsn::from_str(&lsn)?,
                xid: row.try_get("xid").map_err(crate::backend::Error::from)?,
                data: row.try_get("data").map_err(crate::backend::Error::from)?,
            });
        }

        Ok(changes)
    }

    /// Advance the confirmed-flush LSN. Records at or below it
    /// leave the slot for good.
    pub async fn advance(&self, to: Lsn) -> Result<(), Error> {
        self.database
            .execute(
                "SELECT pg_replication_slot_advance($1, $2::PG_LSN)",
                &[&self.name, &to.to_string()],
            )
            .await
            .map_err(|err| self.missing_slot(err))?;

        debug!("slot \"{}\" confirmed through {}", self.name, to);
        Ok(())
    }

    // Peeking a dropped slot raises undefined_object; give the
    // operator the slot name instead of a bare sqlstate.
    fn missing_slot(&self, err: crate::backend::Error) -> Error {
        if err.undefined_object() {
            Error::SlotMissing(self.name.clone())
        } else {
            Error::Backend(err)
        }
    }
}
