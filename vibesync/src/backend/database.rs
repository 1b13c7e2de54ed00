//! Connection to the authoritative database.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::spawn;
use tokio_postgres::{types::ToSql, Client, NoTls, Row};
use tracing::{debug, error, info};

use super::Error;

/// A single connection to the authoritative database. The driver
/// task runs until the connection breaks; after that the handle
/// reports `Error::Offline` until someone reconnects it.
pub struct Database {
    url: String,
    client: ArcSwap<Client>,
}

impl Database {
    /// Connect and spawn the connection driver.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = Self::dial(url).await?;

        Ok(Self {
            url: url.to_string(),
            client: ArcSwap::from_pointee(client),
        })
    }

    /// Replace a broken connection with a fresh one.
    pub async fn reconnect(&self) -> Result<(), Error> {
        let client = Self::dial(&self.url).await?;
        self.client.store(Arc::new(client));
        info!("database connection re-established");
        Ok(())
    }

    async fn dial(url: &str) -> Result<Client, Error> {
        let (client, connection) = tokio_postgres::connect(url, NoTls).await?;

        spawn(async move {
            if let Err(err) = connection.await {
                error!("database connection error: {}", err);
            }
            debug!("database connection closed");
        });

        Ok(client)
    }

    pub async fn query(
        &self,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, Error> {
        Ok(self.checked()?.query(statement, params).await?)
    }

    pub async fn query_opt(
        &self,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>, Error> {
        Ok(self.checked()?.query_opt(statement, params).await?)
    }

    pub async fn execute(
        &self,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, Error> {
        Ok(self.checked()?.execute(statement, params).await?)
    }

    /// Run multiple statements in one round trip. Used for
    /// idempotent DDL at startup.
    pub async fn batch_execute(&self, statements: &str) -> Result<(), Error> {
        Ok(self.checked()?.batch_execute(statements).await?)
    }

    /// Connection still usable.
    pub fn online(&self) -> bool {
        !self.client.load().is_closed()
    }

    fn checked(&self) -> Result<Arc<Client>, Error> {
        let client = self.client.load_full();
        if client.is_closed() {
            Err(Error::Offline)
        } else {
            Ok(client)
        }
    }
}
