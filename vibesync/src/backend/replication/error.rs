use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Backend(#[from] crate::backend::Error),

    #[error("malformed lsn \"{0}\"")]
    MalformedLsn(String),

    #[error("undecodable wal entry: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("replication slot \"{0}\" does not exist")]
    SlotMissing(String),

    #[error("replication slot \"{0}\" uses plugin \"{1}\", expected \"wal2json\"")]
    WrongPlugin(String, String),

    #[error("missing data in query result")]
    MissingData,
}

impl Error {
    pub fn transient(&self) -> bool {
        match self {
            Self::Backend(err) => err.transient(),
            _ => false,
        }
    }

    pub fn slot_busy(&self) -> bool {
        match self {
            Self::Backend(err) => err.slot_busy(),
            _ => false,
        }
    }

    /// Retrying won't help; the process should report and exit.
    pub fn fatal(&self) -> bool {
        match self {
            Self::Backend(err) => err.fatal(),
            Self::SlotMissing(_) | Self::WrongPlugin(_, _) => true,
            _ => false,
        }
    }
}
