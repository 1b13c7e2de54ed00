use thiserror::Error;
use tokio_postgres::error::SqlState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("database connection is gone")]
    Offline,

    #[error("missing data in query result")]
    MissingData,
}

impl Error {
    /// Worth retrying with backoff: timeouts, broken connections,
    /// serialization hiccups.
    pub fn transient(&self) -> bool {
        match self {
            Self::Offline => true,
            Self::MissingData => false,
            Self::Postgres(err) => {
                if err.is_closed() {
                    return true;
                }
                matches!(
                    err.code(),
                    Some(&SqlState::T_R_SERIALIZATION_FAILURE)
                        | Some(&SqlState::T_R_DEADLOCK_DETECTED)
                        | Some(&SqlState::CONNECTION_EXCEPTION)
                        | Some(&SqlState::CONNECTION_FAILURE)
                        | Some(&SqlState::ADMIN_SHUTDOWN)
                        | Some(&SqlState::CRASH_SHUTDOWN)
                        | Some(&SqlState::CANNOT_CONNECT_NOW)
                        | Some(&SqlState::TOO_MANY_CONNECTIONS)
                ) || err.code().is_none()
            }
        }
    }

    /// Another consumer holds the replication slot. Retry a few
    /// times, then give up.
    pub fn slot_busy(&self) -> bool {
        match self {
            Self::Postgres(err) => matches!(err.code(), Some(&SqlState::OBJECT_IN_USE)),
            _ => false,
        }
    }

    /// The named object doesn't exist on the server.
    pub fn undefined_object(&self) -> bool {
        match self {
            Self::Postgres(err) => matches!(
                err.code(),
                Some(&SqlState::UNDEFINED_OBJECT) | Some(&SqlState::UNDEFINED_FUNCTION)
            ),
            _ => false,
        }
    }

    /// No amount of retrying fixes these: missing table, missing
    /// permission, wrong plugin.
    pub fn fatal(&self) -> bool {
        match self {
            Self::Postgres(err) => matches!(
                err.code(),
                Some(&SqlState::UNDEFINED_TABLE)
                    | Some(&SqlState::UNDEFINED_OBJECT)
                    | Some(&SqlState::UNDEFINED_FUNCTION)
                    | Some(&SqlState::INSUFFICIENT_PRIVILEGE)
                    | Some(&SqlState::INVALID_AUTHORIZATION_SPECIFICATION)
            ),
            _ => false,
        }
    }
}
