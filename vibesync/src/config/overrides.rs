//! Settings that can be overridden from the command line.

#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Connection string for the authoritative database.
    pub database_url: Option<String>,
    /// Replication slot name.
    pub slot: Option<String>,
}
