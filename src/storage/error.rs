//! Storage error classification.
//!
//! The sink only cares about three failure modes: the store is unreachable
//! (spool and back off), the bulk entry point is missing (fall back to
//! per-row inserts), or something genuinely unexpected happened.

use thiserror::Error;

/// Errors surfaced by the relational storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be reached; transient by assumption.
    #[error("storage unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    /// The bulk insert entry point does not exist on this store.
    #[error("bulk entry point missing: {0}")]
    SchemaMissing(String),

    /// Any other database failure.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    /// A row that cannot be mapped back into a domain record.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub fn is_schema_missing(&self) -> bool {
        matches!(self, StoreError::SchemaMissing(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e),
            other => StoreError::Database(other),
        }
    }
}

/// Whether a database error reports a missing table/view, i.e. the bulk
/// entry point is not deployed on this store.
pub(crate) fn is_missing_relation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            let msg = db.message();
            msg.contains("no such table") || msg.contains("no such view")
        }
        _ => false,
    }
}
