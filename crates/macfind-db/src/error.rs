use thiserror::Error;
use uuid::Uuid;

use macfind_types::models::InvalidTransition;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The row exists but the acting user may not touch it.
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    /// A write referenced a user that has no profile row yet.
    #[error("user {0} has no profile row")]
    MissingUser(Uuid),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Startup check found the schema does not match what the code expects.
    #[error("schema contract violated: {0}")]
    Schema(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("{0}")]
    Lock(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// True for `FOREIGN KEY constraint failed`.
pub(crate) fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}
