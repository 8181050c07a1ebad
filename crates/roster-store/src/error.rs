use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cannot open database {path}: {reason}")]
    Open { path: String, reason: String },
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
    #[error("email already registered: {0}")]
    DuplicateEmail(String),
    #[error("employee not found: {0}")]
    EmployeeNotFound(String),
    #[error("employee {0} is already checked in today")]
    AlreadyCheckedIn(String),
    #[error("no open attendance record {0}")]
    NotOpen(String),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
}

/// True if `err` is a UNIQUE constraint failure.
pub(crate) fn is_unique_violation(err: &tokio_rusqlite::Error) -> bool {
    matches!(
        err,
        tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _))
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// True if `err` is a FOREIGN KEY constraint failure.
pub(crate) fn is_foreign_key_violation(err: &tokio_rusqlite::Error) -> bool {
    matches!(
        err,
        tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _))
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}
