//! roster-store: SQLite persistence for employees and attendance.
//!
//! A single `tokio-rusqlite` connection runs on its own thread; every
//! operation is a closure shipped to that thread. Descriptors are stored as
//! JSON text and validated again when read back.

mod attendance;
mod employees;
pub mod error;
pub mod models;
mod schema;

pub use error::StoreError;
pub use models::{Attendance, AttendanceRow, Employee, NewEmployee};

use std::path::Path;
use tokio_rusqlite::Connection;

/// Handle to the attendance database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database file and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Open {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        }
        let conn = Connection::open(path).await?;
        let store = Self { conn };
        store.migrate().await?;
        tracing::info!(path = %path.display(), "opened attendance store");
        Ok(store)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(schema::SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
