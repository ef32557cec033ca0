//! SQLite persistence shared by the action queue and the remote id store.
//!
//! One database file holds the durable queue and both id mapping tables, so a
//! share session survives restarts with its pending work intact.

use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

use listshare_common::{Error, Result};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS sharing_actions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        action TEXT NOT NULL,
        queued_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS shared_list_metadata (
        local_id INTEGER PRIMARY KEY,
        remote_id TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS shared_annotation_metadata (
        local_id TEXT PRIMARY KEY,
        remote_id TEXT NOT NULL
    );
"#;

/// Handle to the sharing database. Clones share one connection.
#[derive(Clone)]
pub struct SharingDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SharingDatabase {
    /// Create or open a sharing database.
    ///
    /// # Arguments
    /// - `db_path`: Path to the SQLite database file
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage_error)?;
        conn.execute_batch(SCHEMA).map_err(storage_error)?;

        info!("Sharing database opened at {}", db_path.as_ref().display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for testing and demos).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Run statements against the connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::Storage("Sharing database lock poisoned".to_string()))?;
        f(&conn).map_err(storage_error)
    }

    /// Run statements inside a transaction that commits when `f` succeeds.
    pub(crate) fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| Error::Storage("Sharing database lock poisoned".to_string()))?;
        let tx = conn.transaction().map_err(storage_error)?;
        let value = f(&tx).map_err(storage_error)?;
        tx.commit().map_err(storage_error)?;
        Ok(value)
    }
}

pub(crate) fn storage_error(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}
