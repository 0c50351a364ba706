pub mod error;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod queries;

use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

pub use error::{Result, StoreError};
pub use messages::NewMessage;
pub use queries::NewItem;

const READER_POOL_SIZE: usize = 4;

/// SQLite store with one writer and a small pool of read-only connections.
pub struct Database {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    reader_idx: AtomicUsize,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let writer = Connection::open(path)?;

        // WAL mode for concurrent reads
        writer.pragma_update(None, "journal_mode", "WAL")?;
        writer.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run(&writer)?;
        migrations::verify(&writer)?;

        let mut readers = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            let conn = Connection::open_with_flags(
                path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            readers.push(Mutex::new(conn));
        }

        info!(
            "Database opened at {} (1 writer + {} readers)",
            path.display(),
            READER_POOL_SIZE
        );
        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            reader_idx: AtomicUsize::new(0),
        })
    }

    /// Private in-memory database. Reads go through the writer connection.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;
        migrations::verify(&conn)?;

        Ok(Self {
            writer: Mutex::new(conn),
            readers: Vec::new(),
            reader_idx: AtomicUsize::new(0),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        if self.readers.is_empty() {
            return self.with_conn_mut(f);
        }
        let idx = self.reader_idx.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx]
            .lock()
            .map_err(|e| StoreError::Lock(format!("reader lock poisoned: {}", e)))?;
        f(&conn)
    }

    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .writer
            .lock()
            .map_err(|e| StoreError::Lock(format!("writer lock poisoned: {}", e)))?;
        f(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_database_reads_writes_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("macfind.db");

        let id = {
            let db = Database::open(&path).unwrap();
            let id = db.upsert_identity("someone@mcmaster.ca").unwrap();
            db.ensure_user(id, "someone@mcmaster.ca", None).unwrap();
            // spread reads across the pool
            for _ in 0..READER_POOL_SIZE + 1 {
                assert!(db.get_user(id).unwrap().is_some());
            }
            id
        };

        let reopened = Database::open(&path).unwrap();
        assert_eq!(reopened.upsert_identity("someone@mcmaster.ca").unwrap(), id);
        assert_eq!(reopened.get_user(id).unwrap().unwrap().email, "someone@mcmaster.ca");
    }
}
