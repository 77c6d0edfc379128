pub mod migrations;
pub mod models;
pub mod queries;
pub mod store;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::info;

pub use store::{ChangeFeed, SqliteStore};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Local campaign store: one SQLite connection shared behind a mutex.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the file at `path`, creating missing parent
    /// directories, and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let conn = Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let db = Self::prepare(conn)?;
        info!("Campaign store ready at {}", path.display());
        Ok(db)
    }

    /// Private database for tests and simulations.
    pub fn open_in_memory() -> Result<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` against the shared connection, recovering a poisoned lock.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }
}
