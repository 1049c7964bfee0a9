//! SQLite state store for pagesync.
//!
//! Provides a [`Database`] handle with WAL-mode journaling, automatic schema
//! migrations, and typed operations for every table. Each operation is a free
//! function over `&Connection` in the table's submodule so that several can
//! share one transaction; the matching `Database` method wraps a single call
//! in its own transaction.

pub mod attachments;
pub mod conflicts;
pub mod graph;
pub mod items;
pub mod meta;
pub mod schema;
pub mod snapshot;

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::errors::DatabaseError;

/// Main database handle wrapping a SQLite connection.
///
/// The inner connection is wrapped in a `Mutex` so that `Database` is
/// `Send + Sync`, enabling use inside `Arc` from concurrent batch tasks.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path`, creating parent
    /// directories as needed.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening state store");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

        debug!("state store opened with WAL mode");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run all schema migrations to bring the database up to date.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        let conn = self.conn();
        schema::run_migrations(&conn)?;
        debug!("state store schema is up to date");
        Ok(())
    }

    /// Obtain a lock on the underlying connection.
    ///
    /// If the Mutex is poisoned (a previous holder panicked), the lock is
    /// recovered rather than propagating a panic.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Execute a closure inside a SQLite transaction. If the closure returns
    /// `Ok`, the transaction is committed; otherwise it is rolled back.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Run `PRAGMA quick_check`. Any answer other than `ok` is corruption.
    pub fn integrity_check(&self) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("PRAGMA quick_check")?;
        let problems: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<_, _>>()?;
        if problems.len() == 1 && problems[0] == "ok" {
            Ok(())
        } else {
            Err(DatabaseError::Corruption(problems.join("; ")))
        }
    }
}

// ---------------------------------------------------------------------------
// Row validation helpers
// ---------------------------------------------------------------------------

/// Parse a stored enum string, reporting unknown values as corruption.
pub(crate) fn parse_enum<T>(value: &str, table: &str, key: &str) -> Result<T, DatabaseError>
where
    T: FromStr<Err = String>,
{
    value
        .parse::<T>()
        .map_err(|e| DatabaseError::Corruption(format!("{table} row {key}: {e}")))
}

/// Parse an optional RFC 3339 timestamp column.
pub(crate) fn parse_time(
    value: Option<String>,
    table: &str,
    key: &str,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| DatabaseError::Corruption(format!("{table} row {key}: bad time: {e}")))
        })
        .transpose()
}

/// Parse a JSON string array column.
pub(crate) fn parse_id_list(
    value: &str,
    table: &str,
    key: &str,
) -> Result<Vec<String>, DatabaseError> {
    serde_json::from_str(value)
        .map_err(|e| DatabaseError::Corruption(format!("{table} row {key}: bad id list: {e}")))
}

pub(crate) fn encode_id_list(ids: &[String]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_database() {
        let db = Database::in_memory().expect("failed to create in-memory db");
        db.initialize().expect("failed to initialize schema");
        db.integrity_check().unwrap();
    }

    #[test]
    fn test_file_database_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".pagesync").join("state.db");
        let db = Database::new(&path).expect("failed to create file db");
        db.initialize().expect("failed to initialize schema");
        assert!(path.exists());
    }

    #[test]
    fn test_transaction_commit() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();

        db.transaction(|conn| meta::set_meta(conn, "k", "42")).unwrap();
        assert_eq!(db.get_meta("k").unwrap().as_deref(), Some("42"));
    }

    #[test]
    fn test_transaction_rollback() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();

        let result: Result<(), DatabaseError> = db.transaction(|conn| {
            meta::set_meta(conn, "rollback_test", "99")?;
            Err(DatabaseError::NotFound {
                entity: "test".into(),
                id: "forced".into(),
            })
        });
        assert!(result.is_err());
        assert!(db.get_meta("rollback_test").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_maps_to_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        std::fs::write(&path, vec![0x5au8; 8192]).unwrap();
        let result = Database::new(&path).and_then(|db| db.initialize());
        assert!(matches!(result, Err(DatabaseError::Corruption(_))));
    }
}
