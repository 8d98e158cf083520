mod schema;
pub mod photos;
pub mod roots;

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

pub use photos::{DateSource, MissingEmbedding, Photo, PhotoFilters, PhotoSignature, PhotoUpsert};
pub use roots::{RootStatus, TrackedRoot};
pub use schema::LATEST_VERSION;

use schema::MIGRATIONS;

/// Largest id list bound into a single `IN (...)` query.
const ID_CHUNK: usize = 500;

/// One SQLite connection to the catalog.
///
/// `rusqlite::Connection` is `Send` but not `Sync`, and the catalog follows a
/// connection-per-thread rule: every long-lived worker opens its own handle
/// and request threads go through [`with_thread_db`].
pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        configure(&conn)?;
        Ok(Self { conn })
    }

    /// Bring the schema up to [`LATEST_VERSION`].
    pub fn initialize(&self) -> Result<()> {
        let current = self.schema_version()?;
        if current > LATEST_VERSION {
            bail!("Unsupported database schema version: {}", current);
        }

        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            let tx = self.conn.unchecked_transaction()?;
            (migration.apply)(&tx)
                .with_context(|| format!("Schema migration to v{} failed", migration.version))?;
            tx.pragma_update(None, "user_version", migration.version)?;
            tx.commit()?;
            tracing::debug!(version = migration.version, "Applied schema migration");
        }

        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64> {
        let version = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

thread_local! {
    static THREAD_DBS: RefCell<HashMap<PathBuf, Rc<Database>>> = RefCell::new(HashMap::new());
}

/// Run `f` with this thread's connection to the catalog at `path`, opening it
/// on first use. The connection lives until the thread exits.
pub fn with_thread_db<R>(path: &Path, f: impl FnOnce(&Database) -> Result<R>) -> Result<R> {
    let db = THREAD_DBS.with(|dbs| -> Result<Rc<Database>> {
        if let Some(db) = dbs.borrow().get(path) {
            return Ok(Rc::clone(db));
        }
        let db = Rc::new(Database::open(path)?);
        dbs.borrow_mut().insert(path.to_path_buf(), Rc::clone(&db));
        Ok(db)
    })?;
    f(&db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_initialize_is_idempotent() {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("catalog.db")).unwrap();

        db.initialize().unwrap();
        assert_eq!(db.schema_version().unwrap(), LATEST_VERSION);

        // A second run finds nothing to apply and leaves the schema alone.
        db.initialize().unwrap();
        assert_eq!(db.schema_version().unwrap(), LATEST_VERSION);
    }

    #[test]
    fn test_migration_steps_rerun_safely() {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("catalog.db")).unwrap();
        db.initialize().unwrap();

        for migration in MIGRATIONS {
            (migration.apply)(db.conn()).unwrap();
        }
    }

    #[test]
    fn test_rejects_future_schema() {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("catalog.db")).unwrap();
        db.conn()
            .pragma_update(None, "user_version", LATEST_VERSION + 1)
            .unwrap();

        assert!(db.initialize().is_err());
    }

    #[test]
    fn test_thread_db_reuses_connection() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.db");

        with_thread_db(&path, |db| db.initialize()).unwrap();
        let version = with_thread_db(&path, |db| db.schema_version()).unwrap();
        assert_eq!(version, LATEST_VERSION);
    }
}
