//! Tracked root operations.

use anyhow::Result;
use rusqlite::{OptionalExtension, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RootStatus {
    Unknown,
    Online,
    Offline,
}

impl RootStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RootStatus::Unknown => "unknown",
            RootStatus::Online => "online",
            RootStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "online" => RootStatus::Online,
            "offline" => RootStatus::Offline,
            _ => RootStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackedRoot {
    pub id: i64,
    pub path: PathBuf,
    pub status: RootStatus,
    pub added_at: String,
    pub last_seen_at: Option<String>,
    pub last_error: Option<String>,
    pub last_scan_started_at: Option<String>,
    pub last_scan_enumerated_at: Option<String>,
    pub last_scan_finished_at: Option<String>,
}

const ROOT_COLUMNS: &str = "id, path, status, added_at, last_seen_at, last_error, \
     last_scan_started_at, last_scan_enumerated_at, last_scan_finished_at";

fn root_from_row(row: &Row<'_>) -> rusqlite::Result<TrackedRoot> {
    let path: String = row.get(1)?;
    let status: String = row.get(2)?;
    Ok(TrackedRoot {
        id: row.get(0)?,
        path: PathBuf::from(path),
        status: RootStatus::parse(&status),
        added_at: row.get(3)?,
        last_seen_at: row.get(4)?,
        last_error: row.get(5)?,
        last_scan_started_at: row.get(6)?,
        last_scan_enumerated_at: row.get(7)?,
        last_scan_finished_at: row.get(8)?,
    })
}

impl Database {
    /// Track `path`, returning the existing row when it is already tracked.
    pub fn add_root(&self, path: &Path) -> Result<TrackedRoot> {
        let path_str = path.to_string_lossy();
        self.conn.execute(
            "INSERT OR IGNORE INTO tracked_roots (path) VALUES (?)",
            [path_str.as_ref()],
        )?;
        let root = self.conn.query_row(
            &format!("SELECT {} FROM tracked_roots WHERE path = ?", ROOT_COLUMNS),
            [path_str.as_ref()],
            root_from_row,
        )?;
        Ok(root)
    }

    pub fn get_root(&self, id: i64) -> Result<Option<TrackedRoot>> {
        let result = self.conn.query_row(
            &format!("SELECT {} FROM tracked_roots WHERE id = ?", ROOT_COLUMNS),
            [id],
            root_from_row,
        );
        match result {
            Ok(root) => Ok(Some(root)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn find_root_by_path(&self, path: &Path) -> Result<Option<TrackedRoot>> {
        let root = self
            .conn
            .query_row(
                &format!("SELECT {} FROM tracked_roots WHERE path = ?", ROOT_COLUMNS),
                [path.to_string_lossy().as_ref()],
                root_from_row,
            )
            .optional()?;
        Ok(root)
    }

    pub fn list_roots(&self) -> Result<Vec<TrackedRoot>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM tracked_roots ORDER BY id", ROOT_COLUMNS))?;
        let roots = stmt
            .query_map([], root_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(roots)
    }

    /// Untrack a root. Its photos go with it through the foreign key cascade.
    pub fn remove_root(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM tracked_roots WHERE id = ?", [id])?;
        Ok(changed > 0)
    }

    /// Record the start of a scan. A previous completion mark no longer
    /// describes the tree once a new walk begins.
    pub fn begin_root_scan(&self, id: i64) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE tracked_roots
            SET last_scan_started_at = datetime('now'),
                last_scan_finished_at = NULL,
                last_error = NULL
            WHERE id = ?
            "#,
            [id],
        )?;
        Ok(())
    }

    pub fn mark_root_enumerated(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE tracked_roots SET last_scan_enumerated_at = datetime('now') WHERE id = ?",
            [id],
        )?;
        Ok(())
    }

    pub fn mark_root_scan_finished(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE tracked_roots SET last_scan_finished_at = datetime('now') WHERE id = ?",
            [id],
        )?;
        Ok(())
    }

    /// Record an error without touching the status.
    pub fn set_root_error(&self, id: i64, message: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE tracked_roots SET last_error = ? WHERE id = ?",
            rusqlite::params![message, id],
        )?;
        Ok(())
    }

    pub fn set_root_offline(&self, id: i64, message: Option<&str>) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE tracked_roots
            SET status = ?, last_error = COALESCE(?, last_error)
            WHERE id = ?
            "#,
            rusqlite::params![RootStatus::Offline.as_str(), message, id],
        )?;
        Ok(())
    }

    pub fn set_root_online(&self, id: i64) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE tracked_roots
            SET status = ?, last_seen_at = datetime('now'), last_error = NULL
            WHERE id = ?
            "#,
            rusqlite::params![RootStatus::Online.as_str(), id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_db(dir: &Path) -> Database {
        let db = Database::open(&dir.join("catalog.db")).unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_add_root_is_idempotent() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());

        let first = db.add_root(Path::new("/photos/a")).unwrap();
        let second = db.add_root(Path::new("/photos/a")).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.status, RootStatus::Unknown);
        assert_eq!(db.list_roots().unwrap().len(), 1);
    }

    #[test]
    fn test_scan_lifecycle_timestamps() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let root = db.add_root(Path::new("/photos/a")).unwrap();

        db.begin_root_scan(root.id).unwrap();
        db.mark_root_enumerated(root.id).unwrap();
        db.mark_root_scan_finished(root.id).unwrap();
        let root = db.get_root(root.id).unwrap().unwrap();
        assert!(root.last_scan_started_at.is_some());
        assert!(root.last_scan_enumerated_at.is_some());
        assert!(root.last_scan_finished_at.is_some());

        // A new scan clears the previous completion mark.
        db.begin_root_scan(root.id).unwrap();
        let root = db.get_root(root.id).unwrap().unwrap();
        assert!(root.last_scan_finished_at.is_none());
    }

    #[test]
    fn test_offline_then_online() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let root = db.add_root(Path::new("/photos/a")).unwrap();

        db.set_root_offline(root.id, Some("Root path missing")).unwrap();
        let offline = db.get_root(root.id).unwrap().unwrap();
        assert_eq!(offline.status, RootStatus::Offline);
        assert_eq!(offline.last_error.as_deref(), Some("Root path missing"));

        db.set_root_online(root.id).unwrap();
        let online = db.get_root(root.id).unwrap().unwrap();
        assert_eq!(online.status, RootStatus::Online);
        assert!(online.last_error.is_none());
        assert!(online.last_seen_at.is_some());
    }

    #[test]
    fn test_remove_missing_root() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());

        assert!(!db.remove_root(42).unwrap());
        assert!(db.get_root(42).unwrap().is_none());
    }
}
