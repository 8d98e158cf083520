use rusqlite::Connection;

pub const SCHEMA_V1: &str = r#"
-- Roots: directory trees the user asked us to index
CREATE TABLE IF NOT EXISTS tracked_roots (
    id INTEGER PRIMARY KEY,
    path TEXT NOT NULL UNIQUE,
    added_at TEXT NOT NULL DEFAULT (datetime('now')),
    status TEXT NOT NULL DEFAULT 'unknown',  -- 'unknown', 'online', 'offline'
    last_seen_at TEXT,
    last_error TEXT,
    last_scan_started_at TEXT,
    last_scan_enumerated_at TEXT,
    last_scan_finished_at TEXT
);

-- Photos: one row per indexed file, owned by a root
CREATE TABLE IF NOT EXISTS photos (
    id INTEGER PRIMARY KEY,
    root_id INTEGER NOT NULL REFERENCES tracked_roots(id) ON DELETE CASCADE,
    path TEXT NOT NULL UNIQUE,
    rel_path TEXT NOT NULL,
    ext TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    mtime_ns INTEGER NOT NULL,
    width INTEGER,
    height INTEGER,
    date_taken TEXT,                         -- 'YYYY-MM-DD HH:MM:SS' UTC
    date_source TEXT NOT NULL DEFAULT 'unknown',
    indexed_at TEXT NOT NULL DEFAULT (datetime('now')),
    embedding_dim INTEGER,
    embedding_model TEXT                     -- NULL until embedded
);

CREATE INDEX IF NOT EXISTS idx_photos_root_id ON photos(root_id);
CREATE INDEX IF NOT EXISTS idx_photos_date_taken ON photos(date_taken);
"#;

pub const INDEXES_V3: &str = r#"
CREATE INDEX IF NOT EXISTS idx_photos_embedding_model ON photos(embedding_model);
CREATE INDEX IF NOT EXISTS idx_photos_mtime_ns ON photos(mtime_ns);
"#;

/// One schema step. Steps run in order for every version above the stored
/// `user_version` and must be safe to run again.
pub struct Migration {
    pub version: i64,
    pub apply: fn(&Connection) -> rusqlite::Result<()>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        apply: create_base_tables,
    },
    Migration {
        version: 2,
        apply: add_enumerated_column,
    },
    Migration {
        version: 3,
        apply: create_lookup_indexes,
    },
];

pub const LATEST_VERSION: i64 = 3;

fn create_base_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_V1)
}

// Databases created before enumeration tracking existed lack this column.
fn add_enumerated_column(conn: &Connection) -> rusqlite::Result<()> {
    if !has_column(conn, "tracked_roots", "last_scan_enumerated_at")? {
        conn.execute_batch("ALTER TABLE tracked_roots ADD COLUMN last_scan_enumerated_at TEXT;")?;
    }
    Ok(())
}

fn create_lookup_indexes(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(INDEXES_V3)
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.iter().any(|n| n == column))
}
