//! SQLite database for SafeNet state persistence
//!
//! Only non-secret state lives here: enrolled peers and policy group
//! membership. No table has a private key column.

use crate::Result;
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Shared handle to the connection; every registry mutation goes through
    /// this one lock.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self::from_connection(conn)?;
        info!("Opened database at {:?}", path);
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // Off by default in SQLite and scoped to the connection
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Enrolled peers
            CREATE TABLE IF NOT EXISTS peers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                public_key TEXT NOT NULL UNIQUE,
                address TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            );

            -- Group labels declared by the applied policy
            CREATE TABLE IF NOT EXISTS groups (
                label TEXT PRIMARY KEY
            );

            -- Device to group membership
            CREATE TABLE IF NOT EXISTS device_groups (
                device_name TEXT NOT NULL,
                group_label TEXT NOT NULL REFERENCES groups(label) ON DELETE CASCADE,
                PRIMARY KEY (device_name, group_label)
            );
            CREATE INDEX IF NOT EXISTS idx_device_groups_group ON device_groups(group_label);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }
}

/// Which constraint a failed write tripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    /// `UNIQUE constraint failed: <table>.<column>`
    Unique(String),
    ForeignKey,
    Other,
}

/// Classify a constraint violation, or `None` for any other error
pub fn constraint_violation(err: &rusqlite::Error) -> Option<Constraint> {
    match err {
        rusqlite::Error::SqliteFailure(e, msg) if e.code == ErrorCode::ConstraintViolation => {
            let msg = msg.as_deref().unwrap_or_default();
            if let Some(column) = msg.strip_prefix("UNIQUE constraint failed: ") {
                Some(Constraint::Unique(column.trim().to_string()))
            } else if msg.starts_with("FOREIGN KEY constraint failed") {
                Some(Constraint::ForeignKey)
            } else {
                Some(Constraint::Other)
            }
        }
        _ => None,
    }
}
