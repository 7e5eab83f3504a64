//! SQLite persistence.
//!
//! Two tables survive restarts: `files` and `bookmarks`. Posting lists are
//! not materialised; the warm start rebuilds them from `files.path`, which
//! keeps the database small at the cost of a few seconds of startup work.
//!
//! All writes go through the single writer thread in [`writer`]; the rest
//! of the daemon only ever holds a [`writer::PersistHandle`].

pub mod writer;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::info;

use crate::index::types::{Bookmark, FileRecord};
use crate::index::IndexStore;

/// Data directory: `$XDG_DATA_HOME/nixnav`, falling back to
/// `~/.local/share/nixnav`.
pub fn data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("could not determine data directory")?;
    let dir = base.join("nixnav");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    Ok(dir)
}

pub fn default_db_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("index.db"))
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open_default() -> Result<Self> {
        Self::open(&default_db_path()?)
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;

            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY,
                path TEXT UNIQUE NOT NULL,
                is_dir INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                size INTEGER NOT NULL,
                bookmark_id INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS bookmarks (
                id INTEGER PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                path TEXT UNIQUE NOT NULL,
                is_network INTEGER NOT NULL,
                last_scan INTEGER
            );
        "#,
        )
        .context("failed to initialise schema")?;

        Ok(Self { conn })
    }

    /// Stream every persisted record and bookmark into the store,
    /// re-interning ids to themselves and rebuilding posting lists.
    /// Returns (files, bookmarks) loaded.
    pub fn load_into(&self, store: &mut IndexStore) -> Result<(usize, usize)> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, path, is_dir, mtime, size, bookmark_id FROM files")?;
        let rows = stmt.query_map([], |row| {
            Ok(FileRecord {
                id: row.get::<_, i64>(0)? as u64,
                path: row.get(1)?,
                is_dir: row.get::<_, i64>(2)? != 0,
                mtime: row.get(3)?,
                size: row.get::<_, i64>(4)? as u64,
                bookmark_id: row.get::<_, i64>(5)? as u64,
            })
        })?;

        let mut files = 0usize;
        for record in rows {
            store.insert_record(record?);
            files += 1;
        }

        let mut stmt = self
            .conn
            .prepare("SELECT id, name, path, is_network, last_scan FROM bookmarks")?;
        let rows = stmt.query_map([], |row| {
            Ok(Bookmark {
                id: row.get::<_, i64>(0)? as u64,
                name: row.get(1)?,
                path: row.get(2)?,
                is_network: row.get::<_, i64>(3)? != 0,
                last_scan: row.get(4)?,
            })
        })?;

        let mut bookmarks = 0usize;
        for bookmark in rows {
            store.insert_bookmark(bookmark?);
            bookmarks += 1;
        }

        info!(files, bookmarks, "loaded persisted index");
        Ok((files, bookmarks))
    }
}

/// Escape LIKE metacharacters so a path prefix matches literally.
fn like_escape(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len());
    for c in path.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
