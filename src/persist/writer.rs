//! The persistence inbox.
//!
//! Every component that mutates the in-memory index mirrors the mutation
//! here as a [`DbOp`]. A single thread drains the queue and commits each
//! drained batch in one transaction, so write ordering is exactly send
//! ordering and no other thread ever touches the connection.
//!
//! A batch that keeps failing after retries marks the database unhealthy:
//! later mutating requests are answered with `db_error` while queries keep
//! serving from memory, and the writer discards further ops until restart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusqlite::{params, Transaction, TransactionBehavior};
use tracing::{debug, error, warn};

use crate::index::types::{Bookmark, BookmarkId, FileRecord};
use crate::persist::{like_escape, Database};

/// Maximum ops folded into one transaction.
const BATCH_LIMIT: usize = 512;

/// Retry attempts before the database is declared unhealthy.
const RETRY_ATTEMPTS: u32 = 3;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// One durable mutation.
pub enum DbOp {
    SaveFile(FileRecord),
    /// Bulk form for directory renames, where every descendant row moves.
    SaveFiles(Vec<FileRecord>),
    RemoveFile(String),
    /// Delete the path and everything beneath it.
    ClearUnder(String),
    SaveBookmark(Bookmark),
    RemoveBookmark(BookmarkId),
    SetLastScan(BookmarkId, i64),
    /// Write fence: acknowledged once everything queued before it is
    /// committed.
    Flush(SyncSender<()>),
}

/// Cloneable sender side of the persistence inbox.
#[derive(Clone)]
pub struct PersistHandle {
    tx: Sender<DbOp>,
    healthy: Arc<AtomicBool>,
}

impl PersistHandle {
    pub fn send(&self, op: DbOp) {
        if self.tx.send(op).is_err() {
            self.healthy.store(false, Ordering::Relaxed);
            warn!("persistence writer is gone; mutation dropped");
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Block until every previously queued op is committed, or the timeout
    /// elapses. Returns false on timeout or a dead writer.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = std::sync::mpsc::sync_channel(1);
        if self.tx.send(DbOp::Flush(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }
}

/// Start the writer thread. The thread exits once every handle clone is
/// dropped and the queue has drained.
pub fn spawn_writer(db: Database) -> (PersistHandle, JoinHandle<()>) {
    let (tx, rx) = channel::<DbOp>();
    let healthy = Arc::new(AtomicBool::new(true));
    let handle = PersistHandle {
        tx,
        healthy: Arc::clone(&healthy),
    };

    let thread = thread::Builder::new()
        .name("nixnav-persist".to_string())
        .spawn(move || run_writer(db, rx, healthy))
        .expect("failed to spawn persistence writer");

    (handle, thread)
}

fn run_writer(mut db: Database, rx: Receiver<DbOp>, healthy: Arc<AtomicBool>) {
    while let Ok(first) = rx.recv() {
        let mut batch = vec![first];
        while batch.len() < BATCH_LIMIT {
            match rx.try_recv() {
                Ok(op) => batch.push(op),
                Err(_) => break,
            }
        }

        let fences: Vec<SyncSender<()>> = batch
            .iter()
            .filter_map(|op| match op {
                DbOp::Flush(ack) => Some(ack.clone()),
                _ => None,
            })
            .collect();

        if healthy.load(Ordering::Relaxed) {
            commit_with_retry(&mut db, &batch, &healthy);
        } else {
            debug!(ops = batch.len(), "database unhealthy, discarding batch");
        }

        for ack in fences {
            let _ = ack.try_send(());
        }
    }
}

fn commit_with_retry(db: &mut Database, batch: &[DbOp], healthy: &AtomicBool) {
    let mut delay = RETRY_BASE_DELAY;
    for attempt in 1..=RETRY_ATTEMPTS {
        match db.apply_batch(batch) {
            Ok(()) => return,
            Err(e) if attempt < RETRY_ATTEMPTS => {
                warn!(attempt, error = %e, "persistence batch failed, retrying");
                thread::sleep(delay);
                delay *= 4;
            }
            Err(e) => {
                error!(
                    error = %e,
                    "persistence batch failed after retries, marking database unhealthy"
                );
                healthy.store(false, Ordering::Relaxed);
            }
        }
    }
}

impl Database {
    /// Apply a batch of ops in one transaction.
    pub(crate) fn apply_batch(&mut self, batch: &[DbOp]) -> rusqlite::Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        for op in batch {
            apply_op(&tx, op)?;
        }
        tx.commit()
    }
}

fn apply_op(tx: &Transaction<'_>, op: &DbOp) -> rusqlite::Result<()> {
    match op {
        DbOp::SaveFile(record) => save_file(tx, record)?,
        DbOp::SaveFiles(records) => {
            for record in records {
                save_file(tx, record)?;
            }
        }
        DbOp::RemoveFile(path) => {
            tx.execute("DELETE FROM files WHERE path = ?1", params![path])?;
        }
        DbOp::ClearUnder(path) => {
            tx.execute(
                r"DELETE FROM files WHERE path = ?1 OR path LIKE ?2 ESCAPE '\'",
                params![path, format!("{}/%", like_escape(path))],
            )?;
        }
        DbOp::SaveBookmark(bookmark) => {
            tx.execute(
                "INSERT OR REPLACE INTO bookmarks (id, name, path, is_network, last_scan)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    bookmark.id as i64,
                    bookmark.name,
                    bookmark.path,
                    bookmark.is_network as i64,
                    bookmark.last_scan,
                ],
            )?;
        }
        DbOp::RemoveBookmark(id) => {
            tx.execute("DELETE FROM bookmarks WHERE id = ?1", params![*id as i64])?;
        }
        DbOp::SetLastScan(id, epoch_secs) => {
            tx.execute(
                "UPDATE bookmarks SET last_scan = ?2 WHERE id = ?1",
                params![*id as i64, epoch_secs],
            )?;
        }
        DbOp::Flush(_) => {}
    }
    Ok(())
}

fn save_file(tx: &Transaction<'_>, record: &FileRecord) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO files (id, path, is_dir, mtime, size, bookmark_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.id as i64,
            record.path,
            record.is_dir as i64,
            record.mtime,
            record.size as i64,
            record.bookmark_id as i64,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexStore;

    fn record(id: u64, path: &str) -> FileRecord {
        FileRecord {
            id,
            path: path.to_string(),
            is_dir: false,
            mtime: 100,
            size: 7,
            bookmark_id: 1,
        }
    }

    #[test]
    fn test_writer_persists_batches() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("index.db");

        let db = Database::open(&db_path).unwrap();
        let (handle, thread) = spawn_writer(db);

        handle.send(DbOp::SaveBookmark(Bookmark {
            id: 1,
            name: "h".to_string(),
            path: "/tmp/h".to_string(),
            is_network: false,
            last_scan: None,
        }));
        handle.send(DbOp::SaveFile(record(1, "/tmp/h/a.txt")));
        handle.send(DbOp::SaveFile(record(2, "/tmp/h/b.txt")));
        handle.send(DbOp::RemoveFile("/tmp/h/a.txt".to_string()));
        handle.send(DbOp::SetLastScan(1, 99));
        assert!(handle.flush(Duration::from_secs(5)));
        assert!(handle.is_healthy());

        drop(handle);
        thread.join().unwrap();

        let db = Database::open(&db_path).unwrap();
        let mut store = IndexStore::new();
        let (files, bookmarks) = db.load_into(&mut store).unwrap();
        assert_eq!((files, bookmarks), (1, 1));
        assert!(store.lookup_path("/tmp/h/b.txt").is_some());
        assert_eq!(store.bookmark_by_name("h").unwrap().last_scan, Some(99));
    }

    #[test]
    fn test_clear_under_removes_subtree_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::open(&dir.path().join("index.db")).unwrap();
        db.apply_batch(&[
            DbOp::SaveFile(record(1, "/tmp/h")),
            DbOp::SaveFile(record(2, "/tmp/h/a.txt")),
            DbOp::SaveFile(record(3, "/tmp/hx/b.txt")),
            DbOp::ClearUnder("/tmp/h".to_string()),
        ])
        .unwrap();

        let mut store = IndexStore::new();
        let (files, _) = db.load_into(&mut store).unwrap();
        assert_eq!(files, 1);
        assert!(store.lookup_path("/tmp/hx/b.txt").is_some());
    }
}
