//! Periodic index maintenance.
//!
//! Two background sweeps keep the index honest when kernel notifications
//! fall short:
//!
//! - The **integrity reconciler** walks the whole index in bounded batches,
//!   stat-ing each recorded path. Missing paths are removed, drifted
//!   mtime/size refreshed. This catches bulk deletes and events lost under
//!   load; worst-case staleness is `index_size / batch * interval`.
//! - The **network rescanner** re-walks every `is_network` bookmark on a
//!   slow cadence, since network mounts never deliver change events.
//!   Scanner inserts are idempotent and the reconciler handles removals,
//!   so the rescan is a plain re-walk.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::index::types::FileId;
use crate::index::IndexStore;
use crate::persist::writer::{DbOp, PersistHandle};
use crate::scan::scan_directory;
use crate::utils::fsmeta::{mtime_secs, size_bytes};

/// Sleep in small steps so shutdown is honoured promptly.
/// Returns false when the shutdown flag was raised.
fn sleep_checking(duration: Duration, shutdown: &AtomicBool) -> bool {
    let step = Duration::from_millis(200);
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let nap = remaining.min(step);
        std::thread::sleep(nap);
        remaining -= nap;
    }
    !shutdown.load(Ordering::Relaxed)
}

pub fn spawn_integrity_reconciler(
    store: Arc<RwLock<IndexStore>>,
    persist: PersistHandle,
    config: DaemonConfig,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("nixnav-reconcile".to_string())
        .spawn(move || {
            let mut cursor: FileId = 0;
            while sleep_checking(config.integrity_interval(), &shutdown) {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    cursor = reconcile_batch(&store, &persist, cursor, config.integrity_batch);
                }));
                if outcome.is_err() {
                    error!("integrity reconciler cycle panicked; continuing");
                }
            }
        })
        .expect("failed to spawn integrity reconciler")
}

/// Examine one batch of records starting at `cursor`; returns the cursor
/// for the next cycle (0 once the sweep wrapped around).
fn reconcile_batch(
    store: &Arc<RwLock<IndexStore>>,
    persist: &PersistHandle,
    cursor: FileId,
    batch_size: usize,
) -> FileId {
    let (batch, next) = {
        let index = store.read().unwrap();
        index.batch_from(cursor, batch_size)
    };

    let mut removed = 0usize;
    let mut refreshed = 0usize;

    for record in batch {
        match std::fs::metadata(&record.path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let gone = {
                    let mut index = store.write().unwrap();
                    if record.is_dir {
                        index.remove_subtree(&record.path).len()
                    } else {
                        usize::from(index.remove(&record.path).is_some())
                    }
                };
                if gone > 0 {
                    persist.send(DbOp::ClearUnder(record.path.clone()));
                    removed += gone;
                }
            }
            Err(e) => {
                // Transient (permissions, IO); leave the record alone
                debug!(path = %record.path, error = %e, "stat failed during reconcile");
            }
            Ok(meta) => {
                let mtime = mtime_secs(&meta);
                let size = size_bytes(&meta);
                if mtime != record.mtime || size != record.size || meta.is_dir() != record.is_dir {
                    let updated = {
                        let mut index = store.write().unwrap();
                        let id = index.insert(
                            &record.path,
                            meta.is_dir(),
                            mtime,
                            size,
                            record.bookmark_id,
                        );
                        index.record(id).cloned()
                    };
                    if let Some(updated) = updated {
                        persist.send(DbOp::SaveFile(updated));
                        refreshed += 1;
                    }
                }
            }
        }
    }

    if removed > 0 || refreshed > 0 {
        info!(removed, refreshed, "integrity sweep applied corrections");
    }

    next.unwrap_or(0)
}

pub fn spawn_network_rescanner(
    store: Arc<RwLock<IndexStore>>,
    persist: PersistHandle,
    config: DaemonConfig,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("nixnav-netscan".to_string())
        .spawn(move || {
            while sleep_checking(config.network_scan_interval(), &shutdown) {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    rescan_network_bookmarks(&store, &persist);
                }));
                if outcome.is_err() {
                    error!("network rescanner cycle panicked; continuing");
                }
            }
        })
        .expect("failed to spawn network rescanner")
}

fn rescan_network_bookmarks(store: &Arc<RwLock<IndexStore>>, persist: &PersistHandle) {
    let targets: Vec<(u64, String)> = {
        let index = store.read().unwrap();
        index
            .bookmarks()
            .filter(|b| b.is_network)
            .map(|b| (b.id, b.path.clone()))
            .collect()
    };

    for (id, root) in targets {
        if !Path::new(&root).is_dir() {
            warn!(root = %root, "network bookmark unreachable, skipping rescan");
            continue;
        }
        info!(root = %root, "periodic rescan of network bookmark");
        scan_directory(Path::new(&root), id, store, persist);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let saved = {
            let mut index = store.write().unwrap();
            index.set_last_scan(id, now)
        };
        if let Some(bookmark) = saved {
            persist.send(DbOp::SaveBookmark(bookmark));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::writer::spawn_writer;
    use crate::persist::Database;
    use std::fs;

    #[test]
    fn test_reconcile_removes_phantom_records() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real.txt"), "x").unwrap();

        let db = Database::open(&db_dir.path().join("r.db")).unwrap();
        let (persist, thread) = spawn_writer(db);
        let store = Arc::new(RwLock::new(IndexStore::new()));
        let root_s = dir.path().to_string_lossy().into_owned();
        let bid = {
            let mut index = store.write().unwrap();
            index.add_bookmark("t", &root_s, false).unwrap()
        };

        {
            let mut index = store.write().unwrap();
            index.insert(&format!("{root_s}/real.txt"), false, 0, 1, bid);
            // Phantom records that never existed on disk
            for i in 0..10 {
                index.insert(&format!("{root_s}/ghost{i}.txt"), false, 0, 1, bid);
            }
        }
        assert_eq!(store.read().unwrap().file_count(), 11);

        // One full sweep in two batches
        let next = reconcile_batch(&store, &persist, 0, 6);
        reconcile_batch(&store, &persist, next, 6);

        let index = store.read().unwrap();
        assert_eq!(index.file_count(), 1);
        assert!(index.lookup_path(&format!("{root_s}/real.txt")).is_some());
        drop(index);

        drop(persist);
        thread.join().unwrap();
    }

    #[test]
    fn test_reconcile_refreshes_drifted_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        fs::write(&file, "contents").unwrap();

        let db = Database::open(&db_dir.path().join("r.db")).unwrap();
        let (persist, thread) = spawn_writer(db);
        let store = Arc::new(RwLock::new(IndexStore::new()));
        let root_s = dir.path().to_string_lossy().into_owned();
        let bid = {
            let mut index = store.write().unwrap();
            index.add_bookmark("t", &root_s, false).unwrap()
        };

        // Stale metadata on purpose
        let path_s = file.to_string_lossy().into_owned();
        store.write().unwrap().insert(&path_s, false, 1, 1, bid);

        reconcile_batch(&store, &persist, 0, 100);

        let index = store.read().unwrap();
        let record = index.lookup_path(&path_s).unwrap();
        assert_eq!(record.size, 8);
        assert_ne!(record.mtime, 1);
        drop(index);

        drop(persist);
        thread.join().unwrap();
    }

    #[test]
    fn test_sleep_checking_honours_shutdown() {
        let flag = AtomicBool::new(true);
        assert!(!sleep_checking(Duration::from_secs(60), &flag));
    }
}
