//! File system watcher for live index updates.
//!
//! One watcher thread per local bookmark. Kernel events are debounced into
//! [`ChangeBatch`]es and handed to the daemon's dispatcher, which applies
//! them to the index store and mirrors them to persistence. Network
//! bookmarks never get a watcher; the periodic rescanner covers them.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::debug;

use crate::index::types::BookmarkId;
use crate::index::IndexStore;
use crate::persist::writer::{DbOp, PersistHandle};
use crate::scan::{excludes, scan_directory};
use crate::server::debouncer::EventDebouncer;
use crate::utils::fsmeta::{mtime_secs, size_bytes};

/// Kind of file change detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    /// Metadata change; content modifications look the same to the index.
    Modified,
    Removed,
}

/// Accumulated batch of changes ready for processing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    pub created: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    /// (from, to) pairs; applied before the other lists so moved records
    /// keep their FileId.
    pub renamed: Vec<(PathBuf, PathBuf)>,
}

impl ChangeBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: PathBuf, kind: ChangeKind) {
        let list = match kind {
            ChangeKind::Created => &mut self.created,
            ChangeKind::Modified => &mut self.modified,
            ChangeKind::Removed => &mut self.removed,
        };
        if !list.contains(&path) {
            list.push(path);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.modified.is_empty()
            && self.removed.is_empty()
            && self.renamed.is_empty()
    }

    pub fn total_changes(&self) -> usize {
        self.created.len() + self.modified.len() + self.removed.len() + self.renamed.len()
    }
}

/// Messages sent from watcher threads to the daemon dispatcher
#[derive(Debug)]
pub enum WatcherMessage {
    Changes {
        bookmark_id: BookmarkId,
        batch: ChangeBatch,
    },
    Error {
        root: PathBuf,
        message: String,
    },
}

/// Handle to a running watcher thread
pub struct WatcherHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    pub root: PathBuf,
}

impl WatcherHandle {
    /// Signal the watcher to stop and wait for it
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn a watcher thread for one bookmark root.
pub fn spawn_watcher(
    root: PathBuf,
    bookmark_id: BookmarkId,
    debounce: Duration,
    tx: Sender<WatcherMessage>,
) -> WatcherHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let thread_root = root.clone();

    let thread = std::thread::Builder::new()
        .name(format!("nixnav-watch-{bookmark_id}"))
        .spawn(move || {
            if let Err(e) =
                run_watcher_thread(&thread_root, bookmark_id, debounce, &tx, &shutdown_flag)
            {
                let _ = tx.send(WatcherMessage::Error {
                    root: thread_root,
                    message: e.to_string(),
                });
            }
        })
        .expect("failed to spawn watcher thread");

    WatcherHandle {
        shutdown,
        thread: Some(thread),
        root,
    }
}

fn run_watcher_thread(
    root: &Path,
    bookmark_id: BookmarkId,
    debounce: Duration,
    tx: &Sender<WatcherMessage>,
    shutdown: &AtomicBool,
) -> notify::Result<()> {
    let (event_tx, event_rx) = mpsc::channel();

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = event_tx.send(event);
            }
        },
        notify::Config::default(),
    )?;
    watcher.watch(root, RecursiveMode::Recursive)?;

    debug!(root = %root.display(), "watching for changes");

    let mut debouncer = EventDebouncer::new(debounce);
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        match event_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => ingest_event(&mut debouncer, event),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if debouncer.has_pending() && debouncer.is_ready() {
            if let Some(batch) = debouncer.flush() {
                let _ = tx.send(WatcherMessage::Changes { bookmark_id, batch });
            }
        }
    }

    Ok(())
}

/// Translate one kernel event into debouncer entries, applying exclusions.
fn ingest_event(debouncer: &mut EventDebouncer, event: notify::Event) {
    let rules = excludes();

    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let mut paths = event.paths;
            let to = paths.pop().unwrap();
            let from = paths.pop().unwrap();
            match (rules.matches_path(&from), rules.matches_path(&to)) {
                // Moved into an excluded directory: it just disappears
                (false, true) => debouncer.add_event(from, ChangeKind::Removed),
                // Moved out of one: it just appears
                (true, false) => debouncer.add_event(to, ChangeKind::Created),
                (false, false) => debouncer.add_rename(from, to),
                (true, true) => {}
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in event.paths {
                if !rules.matches_path(&path) {
                    debouncer.add_event(path, ChangeKind::Removed);
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) | EventKind::Create(_) => {
            for path in event.paths {
                if !rules.matches_path(&path) {
                    debouncer.add_event(path, ChangeKind::Created);
                }
            }
        }
        EventKind::Modify(_) => {
            for path in event.paths {
                if !rules.matches_path(&path) {
                    debouncer.add_event(path, ChangeKind::Modified);
                }
            }
        }
        EventKind::Remove(_) => {
            for path in event.paths {
                if !rules.matches_path(&path) {
                    debouncer.add_event(path, ChangeKind::Removed);
                }
            }
        }
        _ => {}
    }
}

/// Apply a debounced batch to the store, mirroring every mutation to the
/// persistence channel. Each logical op takes its own short write latch so
/// queries are not starved during bursts.
pub fn apply_batch(
    store: &Arc<RwLock<IndexStore>>,
    persist: &PersistHandle,
    bookmark_id: BookmarkId,
    batch: ChangeBatch,
) {
    // Renames first: a fresh create event for the new name arriving in the
    // same batch is then a harmless reinsertion.
    for (from, to) in batch.renamed {
        apply_rename(store, persist, bookmark_id, &from, &to);
    }
    for path in batch.created {
        apply_upsert(store, persist, bookmark_id, &path, true);
    }
    for path in batch.modified {
        apply_upsert(store, persist, bookmark_id, &path, false);
    }
    for path in batch.removed {
        apply_remove(store, persist, &path);
    }
}

fn apply_rename(
    store: &Arc<RwLock<IndexStore>>,
    persist: &PersistHandle,
    bookmark_id: BookmarkId,
    from: &Path,
    to: &Path,
) {
    let from_s = from.to_string_lossy();
    let to_s = to.to_string_lossy();

    let known = {
        let index = store.read().unwrap();
        index.lookup_path(&from_s).is_some()
    };
    if !known {
        // The old name was never indexed (e.g. event arrived before the
        // parent scan); treat as a plain create.
        apply_upsert(store, persist, bookmark_id, to, true);
        return;
    }

    let changed = {
        let mut index = store.write().unwrap();
        index.rename(&from_s, &to_s)
    };
    if !changed.is_empty() {
        debug!(from = %from.display(), to = %to.display(), records = changed.len(), "renamed");
        persist.send(DbOp::SaveFiles(changed));
    }
}

fn apply_upsert(
    store: &Arc<RwLock<IndexStore>>,
    persist: &PersistHandle,
    fallback_bookmark: BookmarkId,
    path: &Path,
    recurse_dirs: bool,
) {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        // Vanished between event and handling; a remove event follows.
        Err(_) => return,
    };

    let path_s = path.to_string_lossy().into_owned();
    let is_dir = meta.is_dir();
    let mtime = mtime_secs(&meta);
    let size = size_bytes(&meta);

    let record = {
        let mut index = store.write().unwrap();
        let bookmark_id = index
            .bookmark_for_path(&path_s)
            .map(|b| b.id)
            .unwrap_or(fallback_bookmark);
        let id = index.insert(&path_s, is_dir, mtime, size, bookmark_id);
        index.record(id).cloned()
    };
    if let Some(record) = record {
        debug!(path = %path.display(), "indexed");
        let bookmark_id = record.bookmark_id;
        persist.send(DbOp::SaveFile(record));

        // A directory appearing in one event may carry a whole moved-in
        // subtree; sweep it with a small sub-scan.
        if is_dir && recurse_dirs {
            scan_directory(path, bookmark_id, store, persist);
        }
    }
}

fn apply_remove(store: &Arc<RwLock<IndexStore>>, persist: &PersistHandle, path: &Path) {
    let path_s = path.to_string_lossy();
    let removed = {
        let mut index = store.write().unwrap();
        index.remove_subtree(&path_s)
    };
    if !removed.is_empty() {
        debug!(path = %path.display(), records = removed.len(), "removed");
        persist.send(DbOp::ClearUnder(path_s.into_owned()));
    }
}
