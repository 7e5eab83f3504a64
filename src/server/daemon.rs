//! The request server.
//!
//! Accepts connections on a local stream socket and answers one framed
//! request per connection. Query handlers share read access to the index
//! store; mutating handlers (RESCAN, ADD_BOOKMARK, REMOVE_BOOKMARK) take
//! short write latches and mirror every change through the persistence
//! channel.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, BufWriter};
use std::num::NonZeroUsize;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use lru::LruCache;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::index::types::BookmarkId;
use crate::index::IndexStore;
use crate::persist::writer::{DbOp, PersistHandle};
use crate::query::executor::{execute, SearchFilter};
use crate::query::parser::parse_query;
use crate::query::Mode;
use crate::scan::scan_directory;
use crate::server::protocol::{
    parse_request, pong, removed_ok, scan_ok, write_frame, ErrorResponse, PongResponse,
    RemovedResponse, Request, RequestError, ScanResponse, SearchAllRequest, SearchRequest,
    SearchResponse, StatsResponse,
};
use crate::server::watcher::{apply_batch, spawn_watcher, WatcherHandle, WatcherMessage};
use crate::utils::fsmeta::is_network_mount;

/// Poll interval for the non-blocking accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// One successful reply; shapes follow the protocol table.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum Reply {
    Pong(PongResponse),
    Stats(StatsResponse),
    Search(SearchResponse),
    Scan(ScanResponse),
    Removed(RemovedResponse),
}

/// A cached search reply, valid for one store version.
struct CachedSearch {
    version: u64,
    response: SearchResponse,
}

pub struct Daemon {
    store: Arc<RwLock<IndexStore>>,
    persist: PersistHandle,
    config: DaemonConfig,
    /// Search responses keyed by the raw request line, invalidated by the
    /// store version counter.
    query_cache: Mutex<LruCache<String, CachedSearch>>,
    /// Roots currently being walked; at most one scan per root.
    scans_in_flight: Mutex<HashSet<String>>,
    watchers: Mutex<HashMap<BookmarkId, WatcherHandle>>,
    watcher_tx: Sender<WatcherMessage>,
    watcher_rx: Mutex<Option<Receiver<WatcherMessage>>>,
    shutdown: Arc<AtomicBool>,
}

impl Daemon {
    pub fn new(
        store: Arc<RwLock<IndexStore>>,
        persist: PersistHandle,
        config: DaemonConfig,
    ) -> Arc<Self> {
        let (watcher_tx, watcher_rx) = mpsc::channel();
        let cache_size = NonZeroUsize::new(config.query_cache_size.max(1)).unwrap();
        Arc::new(Self {
            store,
            persist,
            config,
            query_cache: Mutex::new(LruCache::new(cache_size)),
            scans_in_flight: Mutex::new(HashSet::new()),
            watchers: Mutex::new(HashMap::new()),
            watcher_tx,
            watcher_rx: Mutex::new(Some(watcher_rx)),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag checked by every long-lived loop; raising it drains and stops
    /// the daemon.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Bind the socket and serve until shutdown. Blocks the caller.
    pub fn run(self: &Arc<Self>, socket_path: &Path) -> Result<()> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        // A stale socket from a crashed daemon would block the bind
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .with_context(|| format!("failed to unlink stale socket {}", socket_path.display()))?;
        }

        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
            .context("failed to set socket permissions")?;
        listener
            .set_nonblocking(true)
            .context("failed to make listener non-blocking")?;

        info!(socket = %socket_path.display(), "listening");

        // Background maintenance starts only now, with the store loaded
        let dispatcher = self.spawn_dispatcher();
        let reconciler = crate::reconcile::spawn_integrity_reconciler(
            Arc::clone(&self.store),
            self.persist.clone(),
            self.config.clone(),
            self.shutdown_flag(),
        );
        let rescanner = crate::reconcile::spawn_network_rescanner(
            Arc::clone(&self.store),
            self.persist.clone(),
            self.config.clone(),
            self.shutdown_flag(),
        );
        self.start_watchers_for_local_bookmarks();

        // Bounded handler pool; the channel depth caps open sockets
        let (conn_tx, conn_rx) = mpsc::sync_channel::<UnixStream>(self.config.pool_size);
        let conn_rx = Arc::new(Mutex::new(conn_rx));
        let mut workers = Vec::with_capacity(self.config.pool_size);
        for i in 0..self.config.pool_size {
            let daemon = Arc::clone(self);
            let rx = Arc::clone(&conn_rx);
            workers.push(
                thread::Builder::new()
                    .name(format!("nixnav-worker-{i}"))
                    .spawn(move || daemon.run_worker(&rx))
                    .expect("failed to spawn worker"),
            );
        }

        self.accept_loop(&listener, conn_tx);

        // Shutdown: stop intake, drain background work, release the socket
        for worker in workers {
            let _ = worker.join();
        }
        self.stop_all_watchers();
        let _ = dispatcher.join();
        let _ = reconciler.join();
        let _ = rescanner.join();
        if !self.persist.flush(Duration::from_secs(10)) {
            warn!("persistence queue did not drain before shutdown");
        }
        let _ = std::fs::remove_file(socket_path);
        info!("daemon stopped");
        Ok(())
    }

    fn accept_loop(&self, listener: &UnixListener, conn_tx: SyncSender<UnixStream>) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match listener.accept() {
                Ok((stream, _addr)) => {
                    if stream.set_nonblocking(false).is_err() {
                        continue;
                    }
                    if conn_tx.send(stream).is_err() {
                        break; // workers gone
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        // Dropping conn_tx lets the workers drain and exit
    }

    fn run_worker(self: &Arc<Self>, rx: &Arc<Mutex<Receiver<UnixStream>>>) {
        loop {
            let stream = {
                let guard = rx.lock().unwrap();
                guard.recv()
            };
            match stream {
                Ok(stream) => {
                    if let Err(e) = self.handle_connection(stream) {
                        debug!(error = %e, "connection error");
                    }
                }
                Err(_) => break, // accept loop closed the channel
            }
        }
    }

    /// Serve exactly one request, then close.
    fn handle_connection(&self, stream: UnixStream) -> std::io::Result<()> {
        stream.set_read_timeout(Some(self.config.read_timeout()))?;
        stream.set_write_timeout(Some(self.config.read_timeout()))?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream);

        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => return Ok(()), // client went away
            Ok(_) => {}
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                let err = RequestError::timeout("read deadline exceeded");
                return write_frame(&mut writer, &ErrorResponse::from(&err));
            }
            Err(e) => return Err(e),
        }

        let started = Instant::now();
        let outcome = match parse_request(&line) {
            Ok(request) => {
                let deadline = self.deadline_for(&request);
                let result = self.handle_request(request);
                // Queued mutations still complete; only the reply is
                // replaced when the handler blew its deadline.
                if started.elapsed() > deadline {
                    Err(RequestError::timeout(format!(
                        "handler exceeded {}s deadline",
                        deadline.as_secs()
                    )))
                } else {
                    result
                }
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(reply) => write_frame(&mut writer, &reply),
            Err(e) => write_frame(&mut writer, &ErrorResponse::from(&e)),
        }
    }

    fn deadline_for(&self, request: &Request) -> Duration {
        match request {
            Request::Rescan(_) | Request::AddBookmark(_) | Request::RemoveBookmark(_) => {
                self.config.scan_deadline()
            }
            _ => self.config.handler_deadline(),
        }
    }

    fn handle_request(&self, request: Request) -> Result<Reply, RequestError> {
        match request {
            Request::Ping => Ok(Reply::Pong(pong())),
            Request::Stats => {
                let index = self.store.read().unwrap();
                Ok(Reply::Stats(StatsResponse {
                    files: index.file_count(),
                    trigrams: index.trigram_count(),
                    bookmarks: index.bookmark_count(),
                }))
            }
            Request::Search(req) => self.handle_search(req).map(Reply::Search),
            Request::SearchAll(req) => self.handle_search_all(req).map(Reply::Search),
            Request::Rescan(path) => self.handle_rescan(&path).map(Reply::Scan),
            Request::AddBookmark(req) => self.handle_add_bookmark(req).map(Reply::Scan),
            Request::RemoveBookmark(req) => {
                self.handle_remove_bookmark(&req.name).map(Reply::Removed)
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn handle_search(&self, req: SearchRequest) -> Result<SearchResponse, RequestError> {
        let cache_key = format!(
            "S|{}|{:?}|{}|{}|{}",
            req.bookmark_path,
            req.mode,
            req.query,
            req.extension.as_deref().unwrap_or(""),
            req.limit
        );
        let bookmark_path = req.bookmark_path;
        self.run_search(
            cache_key,
            req.query,
            req.mode,
            req.extension,
            req.limit,
            move |_, parsed_root| {
                let root = parsed_root.unwrap_or(bookmark_path);
                if root.is_empty() {
                    Vec::new()
                } else {
                    vec![root]
                }
            },
        )
    }

    fn handle_search_all(&self, req: SearchAllRequest) -> Result<SearchResponse, RequestError> {
        let cache_key = format!(
            "A|{}|{}|{}|{}",
            req.bookmark_paths.join(","),
            req.query,
            req.extension.as_deref().unwrap_or(""),
            req.limit
        );
        let requested = req.bookmark_paths;
        self.run_search(
            cache_key,
            req.query,
            Mode::All,
            req.extension,
            req.limit,
            move |index, parsed_root| {
                if let Some(root) = parsed_root {
                    // A name prefix narrows the whole request to that bookmark
                    vec![root]
                } else if requested.is_empty() {
                    // Original behaviour: empty list means every bookmark
                    index.bookmarks().map(|b| b.path.clone()).collect()
                } else {
                    requested
                }
            },
        )
    }

    /// Shared search path: cache lookup, query parse, execute, cache fill.
    fn run_search(
        &self,
        cache_key: String,
        raw_query: String,
        mode: Mode,
        extension: Option<String>,
        limit: usize,
        roots: impl FnOnce(&IndexStore, Option<String>) -> Vec<String>,
    ) -> Result<SearchResponse, RequestError> {
        let started = Instant::now();

        let index = self.store.read().unwrap();
        let version = index.version();

        if let Some(hit) = self.cache_get(&cache_key, version) {
            debug!(key = %cache_key, "query cache hit");
            return Ok(hit);
        }

        let parsed = parse_query(&raw_query, |name| {
            index.bookmark_by_name(name).map(|b| b.path.clone())
        });

        let filter = SearchFilter {
            roots: roots(&index, parsed.bookmark_path),
            mode,
            // An explicit request field wins over query-embedded syntax
            extension: extension
                .map(|e| e.to_ascii_lowercase())
                .or(parsed.extension),
            limit,
        };

        let results = execute(&index, &parsed.needle, &filter);
        let response = SearchResponse {
            results,
            total_indexed: index.file_count(),
            search_time_ms: started.elapsed().as_millis() as u64,
        };
        drop(index);

        self.cache_put(cache_key, version, &response);
        Ok(response)
    }

    fn cache_get(&self, key: &str, version: u64) -> Option<SearchResponse> {
        let mut cache = self.query_cache.lock().unwrap();
        match cache.get(key) {
            Some(cached) if cached.version == version => Some(cached.response.clone()),
            _ => None,
        }
    }

    fn cache_put(&self, key: String, version: u64, response: &SearchResponse) {
        let mut cache = self.query_cache.lock().unwrap();
        cache.put(
            key,
            CachedSearch {
                version,
                response: response.clone(),
            },
        );
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    fn require_healthy_db(&self) -> Result<(), RequestError> {
        if self.persist.is_healthy() {
            Ok(())
        } else {
            Err(RequestError::db_error(
                "persistence writer is unhealthy; mutations are refused",
            ))
        }
    }

    fn handle_rescan(&self, path: &str) -> Result<ScanResponse, RequestError> {
        self.require_healthy_db()?;

        let root = Path::new(path);
        if !root.is_absolute() {
            return Err(RequestError::bad_argument("RESCAN path must be absolute"));
        }
        if !root.is_dir() {
            return Err(RequestError::io_error(format!(
                "{path} is not a readable directory"
            )));
        }

        let bookmark_id = {
            let index = self.store.read().unwrap();
            index
                .bookmark_for_path(path)
                .map(|b| b.id)
                .ok_or_else(|| {
                    RequestError::bad_argument(format!("{path} is not under any bookmark"))
                })?
        };

        let _guard = self.begin_scan(path)?;

        // Two-phase rescan: drop the subtree, then re-walk it
        {
            let mut index = self.store.write().unwrap();
            index.remove_subtree(path);
        }
        self.persist.send(DbOp::ClearUnder(path.to_string()));

        let indexed = scan_directory(root, bookmark_id, &self.store, &self.persist);
        Ok(scan_ok(indexed))
    }

    fn handle_add_bookmark(
        &self,
        req: crate::server::protocol::AddBookmarkRequest,
    ) -> Result<ScanResponse, RequestError> {
        self.require_healthy_db()?;

        let root = PathBuf::from(&req.path);
        if !root.is_absolute() {
            return Err(RequestError::bad_argument("bookmark path must be absolute"));
        }
        if !root.is_dir() {
            return Err(RequestError::io_error(format!(
                "{} is not a readable directory",
                req.path
            )));
        }

        let bookmark = {
            let mut index = self.store.write().unwrap();
            let id = index
                .add_bookmark(&req.name, &req.path, req.is_network)
                .map_err(|e| RequestError::bad_argument(e.to_string()))?;
            index.bookmark(id).cloned().expect("bookmark just added")
        };
        self.persist.send(DbOp::SaveBookmark(bookmark.clone()));

        let _guard = self.begin_scan(&req.path)?;
        let indexed = scan_directory(&root, bookmark.id, &self.store, &self.persist);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let saved = {
            let mut index = self.store.write().unwrap();
            index.set_last_scan(bookmark.id, now)
        };
        if let Some(saved) = saved {
            self.persist.send(DbOp::SaveBookmark(saved));
        }

        // Watcher only for genuinely local roots; the rescanner owns the rest
        if !bookmark.is_network && !is_network_mount(&root) {
            self.start_watcher(bookmark.id, root);
        } else if !bookmark.is_network {
            info!(path = %req.path, "bookmark sits on a network mount, relying on rescans");
        }

        Ok(scan_ok(indexed))
    }

    fn handle_remove_bookmark(&self, name: &str) -> Result<RemovedResponse, RequestError> {
        self.require_healthy_db()?;

        let (bookmark, removed) = {
            let mut index = self.store.write().unwrap();
            let bookmark = index
                .remove_bookmark(name)
                .ok_or_else(|| RequestError::bad_argument(format!("unknown bookmark {name:?}")))?;
            let removed = index.remove_subtree(&bookmark.path);
            (bookmark, removed)
        };

        if let Some(mut handle) = self.watchers.lock().unwrap().remove(&bookmark.id) {
            handle.stop();
        }
        self.persist.send(DbOp::ClearUnder(bookmark.path.clone()));
        self.persist.send(DbOp::RemoveBookmark(bookmark.id));

        info!(name, path = %bookmark.path, records = removed.len(), "bookmark removed");
        Ok(removed_ok(removed.len()))
    }

    /// Claim the per-root scan slot; released when the guard drops.
    fn begin_scan(&self, path: &str) -> Result<ScanGuard<'_>, RequestError> {
        let mut scans = self.scans_in_flight.lock().unwrap();
        if !scans.insert(path.to_string()) {
            return Err(RequestError::new(
                crate::server::protocol::ErrorKind::Internal,
                format!("a scan of {path} is already in progress"),
            ));
        }
        Ok(ScanGuard { daemon: self, path: path.to_string() })
    }

    // ------------------------------------------------------------------
    // Watchers
    // ------------------------------------------------------------------

    fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let daemon = Arc::clone(self);
        let rx = self
            .watcher_rx
            .lock()
            .unwrap()
            .take()
            .expect("dispatcher already started");

        thread::Builder::new()
            .name("nixnav-dispatch".to_string())
            .spawn(move || loop {
                if daemon.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(WatcherMessage::Changes { bookmark_id, batch }) => {
                        debug!(bookmark_id, changes = batch.total_changes(), "applying batch");
                        apply_batch(&daemon.store, &daemon.persist, bookmark_id, batch);
                    }
                    Ok(WatcherMessage::Error { root, message: why }) => {
                        error!(root = %root.display(), error = %why, "watcher failed");
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            })
            .expect("failed to spawn dispatcher")
    }

    fn start_watchers_for_local_bookmarks(&self) {
        let locals: Vec<(BookmarkId, String)> = {
            let index = self.store.read().unwrap();
            index
                .bookmarks()
                .filter(|b| !b.is_network)
                .map(|b| (b.id, b.path.clone()))
                .collect()
        };
        for (id, path) in locals {
            let root = PathBuf::from(&path);
            if !root.is_dir() {
                warn!(path = %path, "bookmark root missing, skipping watcher");
                continue;
            }
            if is_network_mount(&root) {
                info!(path = %path, "bookmark sits on a network mount, relying on rescans");
                continue;
            }
            self.start_watcher(id, root);
        }
    }

    fn start_watcher(&self, bookmark_id: BookmarkId, root: PathBuf) {
        let mut watchers = self.watchers.lock().unwrap();
        if watchers.get(&bookmark_id).is_some_and(|h| h.is_running()) {
            return;
        }
        info!(root = %root.display(), "starting watcher");
        let handle = spawn_watcher(
            root,
            bookmark_id,
            self.config.debounce_duration(),
            self.watcher_tx.clone(),
        );
        watchers.insert(bookmark_id, handle);
    }

    fn stop_all_watchers(&self) {
        let mut watchers = self.watchers.lock().unwrap();
        for (_, mut handle) in watchers.drain() {
            handle.stop();
        }
    }
}

/// Releases the per-root scan slot on drop.
struct ScanGuard<'a> {
    daemon: &'a Daemon,
    path: String,
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.daemon
            .scans_in_flight
            .lock()
            .unwrap()
            .remove(&self.path);
    }
}
