//! Daemon entry point.
//!
//! Runs as a single long-lived process with no arguments: open the
//! database, warm-start the index, then serve on the Unix socket until
//! SIGTERM/SIGINT. Exit code 0 on clean shutdown, 1 on fatal
//! initialisation failure (database open, socket bind); the supervising
//! systemd user unit restarts anything else.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Instant;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nixnav_daemon::config::DaemonConfig;
use nixnav_daemon::index::IndexStore;
use nixnav_daemon::persist::writer::spawn_writer;
use nixnav_daemon::persist::Database;
use nixnav_daemon::server::{socket_path, Daemon};

static SHUTDOWN_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn handle_signal(_sig: libc::c_int) {
    if let Some(flag) = SHUTDOWN_FLAG.get() {
        flag.store(true, Ordering::Relaxed);
    }
}

fn install_signal_handlers(flag: Arc<AtomicBool>) {
    let _ = SHUTDOWN_FLAG.set(flag);
    let handler = handle_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("nixnav_daemon=info")),
        )
        .init();

    info!("nixnav daemon starting");
    let config = DaemonConfig::load();

    let db = match Database::open_default() {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "failed to open database");
            return ExitCode::FAILURE;
        }
    };

    let mut store = IndexStore::new();
    let warm_start = Instant::now();
    if let Err(e) = db.load_into(&mut store) {
        error!(error = %e, "failed to load persisted index");
        return ExitCode::FAILURE;
    }
    info!(
        files = store.file_count(),
        bookmarks = store.bookmark_count(),
        elapsed_ms = warm_start.elapsed().as_millis() as u64,
        "warm start complete"
    );

    let store = Arc::new(RwLock::new(store));
    let (persist, persist_thread) = spawn_writer(db);

    let daemon = Daemon::new(store, persist.clone(), config);
    install_signal_handlers(daemon.shutdown_flag());

    let result = daemon.run(&socket_path());

    // Close the persistence channel so the writer drains and exits
    drop(daemon);
    drop(persist);
    let _ = persist_thread.join();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "daemon failed");
            ExitCode::FAILURE
        }
    }
}
