//! Unix socket request server.
//!
//! Architecture:
//! - accept loop: owns the listener, feeds connections to the worker pool
//! - worker pool: bounded set of handler threads, one request per
//!   connection (single-shot), shared read access to the index store
//! - dispatcher: applies debounced watcher batches to the store
//!
//! Mutating handlers route every change through the persistence channel;
//! queries never touch the database.

pub mod daemon;
pub mod debouncer;
pub mod protocol;
pub mod watcher;

pub use daemon::Daemon;

use std::path::PathBuf;

const SOCKET_FILE: &str = "nixnav-daemon.sock";

/// Socket path: `$XDG_RUNTIME_DIR/nixnav-daemon.sock`, falling back to
/// `/run/user/<euid>/nixnav-daemon.sock`.
pub fn socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir).join(SOCKET_FILE);
        }
    }
    let euid = unsafe { libc::geteuid() };
    PathBuf::from(format!("/run/user/{euid}")).join(SOCKET_FILE)
}
