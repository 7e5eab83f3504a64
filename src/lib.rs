//! # NixNav Daemon - File indexing daemon
//!
//! Long-running indexing service that answers sub-second substring queries
//! over millions of filesystem entries beneath a set of bookmarked roots.
//! Clients connect over a Unix socket, issue one newline-framed JSON request,
//! and receive a bounded result set.
//!
//! ## Architecture
//!
//! - [`index`] - In-memory trigram index: interner, posting lists, bookmarks
//! - [`query`] - Query parsing and execution against the index
//! - [`persist`] - SQLite persistence (warm start, serialized writer)
//! - [`scan`] - Recursive directory scanner with exclusion rules
//! - [`server`] - Unix socket server, protocol, filesystem watcher
//! - [`reconcile`] - Integrity sweeps and network-mount rescans
//! - [`utils`] - Trigram extraction and filesystem helpers
//!
//! ## Quick Start
//!
//! ```ignore
//! use nixnav_daemon::index::IndexStore;
//! use nixnav_daemon::query::{execute, SearchFilter};
//!
//! let mut store = IndexStore::new();
//! let bid = store.add_bookmark("home", "/home/user", false).unwrap();
//! store.insert("/home/user/readme.md", false, 0, 120, bid);
//!
//! let hits = execute(&store, "readme", &SearchFilter::under("/home/user"));
//! assert_eq!(hits[0].path, "/home/user/readme.md");
//! ```
//!
//! ## Data flow
//!
//! The scanner and watcher push mutations into the [`index::IndexStore`],
//! which mirrors them through the persistence channel. Queries read the
//! store only; the database is touched once per mutation and once at warm
//! start.

pub mod config;
pub mod index;
pub mod persist;
pub mod query;
pub mod reconcile;
pub mod scan;
pub mod server;
pub mod utils;
