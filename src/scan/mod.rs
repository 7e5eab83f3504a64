//! Recursive directory scanner.
//!
//! Walks a bookmark root, skips excluded components, and pushes every
//! surviving entry into the index store with a mirrored persistence op.
//! Scans take many short write latches (one per entry) rather than one
//! long one, so queries keep flowing during a walk.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Instant;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::index::types::BookmarkId;
use crate::index::IndexStore;
use crate::persist::writer::{DbOp, PersistHandle};
use crate::utils::fsmeta::{mtime_secs, size_bytes};

/// Path components that are never indexed, wherever they appear.
pub const EXCLUDED_COMPONENTS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".cache",
    ".npm",
    ".cargo",
    "target",
    "build",
    "dist",
    ".next",
    ".nuxt",
    "Trash",
];

/// Globs applied to path components on top of the exact names.
const EXCLUDED_GLOBS: &[&str] = &[".Trash*"];

/// Compiled exclusion rules.
pub struct ExcludeRules {
    names: HashSet<&'static str>,
    globs: GlobSet,
}

impl ExcludeRules {
    fn new() -> Self {
        let mut builder = GlobSetBuilder::new();
        for pattern in EXCLUDED_GLOBS {
            builder.add(Glob::new(pattern).expect("static exclusion glob must compile"));
        }
        Self {
            names: EXCLUDED_COMPONENTS.iter().copied().collect(),
            globs: builder.build().expect("static exclusion set must compile"),
        }
    }

    /// True when a single path component is excluded.
    pub fn matches_component(&self, component: &str) -> bool {
        self.names.contains(component) || self.globs.is_match(component)
    }

    /// True when any component of `path` is excluded.
    pub fn matches_path(&self, path: &Path) -> bool {
        path.components().any(|c| {
            c.as_os_str()
                .to_str()
                .is_some_and(|s| self.matches_component(s))
        })
    }
}

/// The shared exclusion rule set (compiled once).
pub fn excludes() -> &'static ExcludeRules {
    static RULES: OnceLock<ExcludeRules> = OnceLock::new();
    RULES.get_or_init(ExcludeRules::new)
}

/// Walk `root` and index everything under it. Returns the number of
/// entries indexed.
///
/// Symbolic links are followed; walkdir's ancestor check breaks cycles.
/// Per-entry failures (permission denied, vanished file) are logged and
/// skipped, the walk continues.
pub fn scan_directory(
    root: &Path,
    bookmark_id: BookmarkId,
    store: &Arc<RwLock<IndexStore>>,
    persist: &PersistHandle,
) -> usize {
    let start = Instant::now();
    let rules = excludes();
    let mut count = 0usize;

    let walker = WalkDir::new(root).follow_links(true).into_iter().filter_entry(|entry| {
        entry
            .file_name()
            .to_str()
            .map(|name| !rules.matches_component(name))
            .unwrap_or(true)
    });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "skipping entry without metadata");
                continue;
            }
        };

        let path = entry.path().to_string_lossy().into_owned();
        let is_dir = meta.is_dir();
        let mtime = mtime_secs(&meta);
        let size = size_bytes(&meta);

        let record = {
            let mut index = store.write().unwrap();
            let id = index.insert(&path, is_dir, mtime, size, bookmark_id);
            index.record(id).cloned()
        };
        if let Some(record) = record {
            persist.send(DbOp::SaveFile(record));
            count += 1;
        }
    }

    info!(
        root = %root.display(),
        indexed = count,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "scan complete"
    );
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::writer::spawn_writer;
    use crate::persist::Database;
    use std::fs;

    fn scan_fixture(build: impl Fn(&Path)) -> (Arc<RwLock<IndexStore>>, usize) {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = tempfile::tempdir().unwrap();
        build(dir.path());

        let db = Database::open(&db_dir.path().join("scan-test.db")).unwrap();
        let (persist, thread) = spawn_writer(db);

        let store = Arc::new(RwLock::new(IndexStore::new()));
        let bid = {
            let mut index = store.write().unwrap();
            index
                .add_bookmark("t", &dir.path().to_string_lossy(), false)
                .unwrap()
        };

        let count = scan_directory(dir.path(), bid, &store, &persist);
        drop(persist);
        thread.join().unwrap();
        (store, count)
    }

    #[test]
    fn test_exclusion_rules() {
        let rules = excludes();
        assert!(rules.matches_component(".git"));
        assert!(rules.matches_component("node_modules"));
        assert!(rules.matches_component("Trash"));
        assert!(rules.matches_component(".Trash-1000"));
        assert!(!rules.matches_component("src"));
        assert!(!rules.matches_component("git"));
        assert!(!rules.matches_component("trash"));

        assert!(rules.matches_path(Path::new("/home/u/proj/.git/objects/ab")));
        assert!(!rules.matches_path(Path::new("/home/u/proj/src/main.rs")));
    }

    #[test]
    fn test_scan_indexes_tree() {
        let (store, count) = scan_fixture(|root| {
            fs::write(root.join("a.txt"), "a").unwrap();
            fs::write(root.join("b.txt"), "b").unwrap();
            fs::create_dir(root.join("sub")).unwrap();
            fs::write(root.join("sub/c.txt"), "c").unwrap();
        });

        // root dir + sub dir + three files
        assert_eq!(count, 5);
        let index = store.read().unwrap();
        assert_eq!(index.file_count(), 5);
    }

    #[test]
    fn test_scan_skips_excluded_directories() {
        let (store, _) = scan_fixture(|root| {
            fs::write(root.join("a.txt"), "a").unwrap();
            fs::create_dir(root.join(".git")).unwrap();
            for i in 0..10 {
                fs::write(root.join(".git").join(format!("obj{i}")), "x").unwrap();
            }
            fs::create_dir(root.join(".Trash-1000")).unwrap();
            fs::write(root.join(".Trash-1000/junk"), "x").unwrap();
        });

        let index = store.read().unwrap();
        assert!(index.lookup_path(&format!(
            "{}/a.txt",
            index.bookmarks().next().unwrap().path
        ))
        .is_some());
        for record in index.records() {
            assert!(!record.path.contains(".git"));
            assert!(!record.path.contains(".Trash"));
        }
    }

    #[test]
    fn test_rescan_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();

        let db = Database::open(&db_dir.path().join("scan-test.db")).unwrap();
        let (persist, thread) = spawn_writer(db);
        let store = Arc::new(RwLock::new(IndexStore::new()));
        let bid = {
            let mut index = store.write().unwrap();
            index
                .add_bookmark("t", &dir.path().to_string_lossy(), false)
                .unwrap()
        };

        scan_directory(dir.path(), bid, &store, &persist);
        let first = store.read().unwrap().file_count();
        scan_directory(dir.path(), bid, &store, &persist);
        assert_eq!(store.read().unwrap().file_count(), first);

        drop(persist);
        thread.join().unwrap();
    }
}
