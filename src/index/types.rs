use serde::{Deserialize, Serialize};

/// Stable identifier for an indexed path. Monotonically assigned, never
/// reused within an index lifetime, persisted as the files-table primary key.
pub type FileId = u64;

/// Identifier for a bookmarked root.
pub type BookmarkId = u64;

/// A trigram is a 3-byte sequence stored as u32 (only lower 24 bits used)
pub type Trigram = u32;

/// Pack three bytes into a trigram value
#[inline]
pub fn bytes_to_trigram(a: u8, b: u8, c: u8) -> Trigram {
    ((a as u32) << 16) | ((b as u32) << 8) | (c as u32)
}

/// Unpack a trigram back into its three bytes
#[inline]
pub fn trigram_to_bytes(t: Trigram) -> [u8; 3] {
    [(t >> 16) as u8, (t >> 8) as u8, t as u8]
}

/// Metadata for one indexed path.
///
/// `path` is canonical: absolute, no trailing slash except for `/`, no `.`
/// or `..` components. The basename of `path` is the only part that
/// contributes trigrams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub path: String,
    pub is_dir: bool,
    /// Seconds since the Unix epoch.
    pub mtime: i64,
    /// Zero for directories.
    pub size: u64,
    /// The longest-prefix bookmark this path lives under.
    pub bookmark_id: BookmarkId,
}

impl FileRecord {
    /// Final path component, the string trigrams are extracted from.
    pub fn basename(&self) -> &str {
        basename(&self.path)
    }
}

/// A registered root. Paths and names are unique across the registry;
/// the name doubles as a query prefix (`name:query`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: BookmarkId,
    pub name: String,
    pub path: String,
    /// Network roots get no watcher; they are periodically rescanned instead.
    pub is_network: bool,
    /// Seconds since epoch of the last completed scan.
    pub last_scan: Option<i64>,
}

/// Final component of a canonical path. `/` is its own basename.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) if idx + 1 < path.len() => &path[idx + 1..],
        Some(_) => path,
        None => path,
    }
}

/// True if `path` equals `root` or lives beneath it.
///
/// Component-aware: `/tmp/h` does not contain `/tmp/hx`.
pub fn path_under(root: &str, path: &str) -> bool {
    if root == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(root) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
