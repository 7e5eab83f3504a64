//! The authoritative in-memory index.
//!
//! Owns every [`FileRecord`], the trigram posting lists, and the bookmark
//! registry. All other components hold [`FileId`]s only and re-resolve them
//! here; the persistence layer keeps a durable copy but mutations flow one
//! way (store -> database).
//!
//! Two invariants hold at every observable checkpoint:
//! - the interner's maps are mutual inverses of the record table;
//! - a record's id sits in exactly the posting lists of its basename's
//!   trigrams.

pub mod interner;
pub mod types;

use std::collections::hash_map::Entry;
use std::collections::BTreeMap;
use std::collections::HashMap;

use anyhow::{bail, Result};
use roaring::RoaringTreemap;

use crate::index::interner::PathInterner;
use crate::index::types::{path_under, Bookmark, BookmarkId, FileId, FileRecord, Trigram};
use crate::utils::trigram::extract_trigrams;

#[derive(Debug, Default)]
pub struct IndexStore {
    interner: PathInterner,
    /// Ordered by id so the reconciler can cursor through in round-robin.
    records: BTreeMap<FileId, FileRecord>,
    /// trigram -> ascending set of FileIds whose basename contains it
    postings: HashMap<Trigram, RoaringTreemap>,
    bookmarks: BTreeMap<BookmarkId, Bookmark>,
    next_bookmark_id: BookmarkId,
    /// Bumped on every mutation; readers use it to invalidate caches.
    version: u64,
}

impl IndexStore {
    pub fn new() -> Self {
        Self {
            interner: PathInterner::new(),
            records: BTreeMap::new(),
            postings: HashMap::new(),
            bookmarks: BTreeMap::new(),
            next_bookmark_id: 1,
            version: 0,
        }
    }

    // ------------------------------------------------------------------
    // File records
    // ------------------------------------------------------------------

    /// Insert or refresh a path. Idempotent on path: re-insertion updates
    /// mtime/size/is_dir but preserves the FileId and posting lists.
    pub fn insert(
        &mut self,
        path: &str,
        is_dir: bool,
        mtime: i64,
        size: u64,
        bookmark_id: BookmarkId,
    ) -> FileId {
        self.version += 1;

        let (id, created) = self.interner.intern(path);
        if !created {
            if let Some(record) = self.records.get_mut(&id) {
                record.is_dir = is_dir;
                record.mtime = mtime;
                record.size = size;
                record.bookmark_id = bookmark_id;
            }
            return id;
        }

        let record = FileRecord {
            id,
            path: path.to_string(),
            is_dir,
            mtime,
            size,
            bookmark_id,
        };
        self.add_postings(id, record.basename());
        self.records.insert(id, record);
        id
    }

    /// Re-insert a persisted record during warm start, keeping its id.
    pub fn insert_record(&mut self, record: FileRecord) {
        self.interner.intern_with_id(&record.path, record.id);
        self.add_postings(record.id, record.basename());
        self.records.insert(record.id, record);
        self.version += 1;
    }

    /// Forget a single path. Returns the removed record, if any.
    pub fn remove(&mut self, path: &str) -> Option<FileRecord> {
        let id = self.interner.lookup(path)?;
        self.version += 1;
        self.interner.forget(id);
        let record = self.records.remove(&id)?;
        self.strip_postings(id, record.basename());
        Some(record)
    }

    /// Forget a path and everything beneath it. Returns removed records.
    pub fn remove_subtree(&mut self, path: &str) -> Vec<FileRecord> {
        let mut removed = Vec::new();
        for id in self.interner.descendants(path) {
            if let Some(record) = self.records.remove(&id) {
                self.interner.forget(id);
                self.strip_postings(id, record.basename());
                removed.push(record);
            }
        }
        if let Some(record) = self.remove(path) {
            removed.push(record);
        }
        if !removed.is_empty() {
            self.version += 1;
        }
        removed
    }

    /// Move a record, preserving its FileId. For directories every
    /// descendant path is rewritten by prefix substitution, ids intact.
    /// Returns all records whose stored path changed (for mirroring).
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Vec<FileRecord> {
        let Some(id) = self.interner.lookup(old_path) else {
            return Vec::new();
        };
        self.version += 1;

        // Rename onto an indexed path overwrites it; the target's old
        // record must go or the interner maps stop being inverses.
        if old_path != new_path && self.interner.lookup(new_path).is_some() {
            self.remove(new_path);
        }

        let mut changed = Vec::new();

        // Descendants first so the parent's rewrite never shadows them.
        let descendant_ids = self.interner.descendants(old_path);
        for desc_id in descendant_ids {
            if let Some(record) = self.records.get_mut(&desc_id) {
                let suffix = record.path[old_path.len()..].to_string();
                let rewritten = format!("{new_path}{suffix}");
                self.interner.forget(desc_id);
                self.interner.intern_with_id(&rewritten, desc_id);
                record.path = rewritten;
                changed.push(record.clone());
            }
        }

        if let Some(record) = self.records.get_mut(&id) {
            let old_base = crate::index::types::basename(old_path).to_string();
            let new_base = crate::index::types::basename(new_path).to_string();
            self.interner.forget(id);
            self.interner.intern_with_id(new_path, id);
            record.path = new_path.to_string();
            changed.push(record.clone());

            // Posting lists only move when the basename actually changed.
            if !old_base.eq_ignore_ascii_case(&new_base) {
                self.strip_postings(id, &old_base);
                self.add_postings(id, &new_base);
            }
        }

        changed
    }

    /// Refresh mtime/size after a metadata-only change.
    pub fn update_meta(&mut self, path: &str, mtime: i64, size: u64) -> Option<FileRecord> {
        let id = self.interner.lookup(path)?;
        let record = self.records.get_mut(&id)?;
        if record.mtime == mtime && record.size == size {
            return None;
        }
        self.version += 1;
        record.mtime = mtime;
        record.size = size;
        Some(record.clone())
    }

    pub fn record(&self, id: FileId) -> Option<&FileRecord> {
        self.records.get(&id)
    }

    pub fn lookup_path(&self, path: &str) -> Option<&FileRecord> {
        self.interner.lookup(path).and_then(|id| self.records.get(&id))
    }

    pub fn file_count(&self) -> usize {
        self.records.len()
    }

    /// Count of distinct trigrams with a non-empty posting list.
    pub fn trigram_count(&self) -> usize {
        self.postings.len()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn records(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.values()
    }

    /// A reconciler batch: up to `limit` records with id >= `cursor`, in id
    /// order. Returns the records and the cursor for the next batch (`None`
    /// when the sweep wrapped).
    pub fn batch_from(&self, cursor: FileId, limit: usize) -> (Vec<FileRecord>, Option<FileId>) {
        let batch: Vec<FileRecord> = self
            .records
            .range(cursor..)
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect();
        let next = batch.last().map(|r| r.id + 1).filter(|_| batch.len() == limit);
        (batch, next)
    }

    // ------------------------------------------------------------------
    // Posting lists
    // ------------------------------------------------------------------

    fn add_postings(&mut self, id: FileId, basename: &str) {
        for trigram in extract_trigrams(basename.as_bytes()) {
            self.postings.entry(trigram).or_default().insert(id);
        }
    }

    fn strip_postings(&mut self, id: FileId, basename: &str) {
        for trigram in extract_trigrams(basename.as_bytes()) {
            if let Entry::Occupied(mut entry) = self.postings.entry(trigram) {
                entry.get_mut().remove(id);
                // A list lives exactly as long as one file references it.
                if entry.get().is_empty() {
                    entry.remove();
                }
            }
        }
    }

    pub fn posting(&self, trigram: Trigram) -> Option<&RoaringTreemap> {
        self.postings.get(&trigram)
    }

    /// Intersect the posting lists of all `trigrams`, shortest first.
    /// Returns an empty set when any trigram is unknown.
    pub fn candidates(&self, trigrams: &[Trigram]) -> RoaringTreemap {
        let mut lists: Vec<&RoaringTreemap> = Vec::with_capacity(trigrams.len());
        for &t in trigrams {
            match self.postings.get(&t) {
                Some(list) => lists.push(list),
                None => return RoaringTreemap::new(),
            }
        }
        lists.sort_by_key(|l| l.len());

        let mut iter = lists.into_iter();
        let Some(first) = iter.next() else {
            return RoaringTreemap::new();
        };
        let mut acc = first.clone();
        for list in iter {
            acc &= list;
            if acc.is_empty() {
                break;
            }
        }
        acc
    }

    // ------------------------------------------------------------------
    // Bookmarks
    // ------------------------------------------------------------------

    /// Register a root. Re-adding the same path updates the label and
    /// network flag in place; a name already claimed by a different path is
    /// rejected.
    pub fn add_bookmark(&mut self, name: &str, path: &str, is_network: bool) -> Result<BookmarkId> {
        if name.is_empty() || name.contains(':') {
            bail!("bookmark name {name:?} must be non-empty and colon-free");
        }
        if !path.starts_with('/') {
            bail!("bookmark path {path:?} must be absolute");
        }

        if let Some(existing) = self.bookmarks.values().find(|b| b.name == name) {
            if existing.path != path {
                bail!("bookmark name {name:?} already refers to {}", existing.path);
            }
        }

        if let Some(existing) = self.bookmarks.values_mut().find(|b| b.path == path) {
            existing.name = name.to_string();
            existing.is_network = is_network;
            let id = existing.id;
            self.version += 1;
            return Ok(id);
        }

        let id = self.next_bookmark_id;
        self.next_bookmark_id += 1;
        self.bookmarks.insert(
            id,
            Bookmark {
                id,
                name: name.to_string(),
                path: path.to_string(),
                is_network,
                last_scan: None,
            },
        );
        self.version += 1;
        Ok(id)
    }

    /// Re-register a persisted bookmark during warm start, keeping its id.
    pub fn insert_bookmark(&mut self, bookmark: Bookmark) {
        if bookmark.id >= self.next_bookmark_id {
            self.next_bookmark_id = bookmark.id + 1;
        }
        self.bookmarks.insert(bookmark.id, bookmark);
        self.version += 1;
    }

    pub fn remove_bookmark(&mut self, name: &str) -> Option<Bookmark> {
        let id = self.bookmarks.values().find(|b| b.name == name).map(|b| b.id)?;
        self.version += 1;
        self.bookmarks.remove(&id)
    }

    pub fn bookmark(&self, id: BookmarkId) -> Option<&Bookmark> {
        self.bookmarks.get(&id)
    }

    pub fn bookmark_by_name(&self, name: &str) -> Option<&Bookmark> {
        self.bookmarks.values().find(|b| b.name == name)
    }

    pub fn bookmark_by_path(&self, path: &str) -> Option<&Bookmark> {
        self.bookmarks.values().find(|b| b.path == path)
    }

    /// The longest-prefix bookmark containing `path`, if any.
    pub fn bookmark_for_path(&self, path: &str) -> Option<&Bookmark> {
        self.bookmarks
            .values()
            .filter(|b| path_under(&b.path, path))
            .max_by_key(|b| b.path.len())
    }

    pub fn set_last_scan(&mut self, id: BookmarkId, epoch_secs: i64) -> Option<Bookmark> {
        let bookmark = self.bookmarks.get_mut(&id)?;
        bookmark.last_scan = Some(epoch_secs);
        Some(bookmark.clone())
    }

    pub fn bookmarks(&self) -> impl Iterator<Item = &Bookmark> {
        self.bookmarks.values()
    }

    pub fn bookmark_count(&self) -> usize {
        self.bookmarks.len()
    }

    /// Ids of every record whose path lies under `root`.
    pub fn ids_under(&self, root: &str) -> Vec<FileId> {
        let mut ids = self.interner.descendants(root);
        if let Some(id) = self.interner.lookup(root) {
            ids.push(id);
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::trigram::query_trigrams;

    fn store_with_bookmark() -> (IndexStore, BookmarkId) {
        let mut store = IndexStore::new();
        let id = store.add_bookmark("h", "/tmp/h", false).unwrap();
        (store, id)
    }

    /// Posting completeness + soundness for one record.
    fn assert_postings_consistent(store: &IndexStore) {
        for record in store.records() {
            for trigram in extract_trigrams(record.basename().as_bytes()) {
                let list = store.posting(trigram).expect("posting list missing");
                assert!(
                    list.contains(record.id),
                    "completeness: {} missing from {:06x}",
                    record.path,
                    trigram
                );
            }
        }
        for (&trigram, list) in &store.postings {
            assert!(!list.is_empty(), "empty posting list retained");
            for id in list.iter() {
                let record = store.record(id).expect("soundness: dangling id");
                assert!(
                    extract_trigrams(record.basename().as_bytes()).contains(&trigram),
                    "soundness: {} not in basename of {}",
                    trigram,
                    record.path
                );
            }
        }
    }

    #[test]
    fn test_insert_is_idempotent() {
        let (mut store, bid) = store_with_bookmark();
        let a = store.insert("/tmp/h/readme.md", false, 1, 10, bid);
        let b = store.insert("/tmp/h/readme.md", false, 2, 20, bid);
        assert_eq!(a, b);
        assert_eq!(store.file_count(), 1);
        let record = store.record(a).unwrap();
        assert_eq!(record.mtime, 2);
        assert_eq!(record.size, 20);
        assert_postings_consistent(&store);
    }

    #[test]
    fn test_remove_insert_law() {
        let (mut store, bid) = store_with_bookmark();
        store.insert("/tmp/h/readme.md", false, 1, 10, bid);
        store.remove("/tmp/h/readme.md");
        assert_eq!(store.file_count(), 0);
        assert_eq!(store.trigram_count(), 0);
        assert_eq!(store.lookup_path("/tmp/h/readme.md"), None);
        assert_postings_consistent(&store);
    }

    #[test]
    fn test_shared_trigrams_survive_partial_removal() {
        let (mut store, bid) = store_with_bookmark();
        let a = store.insert("/tmp/h/readme.md", false, 1, 10, bid);
        store.insert("/tmp/h/readme.txt", false, 1, 10, bid);
        store.remove("/tmp/h/readme.txt");
        // "rea", "ead", ... still reference the survivor
        let candidates = store.candidates(&query_trigrams("readme"));
        assert!(candidates.contains(a));
        assert_postings_consistent(&store);
    }

    #[test]
    fn test_rename_preserves_id() {
        let (mut store, bid) = store_with_bookmark();
        let id = store.insert("/tmp/h/foo.txt", false, 1, 10, bid);
        let changed = store.rename("/tmp/h/foo.txt", "/tmp/h/bar.txt");
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, id);
        assert_eq!(store.lookup_path("/tmp/h/bar.txt").unwrap().id, id);
        assert!(store.lookup_path("/tmp/h/foo.txt").is_none());
        // Old basename no longer matches
        assert!(store.candidates(&query_trigrams("foo")).is_empty());
        assert!(store.candidates(&query_trigrams("bar")).contains(id));
        assert_postings_consistent(&store);
    }

    #[test]
    fn test_rename_onto_existing_path_overwrites() {
        let (mut store, bid) = store_with_bookmark();
        let src = store.insert("/tmp/h/draft.txt", false, 1, 1, bid);
        store.insert("/tmp/h/final.txt", false, 1, 1, bid);

        store.rename("/tmp/h/draft.txt", "/tmp/h/final.txt");
        assert_eq!(store.file_count(), 1);
        assert_eq!(store.lookup_path("/tmp/h/final.txt").unwrap().id, src);
        assert_postings_consistent(&store);
    }

    #[test]
    fn test_rename_roundtrip_restores_record() {
        let (mut store, bid) = store_with_bookmark();
        let id = store.insert("/tmp/h/a.txt", false, 7, 9, bid);
        store.rename("/tmp/h/a.txt", "/tmp/h/b.txt");
        store.rename("/tmp/h/b.txt", "/tmp/h/a.txt");
        let record = store.lookup_path("/tmp/h/a.txt").unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.mtime, 7);
        assert_postings_consistent(&store);
    }

    #[test]
    fn test_rename_directory_rewrites_descendants() {
        let (mut store, bid) = store_with_bookmark();
        let dir = store.insert("/tmp/h/old", true, 1, 0, bid);
        let leaf = store.insert("/tmp/h/old/deep/note.md", false, 1, 5, bid);
        store.insert("/tmp/h/old/deep", true, 1, 0, bid);

        let changed = store.rename("/tmp/h/old", "/tmp/h/new");
        assert_eq!(changed.len(), 3);
        assert_eq!(store.lookup_path("/tmp/h/new").unwrap().id, dir);
        assert_eq!(store.lookup_path("/tmp/h/new/deep/note.md").unwrap().id, leaf);
        assert!(store.lookup_path("/tmp/h/old/deep/note.md").is_none());
        assert_postings_consistent(&store);
    }

    #[test]
    fn test_remove_subtree() {
        let (mut store, bid) = store_with_bookmark();
        store.insert("/tmp/h/sub", true, 1, 0, bid);
        store.insert("/tmp/h/sub/a.txt", false, 1, 1, bid);
        store.insert("/tmp/h/sub/b.txt", false, 1, 1, bid);
        let keep = store.insert("/tmp/h/subway.txt", false, 1, 1, bid);

        let removed = store.remove_subtree("/tmp/h/sub");
        assert_eq!(removed.len(), 3);
        assert_eq!(store.file_count(), 1);
        assert!(store.record(keep).is_some());
        assert_postings_consistent(&store);
    }

    #[test]
    fn test_candidates_unknown_trigram_short_circuits() {
        let (mut store, bid) = store_with_bookmark();
        store.insert("/tmp/h/readme.md", false, 1, 10, bid);
        assert!(store.candidates(&query_trigrams("zzz")).is_empty());
        assert!(store.candidates(&query_trigrams("readme-zzz")).is_empty());
    }

    #[test]
    fn test_bookmark_name_rules() {
        let mut store = IndexStore::new();
        assert!(store.add_bookmark("", "/a", false).is_err());
        assert!(store.add_bookmark("a:b", "/a", false).is_err());
        assert!(store.add_bookmark("work", "relative", false).is_err());

        store.add_bookmark("work", "/tmp/w", false).unwrap();
        // Same name, different path: rejected
        assert!(store.add_bookmark("work", "/tmp/other", false).is_err());
        // Same path: upsert
        let id = store.add_bookmark("jobs", "/tmp/w", true).unwrap();
        let bookmark = store.bookmark(id).unwrap();
        assert_eq!(bookmark.name, "jobs");
        assert!(bookmark.is_network);
        assert_eq!(store.bookmark_count(), 1);
    }

    #[test]
    fn test_bookmark_for_path_longest_prefix_wins() {
        let mut store = IndexStore::new();
        store.add_bookmark("outer", "/srv", false).unwrap();
        let inner = store.add_bookmark("inner", "/srv/data", false).unwrap();
        assert_eq!(store.bookmark_for_path("/srv/data/x").unwrap().id, inner);
        assert_eq!(store.bookmark_for_path("/srv/other").unwrap().name, "outer");
        assert!(store.bookmark_for_path("/elsewhere").is_none());
    }

    #[test]
    fn test_batch_from_wraps() {
        let (mut store, bid) = store_with_bookmark();
        for i in 0..5 {
            store.insert(&format!("/tmp/h/f{i}.txt"), false, 1, 1, bid);
        }
        let (batch, next) = store.batch_from(0, 3);
        assert_eq!(batch.len(), 3);
        let cursor = next.unwrap();
        let (batch, next) = store.batch_from(cursor, 3);
        assert_eq!(batch.len(), 2);
        assert!(next.is_none());
    }

    #[test]
    fn test_version_bumps_on_mutation() {
        let (mut store, bid) = store_with_bookmark();
        let v0 = store.version();
        store.insert("/tmp/h/a.txt", false, 1, 1, bid);
        let v1 = store.version();
        assert!(v1 > v0);
        store.remove("/tmp/h/a.txt");
        assert!(store.version() > v1);
    }
}
