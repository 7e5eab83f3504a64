use serde::{Deserialize, Serialize};

use crate::index::types::path_under;
use crate::index::IndexStore;
use crate::utils::fsmeta::extension_lower;
use crate::utils::trigram::query_trigrams;

/// Hard cap on results per query, regardless of the requested limit.
pub const MAX_RESULTS: usize = 2000;

/// Limit applied when a client does not ask for one.
pub const DEFAULT_LIMIT: usize = 500;

/// Which record kinds a search returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    All,
    Files,
    Dirs,
}

/// Scope and post-filters for one search.
#[derive(Debug, Clone)]
pub struct SearchFilter {
    /// Bookmark roots to search under; empty means every indexed record.
    pub roots: Vec<String>,
    pub mode: Mode,
    /// Lowercased extension without the dot.
    pub extension: Option<String>,
    /// Requested result limit; 0 means [`DEFAULT_LIMIT`].
    pub limit: usize,
}

impl SearchFilter {
    pub fn under(root: &str) -> Self {
        Self {
            roots: vec![root.to_string()],
            mode: Mode::All,
            extension: None,
            limit: DEFAULT_LIMIT,
        }
    }

    pub fn everywhere() -> Self {
        Self {
            roots: Vec::new(),
            mode: Mode::All,
            extension: None,
            limit: DEFAULT_LIMIT,
        }
    }
}

/// One search result, in wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: i64,
}

/// Run a substring search over the store.
///
/// Trigram intersection narrows to candidates, then every candidate is
/// verified: its lowercased basename must contain the lowercased needle as
/// a literal substring, rejecting trigram false positives. Needles shorter
/// than three bytes produce no trigrams and fall back to enumerating the
/// filtered scope, where the same verification applies.
///
/// The result order is a deterministic total order: exact basename matches
/// first, then basename-prefix matches, then the rest; ties break on path
/// length, then on the path itself.
pub fn execute(store: &IndexStore, needle: &str, filter: &SearchFilter) -> Vec<SearchHit> {
    let needle_lower = needle.to_ascii_lowercase();
    let trigrams = query_trigrams(&needle_lower);

    let candidate_ids = if trigrams.is_empty() {
        // Zero-trigram needle: enumerate the scope and let verification
        // handle one- and two-byte needles. The treemap dedupes ids when
        // requested roots nest.
        let mut ids = roaring::RoaringTreemap::new();
        if filter.roots.is_empty() {
            for record in store.records() {
                ids.insert(record.id);
            }
        } else {
            for root in &filter.roots {
                for id in store.ids_under(root) {
                    ids.insert(id);
                }
            }
        }
        ids
    } else {
        store.candidates(&trigrams)
    };

    let mut matched: Vec<(u8, &str, bool, u64, i64)> = Vec::new();
    for id in candidate_ids.iter() {
        let Some(record) = store.record(id) else {
            continue;
        };
        if !filter.roots.is_empty()
            && !filter.roots.iter().any(|root| path_under(root, &record.path))
        {
            continue;
        }
        match filter.mode {
            Mode::All => {}
            Mode::Files if record.is_dir => continue,
            Mode::Dirs if !record.is_dir => continue,
            _ => {}
        }
        if let Some(want) = &filter.extension {
            match extension_lower(&record.path) {
                Some(ext) if &ext == want => {}
                _ => continue,
            }
        }

        let base_lower = record.basename().to_ascii_lowercase();
        let rank = if needle_lower.is_empty() {
            2
        } else if base_lower == needle_lower {
            0
        } else if base_lower.starts_with(&needle_lower) {
            1
        } else if base_lower.contains(&needle_lower) {
            2
        } else {
            continue; // trigram false positive
        };

        matched.push((
            rank,
            record.path.as_str(),
            record.is_dir,
            record.size,
            record.mtime,
        ));
    }

    matched.sort_unstable_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| a.1.len().cmp(&b.1.len()))
            .then_with(|| a.1.cmp(b.1))
    });

    let cap = if filter.limit == 0 {
        DEFAULT_LIMIT
    } else {
        filter.limit.min(MAX_RESULTS)
    };
    matched.truncate(cap);

    matched
        .into_iter()
        .map(|(_, path, is_dir, size, mtime)| SearchHit {
            path: path.to_string(),
            is_dir,
            size,
            mtime,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::types::BookmarkId;

    fn fixture() -> (IndexStore, BookmarkId) {
        let mut store = IndexStore::new();
        let bid = store.add_bookmark("h", "/tmp/h", false).unwrap();
        (store, bid)
    }

    fn paths(hits: &[SearchHit]) -> Vec<&str> {
        hits.iter().map(|h| h.path.as_str()).collect()
    }

    #[test]
    fn test_empty_query_enumerates_under_root() {
        let (mut store, bid) = fixture();
        store.insert("/tmp/h/a.txt", false, 1, 1, bid);
        store.insert("/tmp/h/b.txt", false, 1, 1, bid);
        store.insert("/tmp/h/sub/c.txt", false, 1, 1, bid);
        store.insert("/elsewhere/d.txt", false, 1, 1, bid);

        let hits = execute(&store, "", &SearchFilter::under("/tmp/h"));
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.path.starts_with("/tmp/h/")));
    }

    #[test]
    fn test_false_positive_rejected() {
        let (mut store, bid) = fixture();
        store.insert("/tmp/h/readme.md", false, 1, 1, bid);
        store.insert("/tmp/h/read_me.md", false, 1, 1, bid);

        // Both share most trigrams; only readme.md contains "dme"
        let hits = execute(&store, "dme", &SearchFilter::under("/tmp/h"));
        assert_eq!(paths(&hits), vec!["/tmp/h/readme.md"]);
    }

    #[test]
    fn test_case_insensitive() {
        let (mut store, bid) = fixture();
        store.insert("/tmp/h/ReadMe.TXT", false, 1, 1, bid);

        for query in ["readme", "README", "ReadMe"] {
            let hits = execute(&store, query, &SearchFilter::under("/tmp/h"));
            assert_eq!(paths(&hits), vec!["/tmp/h/ReadMe.TXT"], "query {query}");
        }
    }

    #[test]
    fn test_extension_filter() {
        let (mut store, bid) = fixture();
        store.insert("/tmp/h/a.py", false, 1, 1, bid);
        store.insert("/tmp/h/a.md", false, 1, 1, bid);
        store.insert("/tmp/h/abc.py", false, 1, 1, bid);

        let filter = SearchFilter {
            extension: Some("py".to_string()),
            ..SearchFilter::under("/tmp/h")
        };
        let hits = execute(&store, "a", &filter);
        assert_eq!(paths(&hits), vec!["/tmp/h/a.py", "/tmp/h/abc.py"]);
    }

    #[test]
    fn test_mode_filters() {
        let (mut store, bid) = fixture();
        store.insert("/tmp/h/docs", true, 1, 0, bid);
        store.insert("/tmp/h/docs.txt", false, 1, 1, bid);

        let mut filter = SearchFilter::under("/tmp/h");
        filter.mode = Mode::Dirs;
        assert_eq!(paths(&execute(&store, "docs", &filter)), vec!["/tmp/h/docs"]);

        filter.mode = Mode::Files;
        assert_eq!(
            paths(&execute(&store, "docs", &filter)),
            vec!["/tmp/h/docs.txt"]
        );
    }

    #[test]
    fn test_ordering_exact_prefix_substring() {
        let (mut store, bid) = fixture();
        store.insert("/tmp/h/unotes.md", false, 1, 1, bid);
        store.insert("/tmp/h/notes.md.bak", false, 1, 1, bid);
        store.insert("/tmp/h/notes.md", false, 1, 1, bid);

        let hits = execute(&store, "notes.md", &SearchFilter::under("/tmp/h"));
        assert_eq!(
            paths(&hits),
            vec![
                "/tmp/h/notes.md",     // exact basename
                "/tmp/h/notes.md.bak", // prefix
                "/tmp/h/unotes.md",    // substring
            ]
        );
    }

    #[test]
    fn test_ordering_is_deterministic_on_ties() {
        let (mut store, bid) = fixture();
        store.insert("/tmp/h/bb/x.txt", false, 1, 1, bid);
        store.insert("/tmp/h/aa/x.txt", false, 1, 1, bid);

        let hits = execute(&store, "x.txt", &SearchFilter::under("/tmp/h"));
        assert_eq!(paths(&hits), vec!["/tmp/h/aa/x.txt", "/tmp/h/bb/x.txt"]);
    }

    #[test]
    fn test_short_needle_falls_back_to_enumeration() {
        let (mut store, bid) = fixture();
        store.insert("/tmp/h/ab.txt", false, 1, 1, bid);
        store.insert("/tmp/h/cd.txt", false, 1, 1, bid);

        let hits = execute(&store, "ab", &SearchFilter::under("/tmp/h"));
        assert_eq!(paths(&hits), vec!["/tmp/h/ab.txt"]);
    }

    #[test]
    fn test_limit_and_cap() {
        let (mut store, bid) = fixture();
        for i in 0..30 {
            store.insert(&format!("/tmp/h/file{i:03}.txt"), false, 1, 1, bid);
        }

        let filter = SearchFilter {
            limit: 10,
            ..SearchFilter::under("/tmp/h")
        };
        assert_eq!(execute(&store, "file", &filter).len(), 10);

        let filter = SearchFilter {
            limit: usize::MAX,
            ..SearchFilter::under("/tmp/h")
        };
        assert_eq!(execute(&store, "file", &filter).len(), 30);
    }

    #[test]
    fn test_multi_root_search() {
        let mut store = IndexStore::new();
        let w = store.add_bookmark("work", "/tmp/w", false).unwrap();
        let h = store.add_bookmark("home", "/tmp/h", false).unwrap();
        store.insert("/tmp/w/notes.md", false, 1, 1, w);
        store.insert("/tmp/h/notes.md", false, 1, 1, h);

        let filter = SearchFilter {
            roots: vec!["/tmp/w".to_string(), "/tmp/h".to_string()],
            ..SearchFilter::everywhere()
        };
        assert_eq!(execute(&store, "notes", &filter).len(), 2);

        let hits = execute(&store, "notes", &SearchFilter::under("/tmp/h"));
        assert_eq!(paths(&hits), vec!["/tmp/h/notes.md"]);
    }
}
