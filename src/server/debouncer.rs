//! Event debouncer for file system events
//!
//! Accumulates events within a configurable time window and produces
//! normalized change batches. Rapid bursts (git checkouts, editors writing
//! temp files) collapse into a single batch instead of a mutation storm.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::server::watcher::{ChangeBatch, ChangeKind};

/// Debouncer that accumulates file changes within a time window
pub struct EventDebouncer {
    window: Duration,
    /// Pending non-rename changes by path
    pending: HashMap<PathBuf, ChangeKind>,
    /// Rename pairs, kept in arrival order so FileIds survive moves
    renames: Vec<(PathBuf, PathBuf)>,
    /// Time of the last event (any file)
    last_event: Option<Instant>,
}

impl EventDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            renames: Vec::new(),
            last_event: None,
        }
    }

    /// Add a create/modify/remove event, folding it into any pending state
    /// for the same path.
    pub fn add_event(&mut self, path: PathBuf, kind: ChangeKind) {
        self.last_event = Some(Instant::now());

        let folded = match (self.pending.get(&path), kind) {
            // Create + Modify = Create (content settling during creation)
            (Some(ChangeKind::Created), ChangeKind::Modified) => ChangeKind::Created,
            // Create + Remove = noop
            (Some(ChangeKind::Created), ChangeKind::Removed) => {
                self.pending.remove(&path);
                return;
            }
            // Modify + Remove = Remove
            (Some(ChangeKind::Modified), ChangeKind::Removed) => ChangeKind::Removed,
            // Remove + Create = Modify (file was replaced in place)
            (Some(ChangeKind::Removed), ChangeKind::Created) => ChangeKind::Modified,
            (Some(ChangeKind::Removed), ChangeKind::Modified) => ChangeKind::Modified,
            _ => kind,
        };
        self.pending.insert(path, folded);
    }

    /// Record a rename pair. Pairs bypass per-path folding; the index
    /// applies them first so the moved record keeps its id.
    pub fn add_rename(&mut self, from: PathBuf, to: PathBuf) {
        self.last_event = Some(Instant::now());
        self.renames.push((from, to));
    }

    /// Check if the debounce window has elapsed since the last event
    pub fn is_ready(&self) -> bool {
        self.last_event
            .is_some_and(|last| last.elapsed() >= self.window)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.renames.is_empty()
    }

    /// Flush all pending changes into a batch. Returns None when nothing is
    /// pending.
    pub fn flush(&mut self) -> Option<ChangeBatch> {
        if !self.has_pending() {
            return None;
        }

        let mut batch = ChangeBatch::new();
        batch.renamed = std::mem::take(&mut self.renames);
        for (path, kind) in self.pending.drain() {
            batch.push(path, kind);
        }
        self.last_event = None;

        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}
