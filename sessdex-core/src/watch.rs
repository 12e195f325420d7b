//! Filesystem watching
//!
//! Watches every root recursively and reports changed paths in debounced
//! batches. Paths are not filtered here; the coordinator drops anything no
//! parser owns.

use crate::error::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Keeps the underlying watcher alive; dropping it stops watching.
pub struct PathWatcher {
    _debouncer: Debouncer<notify::RecommendedWatcher>,
    watched: Vec<PathBuf>,
}

impl PathWatcher {
    /// Start watching `roots`. `on_change` runs on the watcher thread with
    /// each debounced batch of paths.
    ///
    /// Roots that do not exist yet are skipped with a warning.
    pub fn start<F>(roots: &[PathBuf], debounce: Duration, on_change: F) -> Result<Self>
    where
        F: Fn(Vec<PathBuf>) + Send + 'static,
    {
        let mut debouncer = new_debouncer(debounce, move |result: DebounceEventResult| match result {
            Ok(events) => {
                let paths: BTreeSet<PathBuf> = events.into_iter().map(|e| e.path).collect();
                if !paths.is_empty() {
                    tracing::trace!(paths = paths.len(), "Filesystem change batch");
                    on_change(paths.into_iter().collect());
                }
            }
            Err(e) => tracing::warn!(error = %e, "Watch error"),
        })?;

        let mut watched = Vec::new();
        for root in roots {
            if !root.is_dir() {
                tracing::warn!(root = %root.display(), "Root missing, not watching");
                continue;
            }
            debouncer.watcher().watch(root, RecursiveMode::Recursive)?;
            watched.push(root.clone());
        }

        tracing::info!(
            roots = watched.len(),
            debounce_ms = debounce.as_millis() as u64,
            "Watching for changes"
        );

        Ok(Self {
            _debouncer: debouncer,
            watched,
        })
    }

    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }

    pub fn is_watching(&self, root: &Path) -> bool {
        self.watched.iter().any(|w| w == root)
    }
}
