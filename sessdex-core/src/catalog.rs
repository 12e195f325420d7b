//! File catalog
//!
//! Walks the configured roots and yields one [`FileStat`] per candidate log
//! file. Only metadata is read; file contents are never opened here.
//!
//! Enumeration is lazy: each glob pattern is expanded only when the previous
//! one is exhausted, so a consumer can stop early and start again later.
//! Entries that vanish or cannot be read between listing and `stat` are
//! skipped and counted, never fatal.

use crate::types::{FileStat, Fingerprint};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// A root directory and the glob patterns (relative to it) that select its
/// log files.
#[derive(Debug, Clone)]
pub struct CatalogRoot {
    pub path: PathBuf,
    pub patterns: Vec<String>,
}

/// Enumerates log files under a set of roots.
#[derive(Debug, Clone, Default)]
pub struct FileCatalog {
    roots: Vec<CatalogRoot>,
}

impl FileCatalog {
    pub fn new(roots: Vec<CatalogRoot>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[CatalogRoot] {
        &self.roots
    }

    /// Lazily enumerate every root.
    pub fn enumerate(&self) -> Enumeration {
        let patterns = self
            .roots
            .iter()
            .enumerate()
            .flat_map(|(idx, root)| {
                root.patterns
                    .iter()
                    .map(move |p| (idx, root_glob(&root.path, p)))
            })
            .collect();
        Enumeration::new(patterns)
    }

    /// Lazily enumerate a single root.
    pub fn enumerate_root(&self, idx: usize) -> Enumeration {
        let patterns = self
            .roots
            .get(idx)
            .map(|root| {
                root.patterns
                    .iter()
                    .map(|p| (idx, root_glob(&root.path, p)))
                    .collect()
            })
            .unwrap_or_default();
        Enumeration::new(patterns)
    }

    /// Lazily enumerate already-absolute glob patterns attributed to `root`.
    ///
    /// Used for scoped refreshes, where the patterns name a handful of
    /// directories instead of the whole root.
    pub fn enumerate_patterns(root: usize, patterns: Vec<String>) -> Enumeration {
        Enumeration::new(patterns.into_iter().map(|p| (root, p)).collect())
    }

    /// Stat specific paths without listing any directory.
    pub fn stat_paths<I>(root: usize, paths: I) -> StatReport
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut report = StatReport::default();
        for path in paths {
            match std::fs::metadata(&path) {
                Ok(meta) if meta.is_file() => report.found.push(FileStat {
                    fingerprint: Fingerprint::from_metadata(&meta),
                    path,
                    root,
                }),
                Ok(_) => {
                    tracing::debug!(path = %path.display(), "Not a regular file, skipping");
                    report.skipped += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => report.missing.push(path),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to stat file");
                    report.skipped += 1;
                }
            }
        }
        report
    }
}

/// Outcome of [`FileCatalog::stat_paths`].
#[derive(Debug, Default)]
pub struct StatReport {
    pub found: Vec<FileStat>,
    /// Paths that no longer exist
    pub missing: Vec<PathBuf>,
    /// Paths that exist but could not be read
    pub skipped: usize,
}

/// Join a root and a relative pattern, escaping glob metacharacters in the
/// root itself.
pub fn root_glob(root: &Path, relative: &str) -> String {
    let escaped = glob::Pattern::escape(&root.to_string_lossy());
    if relative.is_empty() {
        escaped
    } else if escaped.ends_with('/') {
        format!("{escaped}{relative}")
    } else {
        format!("{escaped}/{relative}")
    }
}

/// Lazy, pattern-at-a-time iterator over catalog entries.
pub struct Enumeration {
    pending: VecDeque<(usize, String)>,
    current: Option<(usize, glob::Paths)>,
    skipped: usize,
}

impl Enumeration {
    fn new(pending: VecDeque<(usize, String)>) -> Self {
        Self {
            pending,
            current: None,
            skipped: 0,
        }
    }

    /// Entries skipped so far because they could not be read.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn advance_pattern(&mut self) -> bool {
        while let Some((root, pattern)) = self.pending.pop_front() {
            match glob::glob(&pattern) {
                Ok(paths) => {
                    tracing::trace!(pattern = %pattern, "Expanding catalog pattern");
                    self.current = Some((root, paths));
                    return true;
                }
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "Invalid glob pattern");
                    self.skipped += 1;
                }
            }
        }
        false
    }
}

impl Iterator for Enumeration {
    type Item = FileStat;

    fn next(&mut self) -> Option<FileStat> {
        loop {
            let Some((root, paths)) = self.current.as_mut() else {
                if !self.advance_pattern() {
                    return None;
                }
                continue;
            };
            let root = *root;

            match paths.next() {
                None => self.current = None,
                Some(Ok(path)) => match std::fs::metadata(&path) {
                    Ok(meta) if meta.is_file() => {
                        return Some(FileStat {
                            fingerprint: Fingerprint::from_metadata(&meta),
                            path,
                            root,
                        })
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(
                            path = %path.display(),
                            error = %e,
                            "Entry disappeared before stat, skipping"
                        );
                        self.skipped += 1;
                    }
                },
                Some(Err(e)) => {
                    tracing::warn!(
                        path = %e.path().display(),
                        error = %e.error(),
                        "Unreadable catalog entry, skipping"
                    );
                    self.skipped += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn claude_root(dir: &Path) -> CatalogRoot {
        CatalogRoot {
            path: dir.to_path_buf(),
            patterns: vec!["projects/*/*.jsonl".to_string()],
        }
    }

    #[test]
    fn test_enumerate_matches_patterns_only() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("projects/-work-alpha/a.jsonl"), "{}\n");
        touch(&dir.path().join("projects/-work-beta/b.jsonl"), "{}\n{}\n");
        touch(&dir.path().join("projects/-work-beta/notes.txt"), "x");
        touch(&dir.path().join("todos/t.jsonl"), "{}\n");

        let catalog = FileCatalog::new(vec![claude_root(dir.path())]);
        let mut entries: Vec<FileStat> = catalog.enumerate().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(entries.len(), 2);
        assert!(entries[0].path.ends_with("a.jsonl"));
        assert_eq!(entries[0].fingerprint.size, 3);
        assert_eq!(entries[1].fingerprint.size, 6);
        assert!(entries.iter().all(|e| e.root == 0));
    }

    #[test]
    fn test_directories_matching_pattern_are_ignored() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("projects/p/dir.jsonl")).unwrap();
        touch(&dir.path().join("projects/p/real.jsonl"), "{}\n");

        let catalog = FileCatalog::new(vec![claude_root(dir.path())]);
        let entries: Vec<FileStat> = catalog.enumerate().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_missing_root_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let catalog = FileCatalog::new(vec![claude_root(&dir.path().join("absent"))]);
        let mut enumeration = catalog.enumerate();
        assert!(enumeration.next().is_none());
        assert_eq!(enumeration.skipped(), 0);
    }

    #[test]
    fn test_enumeration_is_restartable() {
        let dir = TempDir::new().unwrap();
        for i in 0..5 {
            touch(&dir.path().join(format!("projects/p/{i}.jsonl")), "{}\n");
        }
        let catalog = FileCatalog::new(vec![claude_root(dir.path())]);

        let first: Vec<FileStat> = catalog.enumerate().take(2).collect();
        assert_eq!(first.len(), 2);
        assert_eq!(catalog.enumerate().count(), 5);
    }

    #[test]
    fn test_enumerate_root_attributes_index() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        touch(&b.path().join("projects/p/x.jsonl"), "{}\n");

        let catalog = FileCatalog::new(vec![claude_root(a.path()), claude_root(b.path())]);
        let entries: Vec<FileStat> = catalog.enumerate_root(1).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].root, 1);
        assert_eq!(catalog.enumerate_root(7).count(), 0);
    }

    #[test]
    fn test_root_with_glob_metacharacters() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("odd[name]");
        touch(&root.join("projects/p/x.jsonl"), "{}\n");

        let catalog = FileCatalog::new(vec![claude_root(&root)]);
        assert_eq!(catalog.enumerate().count(), 1);
    }

    #[test]
    fn test_stat_paths_reports_missing() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("a.jsonl");
        touch(&present, "{}\n");
        let gone = dir.path().join("gone.jsonl");

        let report = FileCatalog::stat_paths(3, vec![present.clone(), gone.clone()]);
        assert_eq!(report.found.len(), 1);
        assert_eq!(report.found[0].path, present);
        assert_eq!(report.found[0].root, 3);
        assert_eq!(report.missing, vec![gone]);
        assert_eq!(report.skipped, 0);
    }
}
