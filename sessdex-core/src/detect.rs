//! Change detection
//!
//! Compares catalog entries against the cached fingerprints and splits them
//! into new, modified, deleted and unchanged. Pure: no I/O.

use crate::types::{CachedFingerprint, FileStat, RECORD_SCHEMA_VERSION};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Result of one classification pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Classification {
    pub new: Vec<FileStat>,
    pub modified: Vec<FileStat>,
    /// Cached rows whose file was not seen
    pub deleted: Vec<CachedFingerprint>,
    /// Session ids whose cached row is still current
    pub unchanged: Vec<String>,
}

impl Classification {
    /// Entries that need a parse
    pub fn to_parse(&self) -> impl Iterator<Item = &FileStat> {
        self.new.iter().chain(self.modified.iter())
    }
}

/// Classifies catalog entries against cached fingerprints.
#[derive(Debug, Clone, Copy)]
pub struct ChangeDetector {
    schema_version: u32,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
        }
    }

    pub fn with_schema_version(schema_version: u32) -> Self {
        Self { schema_version }
    }

    /// Classify `entries` against `cached`.
    ///
    /// `cached` must hold exactly the rows this pass is responsible for: any
    /// of them whose path is absent from `entries` is reported deleted.
    ///
    /// A cached row counts as unchanged when its fingerprint matches and it
    /// is either a recorded failure or a complete row at the current record
    /// version. Stubs and rows from an older record version are modified.
    /// Size and mtime are compared exactly, so a file truncated and rewritten
    /// to the same size still differs by mtime.
    pub fn classify<I>(&self, entries: I, cached: &HashMap<PathBuf, CachedFingerprint>) -> Classification
    where
        I: IntoIterator<Item = FileStat>,
    {
        let mut out = Classification::default();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        for entry in entries {
            if !seen.insert(entry.path.clone()) {
                continue;
            }
            match cached.get(&entry.path) {
                None => out.new.push(entry),
                Some(row) if self.is_current(row, &entry) => {
                    out.unchanged.push(row.session_id.clone())
                }
                Some(_) => out.modified.push(entry),
            }
        }

        out.deleted = cached
            .iter()
            .filter(|(path, _)| !seen.contains(*path))
            .map(|(_, row)| row.clone())
            .collect();
        out.deleted.sort_by(|a, b| a.path.cmp(&b.path));

        out
    }

    fn is_current(&self, row: &CachedFingerprint, entry: &FileStat) -> bool {
        if row.fingerprint != entry.fingerprint {
            return false;
        }
        row.has_error || (row.complete && row.schema_version >= self.schema_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Fingerprint;
    use chrono::Utc;

    fn stat(path: &str, size: u64, mtime: i64) -> FileStat {
        FileStat {
            path: PathBuf::from(path),
            fingerprint: Fingerprint::new(size, mtime),
            root: 0,
        }
    }

    fn cached(id: &str, path: &str, size: u64, mtime: i64) -> CachedFingerprint {
        CachedFingerprint {
            session_id: id.to_string(),
            path: PathBuf::from(path),
            fingerprint: Fingerprint::new(size, mtime),
            schema_version: RECORD_SCHEMA_VERSION,
            complete: true,
            has_error: false,
            project: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn cache_of(rows: Vec<CachedFingerprint>) -> HashMap<PathBuf, CachedFingerprint> {
        rows.into_iter().map(|r| (r.path.clone(), r)).collect()
    }

    #[test]
    fn test_basic_classification() {
        let cache = cache_of(vec![
            cached("a", "/r/a.jsonl", 100, 1),
            cached("b", "/r/b.jsonl", 200, 2),
            cached("d", "/r/d.jsonl", 50, 3),
        ]);
        let entries = vec![
            stat("/r/a.jsonl", 100, 1),
            stat("/r/b.jsonl", 250, 5),
            stat("/r/c.jsonl", 10, 9),
        ];

        let result = ChangeDetector::new().classify(entries, &cache);

        assert_eq!(result.unchanged, vec!["a".to_string()]);
        assert_eq!(result.modified.len(), 1);
        assert_eq!(result.modified[0].path, PathBuf::from("/r/b.jsonl"));
        assert_eq!(result.new.len(), 1);
        assert_eq!(result.new[0].path, PathBuf::from("/r/c.jsonl"));
        assert_eq!(result.deleted.len(), 1);
        assert_eq!(result.deleted[0].session_id, "d");
        assert_eq!(result.to_parse().count(), 2);
    }

    #[test]
    fn test_truncate_and_rewrite_same_size_is_modified() {
        let cache = cache_of(vec![cached("a", "/r/a.jsonl", 100, 1_000)]);
        let result = ChangeDetector::new().classify(vec![stat("/r/a.jsonl", 100, 2_000)], &cache);
        assert_eq!(result.modified.len(), 1);
        assert!(result.unchanged.is_empty());
    }

    #[test]
    fn test_shrunk_file_is_modified() {
        let cache = cache_of(vec![cached("a", "/r/a.jsonl", 100, 1_000)]);
        let result = ChangeDetector::new().classify(vec![stat("/r/a.jsonl", 10, 1_000)], &cache);
        assert_eq!(result.modified.len(), 1);
    }

    #[test]
    fn test_stub_and_old_schema_are_modified() {
        let mut stub = cached("s", "/r/s.jsonl", 10, 1);
        stub.complete = false;
        let mut old = cached("o", "/r/o.jsonl", 10, 1);
        old.schema_version = RECORD_SCHEMA_VERSION - 1;

        let result = ChangeDetector::new().classify(
            vec![stat("/r/s.jsonl", 10, 1), stat("/r/o.jsonl", 10, 1)],
            &cache_of(vec![stub, old]),
        );
        assert_eq!(result.modified.len(), 2);
    }

    #[test]
    fn test_failed_row_not_retried_until_fingerprint_changes() {
        let mut failed = cached("f", "/r/f.jsonl", 10, 1);
        failed.has_error = true;
        let cache = cache_of(vec![failed]);

        let same = ChangeDetector::new().classify(vec![stat("/r/f.jsonl", 10, 1)], &cache);
        assert_eq!(same.unchanged, vec!["f".to_string()]);

        let grown = ChangeDetector::new().classify(vec![stat("/r/f.jsonl", 20, 2)], &cache);
        assert_eq!(grown.modified.len(), 1);
    }

    #[test]
    fn test_duplicate_entries_counted_once() {
        let result = ChangeDetector::new().classify(
            vec![stat("/r/a.jsonl", 1, 1), stat("/r/a.jsonl", 1, 1)],
            &HashMap::new(),
        );
        assert_eq!(result.new.len(), 1);
    }

    #[test]
    fn test_empty_catalog_deletes_everything_responsible() {
        let cache = cache_of(vec![
            cached("a", "/r/a.jsonl", 1, 1),
            cached("b", "/r/b.jsonl", 1, 1),
        ]);
        let result = ChangeDetector::new().classify(Vec::new(), &cache);
        let ids: Vec<&str> = result.deleted.iter().map(|d| d.session_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
