//! Catalog plans
//!
//! A plan says which files one root's catalog task looks at:
//!
//! - `All`: walk every discovery pattern of the root.
//! - `Project`: stat the cached rows of those projects, then walk the
//!   source's project directories for files not cached yet.
//! - `DateRange`: stat cached rows, then walk the source's date directories
//!   for uncached files modified since the range start.
//! - path refresh: stat exactly the paths a watcher reported.
//!
//! Only `All` lists a whole root.

use crate::catalog::FileCatalog;
use crate::error::{Error, Result};
use crate::ingest::SessionParser;
use crate::types::{CachedFingerprint, DateDimension, FileStat, Scope};
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Clone)]
enum Walk {
    None,
    /// Every discovery pattern of the root
    Root,
    /// The source's scope-specific patterns
    Scope(Scope),
}

/// Work order for one root's catalog task.
#[derive(Debug, Clone)]
pub(crate) struct CatalogPlan {
    root: usize,
    root_path: PathBuf,
    walk: Walk,
    /// Cached or reported paths to stat, and whether they are in scope
    known: Vec<(PathBuf, bool)>,
    /// Keep out-of-scope known paths modified at or after `min_modified_ns`
    known_by_mtime: bool,
    /// Walked files already cached under this root; a scoped walk only adds
    /// files that are not cached
    cached_paths: HashSet<PathBuf>,
    uncached_only: bool,
    min_modified_ns: Option<i64>,
    /// Cached paths this pass may report deleted
    responsible: Vec<PathBuf>,
}

/// What a catalog task found.
#[derive(Debug, Default)]
pub(crate) struct CatalogOutput {
    pub entries: Vec<FileStat>,
    pub skipped: usize,
    pub responsible: Vec<PathBuf>,
}

impl CatalogPlan {
    /// Plan a scope refresh of one root. `cached` holds every cached row under
    /// the root.
    pub(crate) fn for_scope<'a, I>(root: usize, root_path: PathBuf, scope: &Scope, cached: I) -> Self
    where
        I: IntoIterator<Item = &'a CachedFingerprint>,
    {
        let cached: Vec<&CachedFingerprint> = cached.into_iter().collect();

        if scope.is_all() {
            return Self {
                root,
                root_path,
                walk: Walk::Root,
                known: Vec::new(),
                known_by_mtime: false,
                cached_paths: HashSet::new(),
                uncached_only: false,
                min_modified_ns: None,
                responsible: cached.iter().map(|c| c.path.clone()).collect(),
            };
        }

        let cached_paths: HashSet<PathBuf> = cached.iter().map(|c| c.path.clone()).collect();
        let in_scope: Vec<&CachedFingerprint> =
            cached.iter().copied().filter(|c| scope.matches_cached(c)).collect();
        let responsible: Vec<PathBuf> = in_scope.iter().map(|c| c.path.clone()).collect();

        match scope {
            Scope::DateRange {
                start, dimension, ..
            } => {
                // Rows updated since `start` but cached with an older
                // updated_at only show up through their mtime
                let by_mtime = *dimension == DateDimension::UpdatedAt;
                let known = cached
                    .iter()
                    .map(|c| (c.path.clone(), scope.matches_cached(c)))
                    .filter(|(_, in_scope)| *in_scope || by_mtime)
                    .collect();
                Self {
                    root,
                    root_path,
                    walk: Walk::Scope(scope.clone()),
                    known,
                    known_by_mtime: by_mtime,
                    cached_paths,
                    uncached_only: true,
                    min_modified_ns: start.timestamp_nanos_opt(),
                    responsible,
                }
            }
            _ => Self {
                root,
                root_path,
                walk: Walk::Scope(scope.clone()),
                known: responsible.iter().map(|p| (p.clone(), true)).collect(),
                known_by_mtime: false,
                cached_paths,
                uncached_only: true,
                min_modified_ns: None,
                responsible,
            },
        }
    }

    /// Plan a refresh of specific paths reported by the watcher.
    pub(crate) fn for_paths(
        root: usize,
        root_path: PathBuf,
        paths: Vec<PathBuf>,
        cached: &HashSet<PathBuf>,
    ) -> Self {
        let responsible = paths.iter().filter(|p| cached.contains(*p)).cloned().collect();
        Self {
            root,
            root_path,
            walk: Walk::None,
            known: paths.into_iter().map(|p| (p, true)).collect(),
            known_by_mtime: false,
            cached_paths: HashSet::new(),
            uncached_only: false,
            min_modified_ns: None,
            responsible,
        }
    }

    pub(crate) fn root(&self) -> usize {
        self.root
    }

    /// Execute the plan. Blocking: stats files and lists directories.
    pub(crate) fn run(self, catalog: &FileCatalog, parser: &dyn SessionParser) -> Result<CatalogOutput> {
        if !self.root_path.is_dir() {
            // Never report deletions for a root that is merely unavailable
            return Err(Error::Enumeration {
                path: self.root_path,
                message: "root is not a readable directory".to_string(),
            });
        }

        let mut output = CatalogOutput {
            responsible: self.responsible,
            ..Default::default()
        };

        if !self.known.is_empty() {
            let in_scope: HashSet<&PathBuf> = self
                .known
                .iter()
                .filter(|(_, in_scope)| *in_scope)
                .map(|(p, _)| p)
                .collect();
            let report =
                FileCatalog::stat_paths(self.root, self.known.iter().map(|(p, _)| p.clone()));
            output.skipped += report.skipped;
            for stat in report.found {
                let recent = self.known_by_mtime
                    && self
                        .min_modified_ns
                        .is_some_and(|min| stat.fingerprint.modified_ns >= min);
                if in_scope.contains(&stat.path) || recent {
                    output.entries.push(stat);
                }
            }
        }

        let mut walk = match &self.walk {
            Walk::None => return Ok(output),
            Walk::Root => catalog.enumerate_root(self.root),
            Walk::Scope(scope) => {
                FileCatalog::enumerate_patterns(self.root, parser.scope_patterns(&self.root_path, scope))
            }
        };
        for stat in walk.by_ref() {
            if self.uncached_only && self.cached_paths.contains(&stat.path) {
                continue;
            }
            if self
                .min_modified_ns
                .is_some_and(|min| stat.fingerprint.modified_ns < min)
            {
                continue;
            }
            if let Walk::Scope(scope) = &self.walk {
                if !parser.admits(&stat.path, scope) {
                    continue;
                }
            }
            output.entries.push(stat);
        }
        output.skipped += walk.skipped();

        tracing::debug!(
            root = %self.root_path.display(),
            entries = output.entries.len(),
            skipped = output.skipped,
            "Catalog pass finished"
        );

        Ok(output)
    }
}
