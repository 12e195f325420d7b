//! Parser trait abstraction
//!
//! Every source implements [`SessionParser`]: it names the files it owns,
//! derives a session id from a path, narrows discovery for a scope, and hands
//! out a [`LineScanner`] that folds one log line at a time into a
//! [`SessionAccumulator`].
//!
//! The line loop itself (buffering, scan limit, partial last line, fatal
//! error detection) lives in [`RecordParser`](super::RecordParser) and is the
//! same for every source.

use crate::types::{MessageCounts, Role, Scope, TokenTotals};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Pattern for discovering log files under a root.
#[derive(Debug, Clone)]
pub struct SourcePattern {
    /// Glob pattern relative to the root (e.g. "projects/*/*.jsonl")
    pub pattern: String,
    /// Human-readable description for logging
    pub description: String,
}

/// How one line was handled by a scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    /// A well-formed line of this source's format
    Record,
    /// Well-formed but not part of the format (blank, foreign)
    Skipped,
    /// Not decodable
    Malformed(String),
}

/// Stateful per-file line consumer.
pub trait LineScanner {
    fn scan_line(&mut self, line: &str, acc: &mut SessionAccumulator) -> LineKind;

    /// Called once after the last line.
    fn finish(&mut self, _acc: &mut SessionAccumulator) {}
}

/// Trait implemented by every source parser.
pub trait SessionParser: Send + Sync {
    fn source(&self) -> crate::types::Source;

    /// Patterns for discovering log files, relative to the root.
    fn source_patterns(&self) -> Vec<SourcePattern>;

    /// Deterministic session id for a log path.
    ///
    /// Must not depend on file contents so that stubs and full records share
    /// an id.
    fn session_id(&self, path: &Path) -> Option<String>;

    /// Project name recoverable from the path alone, used when the log never
    /// states its working directory.
    fn project_hint(&self, _path: &Path) -> Option<String> {
        None
    }

    /// Working directory recoverable from the path alone.
    fn working_directory_hint(&self, _path: &Path) -> Option<PathBuf> {
        None
    }

    /// Absolute glob patterns that cover the uncached files of `scope` under
    /// `root` without walking the whole root.
    ///
    /// An empty result means new files for this scope are only found by a
    /// full refresh or by the file watcher. May read directory metadata.
    fn scope_patterns(&self, root: &Path, scope: &Scope) -> Vec<String>;

    /// Whether an uncached file matched by [`scope_patterns`](Self::scope_patterns)
    /// really belongs to `scope`. Checked before the file is parsed.
    ///
    /// Sources whose patterns can over-match override this; it may read a
    /// bounded prefix of the file.
    fn admits(&self, _path: &Path, _scope: &Scope) -> bool {
        true
    }

    fn new_scanner(&self) -> Box<dyn LineScanner>;

    /// Whether `path` is a log file this parser discovers under `root`.
    fn owns_path(&self, root: &Path, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(root) else {
            return false;
        };
        let options = glob::MatchOptions {
            require_literal_separator: true,
            ..Default::default()
        };
        self.source_patterns().iter().any(|p| {
            glob::Pattern::new(&p.pattern)
                .map(|pattern| pattern.matches_path_with(relative, options))
                .unwrap_or(false)
        })
    }
}

/// Running totals for one file, shared by all scanners.
#[derive(Debug, Default)]
pub struct SessionAccumulator {
    pub messages: MessageCounts,
    pub tokens: TokenTotals,
    pub cwd: Option<String>,
    pub has_terminal_session: bool,
    pub has_review_activity: bool,
    first_at: Option<DateTime<Utc>>,
    last_at: Option<DateTime<Utc>>,
    active_ms: i64,
    idle_gap_ms: i64,
}

impl SessionAccumulator {
    pub fn new(idle_gap_secs: u64) -> Self {
        Self {
            idle_gap_ms: i64::try_from(idle_gap_secs.saturating_mul(1000)).unwrap_or(i64::MAX),
            ..Default::default()
        }
    }

    pub fn count(&mut self, role: Role) {
        self.messages.add(role);
    }

    /// Record an entry timestamp. Gaps up to the idle threshold count as
    /// active time; backwards jumps are ignored.
    pub fn observe_timestamp(&mut self, at: DateTime<Utc>) {
        if let Some(prev) = self.last_at {
            let gap = (at - prev).num_milliseconds();
            if gap >= 0 && gap <= self.idle_gap_ms {
                self.active_ms += gap;
            }
        }
        self.first_at = Some(self.first_at.map_or(at, |f| f.min(at)));
        self.last_at = Some(self.last_at.map_or(at, |l| l.max(at)));
    }

    /// Parse and record an RFC 3339 timestamp; unparsable values are ignored.
    pub fn observe_rfc3339(&mut self, raw: &str) {
        if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
            self.observe_timestamp(at.with_timezone(&Utc));
        }
    }

    /// Keep the first working directory seen.
    pub fn set_cwd(&mut self, cwd: &str) {
        if self.cwd.is_none() && !cwd.is_empty() {
            self.cwd = Some(cwd.to_string());
        }
    }

    pub fn first_at(&self) -> Option<DateTime<Utc>> {
        self.first_at
    }

    pub fn last_at(&self) -> Option<DateTime<Utc>> {
        self.last_at
    }

    pub fn active_time_ms(&self) -> i64 {
        self.active_ms
    }
}

/// Project name for a working directory: its final path component.
pub fn project_from_cwd(cwd: &str) -> Option<String> {
    Path::new(cwd.trim_end_matches('/'))
        .file_name()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
