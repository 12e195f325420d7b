//! Core domain types for sessdex
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Source** | The CLI tool that wrote a session log (Claude Code, Codex, Aider) |
//! | **Root** | A configured directory owned by one source |
//! | **Fingerprint** | `(size, modified time)` of a log file, the change-detection key |
//! | **SessionRecord** | The per-file summary produced by one parse pass |
//! | **Scope** | A filter (All / Project / DateRange) for refreshes and queries |
//! | **AggregateSnapshot** | Sums and counts over a Scope, computed by the store |

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ============================================
// Source
// ============================================

/// The external CLI that produced a session log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    ClaudeCode,
    Codex,
    Aider,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::ClaudeCode, Source::Codex, Source::Aider];

    /// Returns the display name for this source
    pub fn display_name(&self) -> &'static str {
        match self {
            Source::ClaudeCode => "Claude Code",
            Source::Codex => "Codex",
            Source::Aider => "Aider",
        }
    }

    /// Returns the identifier used in store rows and config files
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::ClaudeCode => "claude_code",
            Source::Codex => "codex",
            Source::Aider => "aider",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude_code" | "ClaudeCode" | "claude" => Ok(Source::ClaudeCode),
            "codex" | "Codex" => Ok(Source::Codex),
            "aider" | "Aider" => Ok(Source::Aider),
            _ => Err(format!("unknown source: {}", s)),
        }
    }
}

// ============================================
// Change detection
// ============================================

/// Cheap proxy for "file content changed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    /// File size in bytes
    pub size: u64,
    /// Modification time, nanoseconds since the Unix epoch
    pub modified_ns: i64,
}

impl Fingerprint {
    pub fn new(size: u64, modified_ns: i64) -> Self {
        Self { size, modified_ns }
    }

    /// Build a fingerprint from file metadata.
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        let modified_ns = metadata
            .modified()
            .ok()
            .map(system_time_to_ns)
            .unwrap_or(0);
        Self {
            size: metadata.len(),
            modified_ns,
        }
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.modified_ns)
    }
}

pub(crate) fn system_time_to_ns(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_nanos()).unwrap_or(i64::MAX),
    }
}

/// One catalog entry: metadata only, no content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    /// Index of the configured root this file was found under
    pub root: usize,
}

/// What the store knows about a path, loaded for change detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFingerprint {
    pub session_id: String,
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    pub schema_version: u32,
    pub complete: bool,
    pub has_error: bool,
    pub project: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================
// Session records
// ============================================

/// Message counts by author role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageCounts {
    pub user: u64,
    pub assistant: u64,
    pub tool: u64,
    pub reasoning: u64,
    pub other: u64,
}

impl MessageCounts {
    pub fn total(&self) -> u64 {
        [self.assistant, self.tool, self.reasoning, self.other]
            .into_iter()
            .fold(self.user, u64::saturating_add)
    }

    pub fn add(&mut self, role: Role) {
        match role {
            Role::User => self.user += 1,
            Role::Assistant => self.assistant += 1,
            Role::Tool => self.tool += 1,
            Role::Reasoning => self.reasoning += 1,
            Role::Other => self.other += 1,
        }
    }
}

/// Role a log entry is counted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    Tool,
    Reasoning,
    Other,
}

/// Token accounting for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
    pub total: u64,
}

impl TokenTotals {
    /// Recompute `total` from the component counters.
    ///
    /// Saturates: counts come straight from log files and may be garbage.
    pub fn with_total(mut self) -> Self {
        self.total = self
            .input
            .saturating_add(self.output)
            .saturating_add(self.cache_read)
            .saturating_add(self.cache_creation);
        self
    }

    /// Add another usage report component-wise, saturating.
    pub fn add(&mut self, other: TokenTotals) {
        self.input = self.input.saturating_add(other.input);
        self.output = self.output.saturating_add(other.output);
        self.cache_read = self.cache_read.saturating_add(other.cache_read);
        self.cache_creation = self.cache_creation.saturating_add(other.cache_creation);
    }
}

/// Current record extraction version.
///
/// Bumped whenever parsers start extracting something new; rows written by an
/// older version are re-parsed once.
pub const RECORD_SCHEMA_VERSION: u32 = 2;

/// Persisted per-file summary.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub source: Source,
    pub remote_host: Option<String>,
    pub source_path: PathBuf,
    pub project: Option<String>,
    pub working_directory: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub active_time_ms: i64,
    pub messages: MessageCounts,
    pub tokens: TokenTotals,
    pub has_terminal_session: bool,
    pub has_review_activity: bool,
    pub fingerprint: Fingerprint,
    pub schema_version: u32,
    pub parse_error: Option<String>,
    /// False for a fingerprint-only stub
    pub complete: bool,
    /// Parse stopped at the configured scan limit
    pub scan_truncated: bool,
    /// User-assigned, never written by the ingest path
    pub title: Option<String>,
    pub pinned: bool,
}

/// Which of the three upsert shapes a record takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Stub,
    Failed,
    Complete,
}

impl SessionRecord {
    /// An empty record for `path`, used for stubs and failed first parses.
    pub fn placeholder(
        session_id: impl Into<String>,
        source: Source,
        source_path: PathBuf,
        fingerprint: Fingerprint,
    ) -> Self {
        let at = fingerprint.modified_at();
        Self {
            session_id: session_id.into(),
            source,
            remote_host: None,
            source_path,
            project: None,
            working_directory: String::new(),
            created_at: at,
            updated_at: at,
            duration_ms: 0,
            active_time_ms: 0,
            messages: MessageCounts::default(),
            tokens: TokenTotals::default(),
            has_terminal_session: false,
            has_review_activity: false,
            fingerprint,
            schema_version: RECORD_SCHEMA_VERSION,
            parse_error: None,
            complete: false,
            scan_truncated: false,
            title: None,
            pinned: false,
        }
    }

    pub fn state(&self) -> RecordState {
        if self.parse_error.is_some() {
            RecordState::Failed
        } else if self.complete {
            RecordState::Complete
        } else {
            RecordState::Stub
        }
    }
}

/// Fields that are set by the user, not by parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalField {
    Title(Option<String>),
    Pinned(bool),
}

// ============================================
// Scopes and aggregates
// ============================================

/// Which timestamp a date range filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DateDimension {
    CreatedAt,
    UpdatedAt,
}

impl DateDimension {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            DateDimension::CreatedAt => "created_at",
            DateDimension::UpdatedAt => "updated_at",
        }
    }
}

/// Filter predicate for refreshes and aggregate queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    All,
    Project(BTreeSet<String>),
    /// Half-open `[start, end)`
    DateRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        dimension: DateDimension,
    },
}

impl Scope {
    pub fn project(name: impl Into<String>) -> Self {
        Scope::Project(BTreeSet::from([name.into()]))
    }

    pub fn projects<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Scope::Project(names.into_iter().map(Into::into).collect())
    }

    pub fn date_range(start: DateTime<Utc>, end: DateTime<Utc>, dimension: DateDimension) -> Self {
        Scope::DateRange {
            start,
            end,
            dimension,
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Scope::All)
    }

    /// Pure predicate over the fields a scope can filter on.
    pub fn matches_fields(
        &self,
        project: Option<&str>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> bool {
        match self {
            Scope::All => true,
            Scope::Project(ids) => project.map(|p| ids.contains(p)).unwrap_or(false),
            Scope::DateRange {
                start,
                end,
                dimension,
            } => {
                let at = match dimension {
                    DateDimension::CreatedAt => created_at,
                    DateDimension::UpdatedAt => updated_at,
                };
                at >= *start && at < *end
            }
        }
    }

    pub fn matches(&self, record: &SessionRecord) -> bool {
        self.matches_fields(
            record.project.as_deref(),
            record.created_at,
            record.updated_at,
        )
    }

    pub fn matches_cached(&self, cached: &CachedFingerprint) -> bool {
        self.matches_fields(cached.project.as_deref(), cached.created_at, cached.updated_at)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::All => write!(f, "all"),
            Scope::Project(ids) => {
                let names: Vec<&str> = ids.iter().map(String::as_str).collect();
                write!(f, "project({})", names.join(","))
            }
            Scope::DateRange {
                start,
                end,
                dimension,
            } => write!(
                f,
                "{}[{}, {})",
                dimension.column(),
                start.to_rfc3339(),
                end.to_rfc3339()
            ),
        }
    }
}

/// Sums and counts over a scope. Only complete, error-free rows contribute to
/// the sums; failed and pending rows are counted separately.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateSnapshot {
    pub sessions: u64,
    pub messages: MessageCounts,
    pub tokens: TokenTotals,
    pub duration_ms: i64,
    pub active_time_ms: i64,
    pub terminal_sessions: u64,
    pub review_sessions: u64,
    pub failed_sessions: u64,
    pub pending_sessions: u64,
    pub first_created_at: Option<DateTime<Utc>>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

// ============================================
// Coordinator state and events
// ============================================

/// Pipeline stage of one watched root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexState {
    Idle,
    Cataloging,
    Classifying,
    Parsing,
    Committing,
    Error,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::Idle => "idle",
            IndexState::Cataloging => "cataloging",
            IndexState::Classifying => "classifying",
            IndexState::Parsing => "parsing",
            IndexState::Committing => "committing",
            IndexState::Error => "error",
        }
    }
}

/// Counters for one refresh request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Catalog entries considered
    pub scanned: usize,
    /// Entries skipped because they could not be read
    pub skipped_entries: usize,
    pub new: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub deleted: usize,
    /// Files handed to the parser
    pub parsed: usize,
    pub parse_failures: usize,
    /// Parse results dropped because a newer fingerprint was seen
    pub discarded: usize,
    pub records_written: usize,
    pub parsed_paths: Vec<PathBuf>,
    /// A newer request for the same scope replaced this one
    pub superseded: bool,
    /// At least one batch failed to commit and will be retried
    pub store_failed: bool,
}

/// Notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Inserted {
        session_id: String,
        parse_error: Option<String>,
    },
    Updated {
        session_id: String,
        parse_error: Option<String>,
    },
    Deleted {
        session_id: String,
    },
    AggregateUpdated {
        scope: Scope,
    },
    RootState {
        root: PathBuf,
        state: IndexState,
    },
    RefreshCompleted {
        scope: Scope,
        summary: RefreshSummary,
    },
    StoreFailed {
        scope: Scope,
        message: String,
        retry_in: Duration,
    },
}
