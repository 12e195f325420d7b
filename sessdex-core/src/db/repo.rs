//! Cache store repository
//!
//! One row per session log. Writes go through a single mutex-guarded
//! connection; aggregate reads use a second connection so they never queue
//! behind a large ingest transaction.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row, Transaction,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const COLUMNS: &str = "session_id, source, remote_host, source_path, project, working_directory, \
     created_at, updated_at, duration_ms, active_time_ms, \
     user_messages, assistant_messages, tool_messages, reasoning_messages, other_messages, \
     input_tokens, output_tokens, cache_read_tokens, cache_creation_tokens, total_tokens, \
     has_terminal_session, has_review_activity, \
     file_size, file_modified_ns, schema_version, parse_error, complete, scan_truncated, indexed_at";

const COLUMN_COUNT: usize = 29;

const FINGERPRINT_COLUMNS: &str = "session_id, source_path, file_size, file_modified_ns, \
     schema_version, complete, parse_error IS NOT NULL AS has_error, project, created_at, updated_at";

/// How a single record landed in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Inserted,
    Updated,
    /// The row already held this fingerprint; nothing was written
    Unchanged,
    Deleted,
}

/// Per-record result of [`CacheStore::apply_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub session_id: String,
    pub kind: WriteKind,
}

/// SQLite-backed session cache.
pub struct CacheStore {
    writer: Mutex<Connection>,
    /// `None` for in-memory stores, which cannot share a second connection
    reader: Option<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl CacheStore {
    /// Open or create a store at the given path and bring its schema up to date.
    ///
    /// Fails with [`Error::Schema`] if the file was written by a newer build.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -16000;  -- 16MB cache
            ",
        )?;
        super::schema::run_migrations(&mut conn)?;

        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(Duration::from_secs(5))?;

        tracing::debug!(path = %path.display(), "Cache store opened");

        Ok(Self {
            writer: Mutex::new(conn),
            reader: Some(Mutex::new(reader)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        super::schema::run_migrations(&mut conn)?;
        Ok(Self {
            writer: Mutex::new(conn),
            reader: None,
            path: None,
        })
    }

    /// Path of the backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Store-level schema version
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.read_conn();
        super::schema::get_schema_version(&conn)
    }

    fn read_conn(&self) -> MutexGuard<'_, Connection> {
        match &self.reader {
            Some(reader) => reader.lock().unwrap(),
            None => self.writer.lock().unwrap(),
        }
    }

    // ============================================
    // Writes
    // ============================================

    /// Write a batch of records in one transaction.
    ///
    /// Each record takes the statement for its state:
    /// - stub: insert only if no row exists
    /// - failed: insert, or update fingerprint and error while keeping content
    /// - complete: full upsert, skipped when the row already holds the same
    ///   complete fingerprint at the same schema version
    ///
    /// User-owned fields (`title`, `pinned`) are never written here. Any error
    /// rolls back the whole batch.
    pub fn upsert_batch(&self, records: &[SessionRecord]) -> Result<Vec<WriteOutcome>> {
        self.apply_batch(records, &[])
    }

    /// Remove rows by session id. Returns the number of rows removed.
    pub fn delete(&self, session_ids: &[String]) -> Result<usize> {
        let outcomes = self.apply_batch(&[], session_ids)?;
        Ok(outcomes.len())
    }

    /// Deletions then upserts, in a single transaction.
    ///
    /// Outcomes list the removed rows first (ids that had no row produce no
    /// outcome), then one outcome per record in input order.
    pub fn apply_batch(
        &self,
        records: &[SessionRecord],
        deletes: &[String],
    ) -> Result<Vec<WriteOutcome>> {
        if records.is_empty() && deletes.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.writer.lock().unwrap();
        let tx = conn.transaction()?;
        let mut outcomes = Vec::with_capacity(records.len() + deletes.len());

        // Deletes first: a renamed file deletes its id at the old path and
        // upserts the same id at the new one
        {
            let mut stmt = tx.prepare_cached("DELETE FROM sessions WHERE session_id = ?1")?;
            for id in deletes {
                if stmt.execute([id])? > 0 {
                    outcomes.push(WriteOutcome {
                        session_id: id.clone(),
                        kind: WriteKind::Deleted,
                    });
                }
            }
        }
        outcomes.extend(write_records(&tx, records)?);

        tx.commit()?;

        tracing::debug!(
            records = records.len(),
            deletes = deletes.len(),
            written = outcomes
                .iter()
                .filter(|o| o.kind != WriteKind::Unchanged)
                .count(),
            "Committed batch"
        );

        Ok(outcomes)
    }

    /// Set a user-owned field. Never touches the fingerprint.
    pub fn set_external_field(&self, session_id: &str, field: &ExternalField) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        let changed = match field {
            ExternalField::Title(title) => conn.execute(
                "UPDATE sessions SET title = ?1 WHERE session_id = ?2",
                params![title, session_id],
            )?,
            ExternalField::Pinned(pinned) => conn.execute(
                "UPDATE sessions SET pinned = ?1 WHERE session_id = ?2",
                params![pinned, session_id],
            )?,
        };

        if changed == 0 {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    // ============================================
    // Reads
    // ============================================

    /// Aggregate over a scope, computed in SQL.
    pub fn query(&self, scope: &Scope) -> Result<AggregateSnapshot> {
        let (filter, values) = scope_filter(scope);
        let sql = format!(
            r#"
            SELECT
                COALESCE(SUM(ok), 0),
                COALESCE(SUM(CASE WHEN ok THEN user_messages END), 0),
                COALESCE(SUM(CASE WHEN ok THEN assistant_messages END), 0),
                COALESCE(SUM(CASE WHEN ok THEN tool_messages END), 0),
                COALESCE(SUM(CASE WHEN ok THEN reasoning_messages END), 0),
                COALESCE(SUM(CASE WHEN ok THEN other_messages END), 0),
                COALESCE(SUM(CASE WHEN ok THEN input_tokens END), 0),
                COALESCE(SUM(CASE WHEN ok THEN output_tokens END), 0),
                COALESCE(SUM(CASE WHEN ok THEN cache_read_tokens END), 0),
                COALESCE(SUM(CASE WHEN ok THEN cache_creation_tokens END), 0),
                COALESCE(SUM(CASE WHEN ok THEN total_tokens END), 0),
                COALESCE(SUM(CASE WHEN ok THEN duration_ms END), 0),
                COALESCE(SUM(CASE WHEN ok THEN active_time_ms END), 0),
                COALESCE(SUM(CASE WHEN ok THEN has_terminal_session END), 0),
                COALESCE(SUM(CASE WHEN ok THEN has_review_activity END), 0),
                COALESCE(SUM(parse_error IS NOT NULL), 0),
                COALESCE(SUM(complete = 0), 0),
                MIN(CASE WHEN ok THEN created_at END),
                MAX(CASE WHEN ok THEN updated_at END)
            FROM (
                SELECT *, (complete = 1 AND parse_error IS NULL) AS ok
                FROM sessions
                WHERE {filter}
            )
            "#
        );

        let conn = self.read_conn();
        conn.query_row(&sql, params_from_iter(values), |row| {
            let first: Option<i64> = row.get(17)?;
            let last: Option<i64> = row.get(18)?;
            Ok(AggregateSnapshot {
                sessions: get_u64(row, 0)?,
                messages: MessageCounts {
                    user: get_u64(row, 1)?,
                    assistant: get_u64(row, 2)?,
                    tool: get_u64(row, 3)?,
                    reasoning: get_u64(row, 4)?,
                    other: get_u64(row, 5)?,
                },
                tokens: TokenTotals {
                    input: get_u64(row, 6)?,
                    output: get_u64(row, 7)?,
                    cache_read: get_u64(row, 8)?,
                    cache_creation: get_u64(row, 9)?,
                    total: get_u64(row, 10)?,
                },
                duration_ms: row.get(11)?,
                active_time_ms: row.get(12)?,
                terminal_sessions: get_u64(row, 13)?,
                review_sessions: get_u64(row, 14)?,
                failed_sessions: get_u64(row, 15)?,
                pending_sessions: get_u64(row, 16)?,
                first_created_at: first.map(from_millis),
                last_updated_at: last.map(from_millis),
            })
        })
        .map_err(Error::from)
    }

    /// Cached fingerprints for the given paths. Paths with no row are absent.
    pub fn fetch_fingerprints(&self, paths: &[PathBuf]) -> Result<HashMap<PathBuf, CachedFingerprint>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {FINGERPRINT_COLUMNS} FROM sessions WHERE source_path = ?1"
        ))?;

        let mut found = HashMap::new();
        for path in paths {
            let cached = stmt
                .query_row([path.to_string_lossy().to_string()], row_to_fingerprint)
                .optional()?;
            if let Some(cached) = cached {
                found.insert(path.clone(), cached);
            }
        }
        Ok(found)
    }

    /// All cached fingerprints, used to warm the coordinator at startup.
    pub fn load_fingerprints(&self) -> Result<Vec<CachedFingerprint>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(&format!("SELECT {FINGERPRINT_COLUMNS} FROM sessions"))?;
        let rows = stmt
            .query_map([], row_to_fingerprint)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Get a session by ID
    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.read_conn();
        conn.query_row(
            "SELECT * FROM sessions WHERE session_id = ?1",
            [session_id],
            row_to_record,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Most recently updated sessions in a scope
    pub fn list_sessions(&self, scope: &Scope, limit: usize) -> Result<Vec<SessionRecord>> {
        let (filter, mut values) = scope_filter(scope);
        values.push(Value::Integer(limit as i64));
        let sql =
            format!("SELECT * FROM sessions WHERE {filter} ORDER BY updated_at DESC LIMIT ?");

        let conn = self.read_conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Total number of rows, including stubs and failures
    pub fn count_sessions(&self) -> Result<u64> {
        let conn = self.read_conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?;
        Ok(count as u64)
    }
}

// ============================================
// SQL builders and row mapping
// ============================================

fn write_records(tx: &Transaction<'_>, records: &[SessionRecord]) -> Result<Vec<WriteOutcome>> {
    let indexed_at = Utc::now().timestamp_millis();
    let mut exists = tx.prepare_cached("SELECT 1 FROM sessions WHERE session_id = ?1")?;
    let mut evict =
        tx.prepare_cached("DELETE FROM sessions WHERE source_path = ?1 AND session_id <> ?2")?;
    let mut stub = tx.prepare_cached(&stub_sql())?;
    let mut failed = tx.prepare_cached(&failed_sql())?;
    let mut complete = tx.prepare_cached(&complete_sql())?;

    let mut outcomes = Vec::with_capacity(records.len());
    for record in records {
        let path = record.source_path.to_string_lossy().to_string();
        if evict.execute(params![path, record.session_id])? > 0 {
            tracing::warn!(
                path = %path,
                session_id = %record.session_id,
                "Replaced row with a different session id for the same path"
            );
        }

        let existed = exists.exists([&record.session_id])?;
        let values = record_values(record, indexed_at);
        let changed = match record.state() {
            RecordState::Stub => stub.execute(params_from_iter(values))?,
            RecordState::Failed => failed.execute(params_from_iter(values))?,
            RecordState::Complete => complete.execute(params_from_iter(values))?,
        };

        let kind = match (changed, existed) {
            (0, _) => WriteKind::Unchanged,
            (_, true) => WriteKind::Updated,
            (_, false) => WriteKind::Inserted,
        };
        outcomes.push(WriteOutcome {
            session_id: record.session_id.clone(),
            kind,
        });
    }
    Ok(outcomes)
}

fn placeholders() -> String {
    (1..=COLUMN_COUNT)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn stub_sql() -> String {
    format!(
        "INSERT INTO sessions ({COLUMNS}) VALUES ({}) ON CONFLICT(session_id) DO NOTHING",
        placeholders()
    )
}

fn failed_sql() -> String {
    format!(
        r#"
        INSERT INTO sessions ({COLUMNS}) VALUES ({})
        ON CONFLICT(session_id) DO UPDATE SET
            source_path = excluded.source_path,
            file_size = excluded.file_size,
            file_modified_ns = excluded.file_modified_ns,
            schema_version = excluded.schema_version,
            parse_error = excluded.parse_error,
            complete = 1,
            indexed_at = excluded.indexed_at
        WHERE NOT (
            sessions.file_size = excluded.file_size
            AND sessions.file_modified_ns = excluded.file_modified_ns
            AND sessions.schema_version = excluded.schema_version
            AND sessions.parse_error IS excluded.parse_error
        )
        "#,
        placeholders()
    )
}

fn complete_sql() -> String {
    format!(
        r#"
        INSERT INTO sessions ({COLUMNS}) VALUES ({})
        ON CONFLICT(session_id) DO UPDATE SET
            source = excluded.source,
            remote_host = excluded.remote_host,
            source_path = excluded.source_path,
            project = excluded.project,
            working_directory = excluded.working_directory,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            duration_ms = excluded.duration_ms,
            active_time_ms = excluded.active_time_ms,
            user_messages = excluded.user_messages,
            assistant_messages = excluded.assistant_messages,
            tool_messages = excluded.tool_messages,
            reasoning_messages = excluded.reasoning_messages,
            other_messages = excluded.other_messages,
            input_tokens = excluded.input_tokens,
            output_tokens = excluded.output_tokens,
            cache_read_tokens = excluded.cache_read_tokens,
            cache_creation_tokens = excluded.cache_creation_tokens,
            total_tokens = excluded.total_tokens,
            has_terminal_session = excluded.has_terminal_session,
            has_review_activity = excluded.has_review_activity,
            file_size = excluded.file_size,
            file_modified_ns = excluded.file_modified_ns,
            schema_version = excluded.schema_version,
            parse_error = NULL,
            complete = 1,
            scan_truncated = excluded.scan_truncated,
            indexed_at = excluded.indexed_at
        WHERE NOT (
            sessions.file_size = excluded.file_size
            AND sessions.file_modified_ns = excluded.file_modified_ns
            AND sessions.schema_version = excluded.schema_version
            AND sessions.complete = 1
            AND sessions.parse_error IS NULL
        )
        "#,
        placeholders()
    )
}

/// Values in `COLUMNS` order.
fn record_values(r: &SessionRecord, indexed_at: i64) -> Vec<Value> {
    fn text(s: Option<&str>) -> Value {
        s.map(|s| Value::Text(s.to_string())).unwrap_or(Value::Null)
    }
    fn int(n: u64) -> Value {
        Value::Integer(i64::try_from(n).unwrap_or(i64::MAX))
    }

    // A failed row is a finished attempt, not a pending stub
    let complete = r.complete || r.parse_error.is_some();

    let values = vec![
        Value::Text(r.session_id.clone()),
        Value::Text(r.source.as_str().to_string()),
        text(r.remote_host.as_deref()),
        Value::Text(r.source_path.to_string_lossy().to_string()),
        text(r.project.as_deref()),
        Value::Text(r.working_directory.clone()),
        Value::Integer(r.created_at.timestamp_millis()),
        Value::Integer(r.updated_at.timestamp_millis()),
        Value::Integer(r.duration_ms),
        Value::Integer(r.active_time_ms),
        int(r.messages.user),
        int(r.messages.assistant),
        int(r.messages.tool),
        int(r.messages.reasoning),
        int(r.messages.other),
        int(r.tokens.input),
        int(r.tokens.output),
        int(r.tokens.cache_read),
        int(r.tokens.cache_creation),
        int(r.tokens.total),
        Value::Integer(r.has_terminal_session as i64),
        Value::Integer(r.has_review_activity as i64),
        int(r.fingerprint.size),
        Value::Integer(r.fingerprint.modified_ns),
        Value::Integer(r.schema_version as i64),
        text(r.parse_error.as_deref()),
        Value::Integer(complete as i64),
        Value::Integer(r.scan_truncated as i64),
        Value::Integer(indexed_at),
    ];
    debug_assert_eq!(values.len(), COLUMN_COUNT);
    values
}

fn scope_filter(scope: &Scope) -> (String, Vec<Value>) {
    match scope {
        Scope::All => ("1 = 1".to_string(), Vec::new()),
        Scope::Project(ids) if ids.is_empty() => ("0 = 1".to_string(), Vec::new()),
        Scope::Project(ids) => {
            let marks = vec!["?"; ids.len()].join(", ");
            (
                format!("project IN ({marks})"),
                ids.iter().map(|p| Value::Text(p.clone())).collect(),
            )
        }
        Scope::DateRange {
            start,
            end,
            dimension,
        } => {
            let col = dimension.column();
            (
                format!("{col} >= ? AND {col} < ?"),
                vec![
                    Value::Integer(start.timestamp_millis()),
                    Value::Integer(end.timestamp_millis()),
                ],
            )
        }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_nanos(0))
}

fn get_u64(row: &Row, idx: usize) -> rusqlite::Result<u64> {
    let v: i64 = row.get(idx)?;
    Ok(v.max(0) as u64)
}

fn get_u64_named(row: &Row, name: &str) -> rusqlite::Result<u64> {
    let v: i64 = row.get(name)?;
    Ok(v.max(0) as u64)
}

fn row_to_fingerprint(row: &Row) -> rusqlite::Result<CachedFingerprint> {
    let path: String = row.get("source_path")?;
    let schema_version: i64 = row.get("schema_version")?;
    Ok(CachedFingerprint {
        session_id: row.get("session_id")?,
        path: PathBuf::from(path),
        fingerprint: Fingerprint::new(get_u64_named(row, "file_size")?, row.get("file_modified_ns")?),
        schema_version: schema_version.max(0) as u32,
        complete: row.get("complete")?,
        has_error: row.get("has_error")?,
        project: row.get("project")?,
        created_at: from_millis(row.get("created_at")?),
        updated_at: from_millis(row.get("updated_at")?),
    })
}

fn row_to_record(row: &Row) -> rusqlite::Result<SessionRecord> {
    let source_str: String = row.get("source")?;
    let source = source_str.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })?;
    let path: String = row.get("source_path")?;
    let schema_version: i64 = row.get("schema_version")?;

    Ok(SessionRecord {
        session_id: row.get("session_id")?,
        source,
        remote_host: row.get("remote_host")?,
        source_path: PathBuf::from(path),
        project: row.get("project")?,
        working_directory: row.get("working_directory")?,
        created_at: from_millis(row.get("created_at")?),
        updated_at: from_millis(row.get("updated_at")?),
        duration_ms: row.get("duration_ms")?,
        active_time_ms: row.get("active_time_ms")?,
        messages: MessageCounts {
            user: get_u64_named(row, "user_messages")?,
            assistant: get_u64_named(row, "assistant_messages")?,
            tool: get_u64_named(row, "tool_messages")?,
            reasoning: get_u64_named(row, "reasoning_messages")?,
            other: get_u64_named(row, "other_messages")?,
        },
        tokens: TokenTotals {
            input: get_u64_named(row, "input_tokens")?,
            output: get_u64_named(row, "output_tokens")?,
            cache_read: get_u64_named(row, "cache_read_tokens")?,
            cache_creation: get_u64_named(row, "cache_creation_tokens")?,
            total: get_u64_named(row, "total_tokens")?,
        },
        has_terminal_session: row.get("has_terminal_session")?,
        has_review_activity: row.get("has_review_activity")?,
        fingerprint: Fingerprint::new(get_u64_named(row, "file_size")?, row.get("file_modified_ns")?),
        schema_version: schema_version.max(0) as u32,
        parse_error: row.get("parse_error")?,
        complete: row.get("complete")?,
        scan_truncated: row.get("scan_truncated")?,
        title: row.get("title")?,
        pinned: row.get("pinned")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn create_test_record(id: &str, project: &str, tokens: u64) -> SessionRecord {
        let mut r = SessionRecord::placeholder(
            id,
            Source::ClaudeCode,
            PathBuf::from(format!("/logs/{id}.jsonl")),
            Fingerprint::new(1000, 1_700_000_000_000_000_000),
        );
        r.project = Some(project.to_string());
        r.working_directory = format!("/work/{project}");
        r.created_at = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        r.updated_at = r.created_at + ChronoDuration::minutes(30);
        r.duration_ms = 30 * 60 * 1000;
        r.active_time_ms = 10 * 60 * 1000;
        r.messages = MessageCounts {
            user: 3,
            assistant: 4,
            tool: 2,
            reasoning: 1,
            other: 0,
        };
        r.tokens = TokenTotals {
            input: tokens / 2,
            output: tokens / 2,
            ..Default::default()
        }
        .with_total();
        r.complete = true;
        r
    }

    fn kinds(outcomes: &[WriteOutcome]) -> Vec<WriteKind> {
        outcomes.iter().map(|o| o.kind).collect()
    }

    #[test]
    fn test_insert_then_identical_upsert_is_noop() {
        let store = CacheStore::open_in_memory().unwrap();
        let record = create_test_record("s1", "alpha", 1000);

        let first = store.upsert_batch(&[record.clone()]).unwrap();
        assert_eq!(kinds(&first), vec![WriteKind::Inserted]);

        let second = store.upsert_batch(&[record.clone()]).unwrap();
        assert_eq!(kinds(&second), vec![WriteKind::Unchanged]);

        let loaded = store.get_session("s1").unwrap().unwrap();
        assert_eq!(loaded.tokens.total, 1000);
        assert_eq!(loaded.fingerprint, record.fingerprint);
    }

    #[test]
    fn test_settled_totals_not_rewritten_for_same_fingerprint() {
        let store = CacheStore::open_in_memory().unwrap();
        let record = create_test_record("s1", "alpha", 1000);
        store.upsert_batch(&[record.clone()]).unwrap();

        let mut drifted = record.clone();
        drifted.tokens = TokenTotals {
            input: 1,
            ..Default::default()
        }
        .with_total();
        let outcome = store.upsert_batch(&[drifted]).unwrap();
        assert_eq!(kinds(&outcome), vec![WriteKind::Unchanged]);
        assert_eq!(store.get_session("s1").unwrap().unwrap().tokens.total, 1000);

        let mut grown = record;
        grown.fingerprint = Fingerprint::new(2000, grown.fingerprint.modified_ns + 1);
        grown.tokens.input += 500;
        grown.tokens = grown.tokens.with_total();
        let outcome = store.upsert_batch(&[grown]).unwrap();
        assert_eq!(kinds(&outcome), vec![WriteKind::Updated]);
        assert_eq!(store.get_session("s1").unwrap().unwrap().tokens.total, 1500);
    }

    #[test]
    fn test_stub_never_overwrites_full_record() {
        let store = CacheStore::open_in_memory().unwrap();
        let record = create_test_record("s1", "alpha", 1000);
        store.upsert_batch(&[record.clone()]).unwrap();

        let stub = SessionRecord::placeholder(
            "s1",
            Source::ClaudeCode,
            record.source_path.clone(),
            Fingerprint::new(5, 5),
        );
        let outcome = store.upsert_batch(&[stub]).unwrap();
        assert_eq!(kinds(&outcome), vec![WriteKind::Unchanged]);
        assert!(store.get_session("s1").unwrap().unwrap().complete);
    }

    #[test]
    fn test_stub_counts_as_pending() {
        let store = CacheStore::open_in_memory().unwrap();
        let stub = SessionRecord::placeholder(
            "s1",
            Source::Codex,
            PathBuf::from("/logs/s1.jsonl"),
            Fingerprint::new(5, 5),
        );
        store.upsert_batch(&[stub]).unwrap();

        let snap = store.query(&Scope::All).unwrap();
        assert_eq!(snap.sessions, 0);
        assert_eq!(snap.pending_sessions, 1);
    }

    #[test]
    fn test_failed_parse_keeps_prior_content_and_leaves_aggregates() {
        let store = CacheStore::open_in_memory().unwrap();
        let record = create_test_record("s1", "alpha", 1000);
        store.upsert_batch(&[record.clone()]).unwrap();

        let mut failed = record.clone();
        failed.fingerprint = Fingerprint::new(3, 42);
        failed.tokens = TokenTotals::default();
        failed.parse_error = Some("no recognizable records".into());
        let outcome = store.upsert_batch(&[failed]).unwrap();
        assert_eq!(kinds(&outcome), vec![WriteKind::Updated]);

        let loaded = store.get_session("s1").unwrap().unwrap();
        assert_eq!(loaded.fingerprint, Fingerprint::new(3, 42));
        assert_eq!(loaded.tokens.total, 1000, "salvaged content kept");
        assert_eq!(
            loaded.parse_error.as_deref(),
            Some("no recognizable records")
        );

        let snap = store.query(&Scope::project("alpha")).unwrap();
        assert_eq!(snap.sessions, 0);
        assert_eq!(snap.tokens.total, 0);
        assert_eq!(snap.failed_sessions, 1);
    }

    #[test]
    fn test_new_failed_file_is_retained() {
        let store = CacheStore::open_in_memory().unwrap();
        let mut failed = SessionRecord::placeholder(
            "bad",
            Source::ClaudeCode,
            PathBuf::from("/logs/bad.jsonl"),
            Fingerprint::new(12, 7),
        );
        failed.parse_error = Some("garbage".into());
        store.upsert_batch(&[failed]).unwrap();

        let loaded = store.get_session("bad").unwrap().unwrap();
        assert!(loaded.complete);
        assert_eq!(loaded.parse_error.as_deref(), Some("garbage"));

        let fps = store.load_fingerprints().unwrap();
        assert_eq!(fps.len(), 1);
        assert!(fps[0].has_error);
        assert_eq!(store.query(&Scope::All).unwrap().sessions, 0);
    }

    #[test]
    fn test_success_clears_parse_error() {
        let store = CacheStore::open_in_memory().unwrap();
        let mut failed = create_test_record("s1", "alpha", 0);
        failed.parse_error = Some("boom".into());
        store.upsert_batch(&[failed]).unwrap();

        let mut fixed = create_test_record("s1", "alpha", 10);
        fixed.fingerprint = Fingerprint::new(2000, 1);
        store.upsert_batch(&[fixed]).unwrap();

        let loaded = store.get_session("s1").unwrap().unwrap();
        assert!(loaded.parse_error.is_none());
        assert_eq!(store.query(&Scope::All).unwrap().sessions, 1);
    }

    #[test]
    fn test_query_scopes() {
        let store = CacheStore::open_in_memory().unwrap();
        let a = create_test_record("a", "alpha", 1000);
        let mut b = create_test_record("b", "beta", 300);
        b.created_at = a.created_at + ChronoDuration::days(2);
        b.updated_at = b.created_at + ChronoDuration::minutes(5);
        b.has_terminal_session = true;
        store.upsert_batch(&[a.clone(), b.clone()]).unwrap();

        let all = store.query(&Scope::All).unwrap();
        assert_eq!(all.sessions, 2);
        assert_eq!(all.tokens.total, 1300);
        assert_eq!(all.messages.total(), 20);
        assert_eq!(all.terminal_sessions, 1);
        assert_eq!(all.first_created_at, Some(a.created_at));
        assert_eq!(all.last_updated_at, Some(b.updated_at));

        let alpha = store.query(&Scope::project("alpha")).unwrap();
        assert_eq!(alpha.sessions, 1);
        assert_eq!(alpha.tokens.total, 1000);

        let both = store.query(&Scope::projects(["alpha", "beta"])).unwrap();
        assert_eq!(both.sessions, 2);

        let day_one = Scope::date_range(
            a.created_at - ChronoDuration::hours(1),
            a.created_at + ChronoDuration::days(1),
            DateDimension::CreatedAt,
        );
        let snap = store.query(&day_one).unwrap();
        assert_eq!(snap.sessions, 1);
        assert_eq!(snap.tokens.total, 1000);

        let empty = store.query(&Scope::Project(Default::default())).unwrap();
        assert_eq!(empty, AggregateSnapshot::default());
    }

    #[test]
    fn test_delete() {
        let store = CacheStore::open_in_memory().unwrap();
        store
            .upsert_batch(&[
                create_test_record("a", "alpha", 10),
                create_test_record("b", "alpha", 20),
            ])
            .unwrap();

        assert_eq!(store.delete(&["a".to_string(), "zzz".to_string()]).unwrap(), 1);
        let snap = store.query(&Scope::project("alpha")).unwrap();
        assert_eq!(snap.sessions, 1);
        assert_eq!(snap.tokens.total, 20);
    }

    #[test]
    fn test_apply_batch_mixes_upserts_and_deletes() {
        let store = CacheStore::open_in_memory().unwrap();
        store
            .upsert_batch(&[create_test_record("gone", "alpha", 10)])
            .unwrap();

        let outcomes = store
            .apply_batch(
                &[create_test_record("fresh", "alpha", 20)],
                &["gone".to_string(), "never-existed".to_string()],
            )
            .unwrap();
        assert_eq!(
            outcomes,
            vec![
                WriteOutcome {
                    session_id: "gone".into(),
                    kind: WriteKind::Deleted
                },
                WriteOutcome {
                    session_id: "fresh".into(),
                    kind: WriteKind::Inserted
                },
            ]
        );
        assert_eq!(store.count_sessions().unwrap(), 1);
    }

    #[test]
    fn test_moved_file_survives_delete_of_its_old_path() {
        let store = CacheStore::open_in_memory().unwrap();
        store
            .upsert_batch(&[create_test_record("moved", "alpha", 10)])
            .unwrap();

        let mut relocated = create_test_record("moved", "alpha", 10);
        relocated.source_path = PathBuf::from("/logs/elsewhere/moved.jsonl");
        store
            .apply_batch(&[relocated], &["moved".to_string()])
            .unwrap();

        let row = store.get_session("moved").unwrap().unwrap();
        assert_eq!(row.source_path, PathBuf::from("/logs/elsewhere/moved.jsonl"));
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let store = CacheStore::open_in_memory().unwrap();
        store
            .writer
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_boom BEFORE INSERT ON sessions
                 WHEN NEW.session_id = 'boom'
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();

        let result = store.upsert_batch(&[
            create_test_record("ok", "alpha", 10),
            create_test_record("boom", "alpha", 10),
        ]);
        assert!(matches!(result, Err(Error::Database(_))));
        assert_eq!(store.count_sessions().unwrap(), 0);
    }

    #[test]
    fn test_external_fields_survive_reparse() {
        let store = CacheStore::open_in_memory().unwrap();
        let record = create_test_record("s1", "alpha", 10);
        store.upsert_batch(&[record.clone()]).unwrap();

        store
            .set_external_field("s1", &ExternalField::Title(Some("Refactor".into())))
            .unwrap();
        store
            .set_external_field("s1", &ExternalField::Pinned(true))
            .unwrap();

        let loaded = store.get_session("s1").unwrap().unwrap();
        assert_eq!(loaded.fingerprint, record.fingerprint);

        let mut grown = record;
        grown.fingerprint = Fingerprint::new(5000, 9);
        store.upsert_batch(&[grown]).unwrap();

        let loaded = store.get_session("s1").unwrap().unwrap();
        assert_eq!(loaded.title.as_deref(), Some("Refactor"));
        assert!(loaded.pinned);
        assert_eq!(loaded.fingerprint.size, 5000);

        let err = store
            .set_external_field("missing", &ExternalField::Pinned(true))
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[test]
    fn test_fetch_fingerprints() {
        let store = CacheStore::open_in_memory().unwrap();
        let record = create_test_record("s1", "alpha", 10);
        store.upsert_batch(&[record.clone()]).unwrap();

        let found = store
            .fetch_fingerprints(&[record.source_path.clone(), PathBuf::from("/nope.jsonl")])
            .unwrap();
        assert_eq!(found.len(), 1);
        let cached = &found[&record.source_path];
        assert_eq!(cached.session_id, "s1");
        assert_eq!(cached.fingerprint, record.fingerprint);
        assert_eq!(cached.schema_version, RECORD_SCHEMA_VERSION);
        assert_eq!(cached.project.as_deref(), Some("alpha"));
        assert!(cached.complete);
    }

    #[test]
    fn test_path_reassigned_to_new_session_id() {
        let store = CacheStore::open_in_memory().unwrap();
        let old = create_test_record("old", "alpha", 10);
        store.upsert_batch(&[old.clone()]).unwrap();

        let mut new = create_test_record("new", "alpha", 10);
        new.source_path = old.source_path.clone();
        store.upsert_batch(&[new]).unwrap();

        assert!(store.get_session("old").unwrap().is_none());
        assert!(store.get_session("new").unwrap().is_some());
    }

    #[test]
    fn test_file_store_reader_sees_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/index.db");
        let store = CacheStore::open(&path).unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
        assert_eq!(
            store.schema_version().unwrap(),
            super::super::schema::SCHEMA_VERSION
        );

        store
            .upsert_batch(&[create_test_record("s1", "alpha", 10)])
            .unwrap();
        assert_eq!(store.query(&Scope::All).unwrap().sessions, 1);
        assert_eq!(store.list_sessions(&Scope::All, 10).unwrap().len(), 1);
        drop(store);

        let reopened = CacheStore::open(&path).unwrap();
        assert_eq!(reopened.count_sessions().unwrap(), 1);
    }
}
