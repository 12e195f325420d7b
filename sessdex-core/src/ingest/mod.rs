//! Record parsing
//!
//! [`RecordParser`] turns one log file into one [`SessionRecord`]. It streams
//! the file through a bounded buffer, so memory stays flat regardless of file
//! size, and delegates line interpretation to the source's
//! [`SessionParser`].
//!
//! ## Error handling
//!
//! - A malformed line is skipped and counted; parsing continues.
//! - An unterminated final line is ignored: the writer is probably mid-append.
//! - A file with content but no recognizable line at all is a fatal
//!   [`ParseError`]. The caller records the failure instead of storing zeros.

pub mod parser;
pub mod parsers;

pub use parser::{LineKind, LineScanner, SessionAccumulator, SessionParser, SourcePattern};

use crate::config::{ParseConfig, RootConfig};
use crate::error::ParseError;
use crate::ingest::parser::project_from_cwd;
use crate::types::{Fingerprint, SessionRecord, Source, RECORD_SCHEMA_VERSION};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::Arc;

/// Parses log files belonging to one configured root.
#[derive(Clone)]
pub struct RecordParser {
    parser: Arc<dyn SessionParser>,
    root: RootConfig,
    config: ParseConfig,
}

impl std::fmt::Debug for RecordParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordParser")
            .field("source", &self.parser.source())
            .field("root", &self.root.path)
            .finish()
    }
}

/// Line tallies for one parse pass.
#[derive(Debug, Default, Clone, Copy)]
struct LineStats {
    lines: usize,
    records: usize,
    malformed: usize,
}

impl RecordParser {
    /// Parser for `root`, using the built-in parser for its source.
    pub fn new(root: RootConfig, config: ParseConfig) -> Self {
        Self::with_parser(parsers::parser_for(root.source), root, config)
    }

    pub fn with_parser(
        parser: Arc<dyn SessionParser>,
        root: RootConfig,
        config: ParseConfig,
    ) -> Self {
        Self {
            parser,
            root,
            config,
        }
    }

    pub fn source(&self) -> Source {
        self.parser.source()
    }

    pub fn root(&self) -> &RootConfig {
        &self.root
    }

    pub fn session_parser(&self) -> &dyn SessionParser {
        self.parser.as_ref()
    }

    pub fn session_id(&self, path: &Path) -> Option<String> {
        self.parser.session_id(path)
    }

    /// Parse `path` into a complete record.
    ///
    /// The fingerprint is taken from the open handle and only bytes up to
    /// that size are read, so the record always describes the fingerprinted
    /// state even if the file keeps growing.
    pub fn parse(&self, path: &Path) -> Result<SessionRecord, ParseError> {
        let session_id = self
            .parser
            .session_id(path)
            .ok_or_else(|| ParseError::new(path, "cannot derive a session id from the path"))?;

        let file = File::open(path).map_err(|e| ParseError::new(path, format!("open: {e}")))?;
        let metadata = file
            .metadata()
            .map_err(|e| ParseError::new(path, format!("stat: {e}")))?;
        let fingerprint = Fingerprint::from_metadata(&metadata);

        if fingerprint.size == 0 {
            return Err(ParseError::new(path, "empty file"));
        }

        let limit = self
            .config
            .max_scan_bytes
            .map_or(fingerprint.size, |max| max.min(fingerprint.size));
        let truncated = limit < fingerprint.size;

        let capacity = self.config.read_buffer_kb.max(1) * 1024;
        let mut reader = BufReader::with_capacity(capacity, file.take(limit));
        let mut scanner = self.parser.new_scanner();
        let mut acc = SessionAccumulator::new(self.config.idle_gap_secs);
        let mut stats = LineStats::default();
        let mut buf = Vec::with_capacity(1024);

        loop {
            buf.clear();
            let n = reader
                .read_until(b'\n', &mut buf)
                .map_err(|e| ParseError::new(path, format!("read: {e}")))?;
            if n == 0 {
                break;
            }

            let terminated = buf.last() == Some(&b'\n');
            if !terminated && truncated {
                // Cut by the scan limit, not by the writer
                break;
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.trim().is_empty() {
                continue;
            }
            stats.lines += 1;

            match scanner.scan_line(line, &mut acc) {
                LineKind::Record => stats.records += 1,
                LineKind::Skipped => {}
                LineKind::Malformed(reason) if terminated => {
                    stats.malformed += 1;
                    tracing::debug!(
                        path = %path.display(),
                        line = stats.lines,
                        reason = %reason,
                        "Skipping malformed line"
                    );
                }
                LineKind::Malformed(_) => {
                    tracing::trace!(path = %path.display(), "Ignoring partial final line");
                }
            }
        }
        scanner.finish(&mut acc);

        if stats.records == 0 {
            return Err(ParseError::new(
                path,
                format!(
                    "no recognizable {} records in {} lines",
                    self.source().display_name(),
                    stats.lines
                ),
            ));
        }

        if stats.malformed > 0 {
            tracing::warn!(
                path = %path.display(),
                malformed = stats.malformed,
                records = stats.records,
                "Parsed with malformed lines skipped"
            );
        }

        Ok(self.build_record(session_id, path, fingerprint, acc, truncated))
    }

    fn build_record(
        &self,
        session_id: String,
        path: &Path,
        fingerprint: Fingerprint,
        acc: SessionAccumulator,
        scan_truncated: bool,
    ) -> SessionRecord {
        let mut record =
            SessionRecord::placeholder(session_id, self.source(), path.to_path_buf(), fingerprint);

        let created_at = acc.first_at().unwrap_or(record.created_at);
        let updated_at = acc.last_at().unwrap_or(record.updated_at);

        record.project = acc
            .cwd
            .as_deref()
            .and_then(project_from_cwd)
            .or_else(|| self.parser.project_hint(path));
        record.working_directory = match &acc.cwd {
            Some(cwd) => cwd.clone(),
            None => self
                .parser
                .working_directory_hint(path)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        record.remote_host = self.root.remote_host.clone();
        record.created_at = created_at;
        record.updated_at = updated_at;
        record.duration_ms = (updated_at - created_at).num_milliseconds().max(0);
        record.active_time_ms = acc.active_time_ms();
        record.messages = acc.messages;
        record.tokens = acc.tokens.with_total();
        record.has_terminal_session = acc.has_terminal_session;
        record.has_review_activity = acc.has_review_activity;
        record.schema_version = RECORD_SCHEMA_VERSION;
        record.complete = true;
        record.scan_truncated = scan_truncated;
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use std::fs;
    use tempfile::TempDir;

    /// Counts every line starting with `{` as a user message.
    struct BraceParser;

    struct BraceScanner;

    impl LineScanner for BraceScanner {
        fn scan_line(&mut self, line: &str, acc: &mut SessionAccumulator) -> LineKind {
            if line.starts_with('{') && line.ends_with('}') {
                acc.count(Role::User);
                acc.tokens.input += 10;
                LineKind::Record
            } else {
                LineKind::Malformed("not braced".into())
            }
        }
    }

    impl SessionParser for BraceParser {
        fn source(&self) -> Source {
            Source::ClaudeCode
        }
        fn source_patterns(&self) -> Vec<SourcePattern> {
            Vec::new()
        }
        fn session_id(&self, path: &Path) -> Option<String> {
            path.file_stem()?.to_str().map(String::from)
        }
        fn scope_patterns(&self, _root: &Path, _scope: &crate::types::Scope) -> Vec<String> {
            Vec::new()
        }
        fn new_scanner(&self) -> Box<dyn LineScanner> {
            Box::new(BraceScanner)
        }
    }

    fn parser(max_scan_bytes: Option<u64>) -> RecordParser {
        let mut root = RootConfig::new("/tmp", Source::ClaudeCode);
        root.remote_host = Some("devbox".into());
        RecordParser::with_parser(
            Arc::new(BraceParser),
            root,
            ParseConfig {
                max_scan_bytes,
                ..ParseConfig::default()
            },
        )
    }

    fn write(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_counts_and_fingerprint() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "s1.jsonl", "{a}\n{b}\n");

        let record = parser(None).parse(&path).unwrap();
        assert_eq!(record.session_id, "s1");
        assert_eq!(record.messages.user, 2);
        assert_eq!(record.tokens.total, 20);
        assert_eq!(record.fingerprint.size, 8);
        assert_eq!(record.remote_host.as_deref(), Some("devbox"));
        assert!(record.complete);
        assert!(!record.scan_truncated);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "s.jsonl", "{a}\ngarbage\n{b}\n");
        let record = parser(None).parse(&path).unwrap();
        assert_eq!(record.messages.user, 2);
    }

    #[test]
    fn test_partial_last_line_ignored() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "s.jsonl", "{a}\n{b}\n{trunc");
        let record = parser(None).parse(&path).unwrap();
        assert_eq!(record.messages.user, 2);
    }

    #[test]
    fn test_unterminated_complete_last_line_counts() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "s.jsonl", "{a}\n{b}");
        let record = parser(None).parse(&path).unwrap();
        assert_eq!(record.messages.user, 2);
    }

    #[test]
    fn test_scan_limit_stops_at_last_complete_line() {
        let dir = TempDir::new().unwrap();
        // limit lands inside the second line
        let path = write(&dir, "s.jsonl", "{a}\n{b}\n{c}\n");
        let record = parser(Some(6)).parse(&path).unwrap();
        assert_eq!(record.messages.user, 1);
        assert!(record.scan_truncated);
        assert_eq!(record.fingerprint.size, 12);
    }

    #[test]
    fn test_no_recognizable_lines_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "s.jsonl", "nope\nstill nope\n");
        let err = parser(None).parse(&path).unwrap_err();
        assert_eq!(err.path, path);
        assert!(err.cause.contains("no recognizable"));
    }

    #[test]
    fn test_empty_and_missing_files_fail() {
        let dir = TempDir::new().unwrap();
        let empty = write(&dir, "e.jsonl", "");
        assert!(parser(None).parse(&empty).is_err());
        assert!(parser(None).parse(&dir.path().join("missing.jsonl")).is_err());
    }

    #[test]
    fn test_timestamps_fall_back_to_mtime() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "s.jsonl", "{a}\n");
        let record = parser(None).parse(&path).unwrap();
        assert_eq!(record.created_at, record.fingerprint.modified_at());
        assert_eq!(record.duration_ms, 0);
    }
}
