//! Aider chat history parser
//!
//! Parses `<project>/.aider.chat.history.md`. One file per project directory
//! accumulates every chat started there, so one file is one record.
//!
//! Recognized lines:
//!
//! | Prefix | Meaning |
//! |--------|---------|
//! | `# aider chat started at` | chat boundary, local timestamp |
//! | `#### ` | user input |
//! | `> Tokens:` | per-request token report |
//! | `> Running ` | shell command run by aider |
//! | `> Applied edit to` | file edit |
//! | other `> ` | tool output / status |
//!
//! Any other line after the first chat header is assistant prose; a run of
//! prose lines counts as one assistant message.

use crate::catalog::root_glob;
use crate::ingest::parser::{
    LineKind, LineScanner, SessionAccumulator, SessionParser, SourcePattern,
};
use crate::types::{Role, Scope, Source};
use chrono::{NaiveDateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const HISTORY_FILE: &str = ".aider.chat.history.md";
const CHAT_HEADER: &str = "# aider chat started at ";

/// Parser for Aider chat history files.
#[derive(Debug, Default, Clone, Copy)]
pub struct AiderParser;

impl AiderParser {
    pub fn new() -> Self {
        Self
    }
}

impl SessionParser for AiderParser {
    fn source(&self) -> Source {
        Source::Aider
    }

    fn source_patterns(&self) -> Vec<SourcePattern> {
        vec![SourcePattern {
            pattern: format!("*/{HISTORY_FILE}"),
            description: "Aider chat history".to_string(),
        }]
    }

    /// The file name carries no id, so hash the path.
    fn session_id(&self, path: &Path) -> Option<String> {
        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        let digest = hex::encode(hasher.finalize());
        Some(format!("aider-{}", &digest[..16]))
    }

    fn project_hint(&self, path: &Path) -> Option<String> {
        path.parent()?.file_name()?.to_str().map(String::from)
    }

    fn working_directory_hint(&self, path: &Path) -> Option<PathBuf> {
        path.parent().map(Path::to_path_buf)
    }

    fn scope_patterns(&self, root: &Path, scope: &Scope) -> Vec<String> {
        match scope {
            Scope::All => vec![root_glob(root, &format!("*/{HISTORY_FILE}"))],
            Scope::Project(ids) => ids
                .iter()
                .map(|id| {
                    root_glob(
                        root,
                        &format!("{}/{HISTORY_FILE}", glob::Pattern::escape(id)),
                    )
                })
                .collect(),
            // A history file's mtime says nothing about when its first chat
            // started; leave date scopes to the cache and the watcher.
            Scope::DateRange { .. } => Vec::new(),
        }
    }

    fn new_scanner(&self) -> Box<dyn LineScanner> {
        Box::new(AiderScanner::default())
    }
}

/// Parse "2.4k", "1.1M" or "300" into a token count.
fn parse_count(raw: &str) -> Option<u64> {
    let raw = raw.trim().replace(',', "");
    let (digits, scale) = match raw.chars().last()? {
        'k' | 'K' => (&raw[..raw.len() - 1], 1_000.0),
        'm' | 'M' => (&raw[..raw.len() - 1], 1_000_000.0),
        _ => (raw.as_str(), 1.0),
    };
    let value: f64 = digits.parse().ok()?;
    Some((value * scale).round() as u64)
}

#[derive(Default)]
struct AiderScanner {
    started: bool,
    in_prose: bool,
}

impl AiderScanner {
    /// `> Tokens: 2.4k sent, 1.1k cache write, 300 cache hit, 512 received. Cost: ...`
    fn scan_tokens(report: &str, acc: &mut SessionAccumulator) -> LineKind {
        let report = report.split(". ").next().unwrap_or(report);
        let report = report.trim_end_matches('.');
        let mut recognized = false;

        for part in report.split(", ") {
            let Some((count, label)) = part.trim().split_once(' ') else {
                continue;
            };
            let Some(count) = parse_count(count) else {
                continue;
            };
            match label.trim() {
                "sent" => acc.tokens.input = acc.tokens.input.saturating_add(count),
                "received" => acc.tokens.output = acc.tokens.output.saturating_add(count),
                "cache write" => {
                    acc.tokens.cache_creation = acc.tokens.cache_creation.saturating_add(count)
                }
                "cache hit" => acc.tokens.cache_read = acc.tokens.cache_read.saturating_add(count),
                _ => continue,
            }
            recognized = true;
        }

        if recognized {
            LineKind::Record
        } else {
            LineKind::Malformed(format!("unreadable token report: {report}"))
        }
    }
}

impl LineScanner for AiderScanner {
    fn scan_line(&mut self, line: &str, acc: &mut SessionAccumulator) -> LineKind {
        if let Some(stamp) = line.strip_prefix(CHAT_HEADER) {
            self.started = true;
            self.in_prose = false;
            return match NaiveDateTime::parse_from_str(stamp.trim(), "%Y-%m-%d %H:%M:%S") {
                Ok(naive) => {
                    acc.observe_timestamp(Utc.from_utc_datetime(&naive));
                    LineKind::Record
                }
                Err(e) => LineKind::Malformed(format!("bad chat timestamp: {e}")),
            };
        }

        if !self.started {
            return LineKind::Skipped;
        }

        if line.starts_with("#### ") {
            self.in_prose = false;
            acc.count(Role::User);
            return LineKind::Record;
        }

        if let Some(status) = line.strip_prefix('>') {
            self.in_prose = false;
            let status = status.trim_start();
            if let Some(report) = status.strip_prefix("Tokens:") {
                return Self::scan_tokens(report.trim(), acc);
            }
            if status.starts_with("Running ") {
                acc.has_terminal_session = true;
                acc.count(Role::Tool);
            } else if status.starts_with("Applied edit to") {
                acc.count(Role::Tool);
            }
            return LineKind::Record;
        }

        if !self.in_prose {
            self.in_prose = true;
            acc.count(Role::Assistant);
        }
        LineKind::Record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HISTORY: &str = "\
# aider chat started at 2025-02-01 09:00:00

> Aider v0.60.0
> Model: claude-3-5-sonnet with diff edit format

#### add a health check endpoint

Sure, here is the change.

server.py
> Applied edit to server.py
> Tokens: 2.4k sent, 1.1k cache write, 300 cache hit, 512 received. Cost: $0.01 message, $0.01 session.

#### run the tests

> Running pytest -q
> Tokens: 1k sent, 200 received.
";

    fn scan(text: &str) -> (SessionAccumulator, Vec<LineKind>) {
        let mut acc = SessionAccumulator::new(300);
        let mut scanner = AiderParser.new_scanner();
        let kinds = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| scanner.scan_line(l, &mut acc))
            .collect();
        (acc, kinds)
    }

    #[test]
    fn test_history_counts() {
        let (acc, kinds) = scan(HISTORY);
        assert!(kinds.iter().all(|k| *k == LineKind::Record));
        assert_eq!(acc.messages.user, 2);
        assert_eq!(acc.messages.assistant, 1);
        assert_eq!(acc.messages.tool, 2);
        assert!(acc.has_terminal_session);
        assert_eq!(acc.tokens.input, 3400);
        assert_eq!(acc.tokens.output, 712);
        assert_eq!(acc.tokens.cache_creation, 1100);
        assert_eq!(acc.tokens.cache_read, 300);
        assert_eq!(
            acc.first_at(),
            Some(Utc.with_ymd_and_hms(2025, 2, 1, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_text_before_header_is_not_recognized() {
        let (acc, kinds) = scan("just some notes\nmore notes\n");
        assert_eq!(kinds, vec![LineKind::Skipped, LineKind::Skipped]);
        assert_eq!(acc.messages.total(), 0);
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("2.4k"), Some(2400));
        assert_eq!(parse_count("1.5M"), Some(1_500_000));
        assert_eq!(parse_count("300"), Some(300));
        assert_eq!(parse_count("lots"), None);
    }

    #[test]
    fn test_session_id_is_stable_and_path_derived() {
        let a = AiderParser.session_id(Path::new("/code/alpha/.aider.chat.history.md"));
        let b = AiderParser.session_id(Path::new("/code/alpha/.aider.chat.history.md"));
        let c = AiderParser.session_id(Path::new("/code/beta/.aider.chat.history.md"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.unwrap().len(), "aider-".len() + 16);
    }

    #[test]
    fn test_project_from_parent_dir() {
        let path = Path::new("/code/alpha/.aider.chat.history.md");
        assert_eq!(AiderParser.project_hint(path).as_deref(), Some("alpha"));
        assert_eq!(
            AiderParser.scope_patterns(Path::new("/code"), &Scope::project("alpha")),
            vec!["/code/alpha/.aider.chat.history.md".to_string()]
        );
    }
}
