//! Claude Code JSONL parser
//!
//! Parses session logs from `~/.claude/projects/[encoded-path]/[session-id].jsonl`.
//! The folder name is the session's working directory with every
//! non-alphanumeric character replaced by `-`.
//!
//! # Counting rules
//!
//! - `user` lines: text counts as a user message; `tool_result` blocks count
//!   as tool messages; meta lines and command wrappers count as other.
//! - `assistant` lines: text blocks count as assistant, `tool_use` as tool,
//!   `thinking` as reasoning.
//! - Assistant usage is written once per streamed block but belongs to the
//!   message, so it is summed once per `message.id`.
//! - Sidechain (subagent) lines are recognized but not counted.

use crate::catalog::root_glob;
use crate::ingest::parser::{
    project_from_cwd, LineKind, LineScanner, SessionAccumulator, SessionParser, SourcePattern,
};
use crate::types::{Role, Scope, Source, TokenTotals};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

/// How far into a log to look for its working directory before parsing.
const CWD_PEEK_LINES: usize = 32;
const CWD_PEEK_BYTES: u64 = 256 * 1024;

/// Parser for Claude Code JSONL logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClaudeCodeParser;

impl ClaudeCodeParser {
    pub fn new() -> Self {
        Self
    }
}

// ============================================
// Raw JSONL record types (serde deserialization)
// ============================================

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawRecord {
    #[serde(rename = "type")]
    record_type: Option<String>,
    timestamp: Option<String>,
    cwd: Option<String>,
    is_sidechain: Option<bool>,
    is_meta: Option<bool>,
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawMessage {
    id: Option<String>,
    content: Option<RawContent>,
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(default)]
        name: String,
    },
    #[serde(rename = "tool_result")]
    ToolResult {},
    #[serde(rename = "thinking")]
    Thinking {},
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
}

/// Tools that run commands in a shell
const TERMINAL_TOOLS: &[&str] = &["Bash", "BashOutput", "KillShell"];

/// User-role text that is CLI plumbing rather than typed input.
fn is_injected_context(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with("<command-name>")
        || trimmed.starts_with("<command-message>")
        || trimmed.starts_with("<local-command-stdout>")
        || trimmed.starts_with("<local-command-stderr>")
        || trimmed.starts_with("<system-reminder>")
        || trimmed.starts_with("Caveat: The messages below were generated")
}

fn is_review_command(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with("/review") || trimmed.contains("<command-name>/review")
}

#[derive(Deserialize)]
struct CwdOnly {
    cwd: Option<String>,
}

/// First working directory stated near the top of a log.
fn peek_cwd(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    BufReader::new(file.take(CWD_PEEK_BYTES))
        .lines()
        .take(CWD_PEEK_LINES)
        .map_while(|line| line.ok())
        .find_map(|line| {
            serde_json::from_str::<CwdOnly>(&line)
                .ok()?
                .cwd
                .filter(|cwd| !cwd.is_empty())
        })
}

/// Encode a directory name the way Claude Code names project folders.
pub(crate) fn encode_project_dir(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

impl SessionParser for ClaudeCodeParser {
    fn source(&self) -> Source {
        Source::ClaudeCode
    }

    fn source_patterns(&self) -> Vec<SourcePattern> {
        vec![SourcePattern {
            pattern: "projects/*/*.jsonl".to_string(),
            description: "Claude Code session logs".to_string(),
        }]
    }

    fn session_id(&self, path: &Path) -> Option<String> {
        path.file_stem()?.to_str().map(String::from)
    }

    fn project_hint(&self, path: &Path) -> Option<String> {
        self.working_directory_hint(path)
            .and_then(|p| p.file_name().and_then(|s| s.to_str()).map(String::from))
    }

    fn working_directory_hint(&self, path: &Path) -> Option<PathBuf> {
        // "-home-user-dev-myproject" -> "/home/user/dev/myproject"; lossy when
        // the original path contained dashes
        let folder = path.parent()?.file_name()?.to_str()?;
        if !folder.starts_with('-') {
            return None;
        }
        Some(PathBuf::from(folder.replace('-', "/")))
    }

    fn scope_patterns(&self, root: &Path, scope: &Scope) -> Vec<String> {
        match scope {
            Scope::All => vec![root_glob(root, "projects/*/*.jsonl")],
            Scope::Project(ids) => ids
                .iter()
                .map(|id| {
                    root_glob(
                        root,
                        &format!("projects/*-{}/*.jsonl", encode_project_dir(id)),
                    )
                })
                .collect(),
            Scope::DateRange { start, .. } => {
                // A folder gains an entry when a session starts in it, so
                // folders untouched since `start` hold no new sessions.
                let Ok(entries) = std::fs::read_dir(root.join("projects")) else {
                    return Vec::new();
                };
                entries
                    .flatten()
                    .filter_map(|entry| {
                        let meta = entry.metadata().ok()?;
                        if !meta.is_dir() {
                            return None;
                        }
                        let modified: chrono::DateTime<chrono::Utc> = meta.modified().ok()?.into();
                        (modified >= *start).then(|| root_glob(&entry.path(), "*.jsonl"))
                    })
                    .collect()
            }
        }
    }

    fn admits(&self, path: &Path, scope: &Scope) -> bool {
        let Scope::Project(ids) = scope else {
            return true;
        };
        // "-w-alpha-beta" is either /w/alpha-beta or /w/alpha/beta; the
        // logged cwd decides, the folder name is the fallback
        peek_cwd(path)
            .as_deref()
            .and_then(project_from_cwd)
            .or_else(|| self.project_hint(path))
            .is_some_and(|project| ids.contains(&project))
    }

    fn new_scanner(&self) -> Box<dyn LineScanner> {
        Box::new(ClaudeScanner::default())
    }
}

#[derive(Default)]
struct ClaudeScanner {
    usage_seen: HashSet<String>,
}

impl ClaudeScanner {
    fn scan_user(&mut self, raw: &RawRecord, acc: &mut SessionAccumulator) {
        let Some(content) = raw.message.as_ref().and_then(|m| m.content.as_ref()) else {
            return;
        };
        let meta = raw.is_meta.unwrap_or(false);

        let count_text = |text: &str, acc: &mut SessionAccumulator| {
            if is_review_command(text) {
                acc.has_review_activity = true;
            }
            if meta || is_injected_context(text) {
                acc.count(Role::Other);
            } else {
                acc.count(Role::User);
            }
        };

        match content {
            RawContent::Text(text) => count_text(text, acc),
            RawContent::Blocks(blocks) => {
                let mut has_text = None;
                for block in blocks {
                    match block {
                        ContentBlock::ToolResult { .. } => acc.count(Role::Tool),
                        ContentBlock::Text { text } if has_text.is_none() => {
                            has_text = Some(text.as_str())
                        }
                        _ => {}
                    }
                }
                if let Some(text) = has_text {
                    count_text(text, acc);
                }
            }
        }
    }

    fn scan_assistant(&mut self, raw: &RawRecord, acc: &mut SessionAccumulator) {
        let Some(message) = raw.message.as_ref() else {
            return;
        };

        if let Some(usage) = &message.usage {
            let first_time = match &message.id {
                Some(id) => self.usage_seen.insert(id.clone()),
                None => true,
            };
            if first_time {
                acc.tokens.add(TokenTotals {
                    input: usage.input_tokens.unwrap_or(0),
                    output: usage.output_tokens.unwrap_or(0),
                    cache_creation: usage.cache_creation_input_tokens.unwrap_or(0),
                    cache_read: usage.cache_read_input_tokens.unwrap_or(0),
                    total: 0,
                });
            }
        }

        match &message.content {
            Some(RawContent::Text(_)) => acc.count(Role::Assistant),
            Some(RawContent::Blocks(blocks)) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text { .. } => acc.count(Role::Assistant),
                        ContentBlock::ToolUse { name } => {
                            if TERMINAL_TOOLS.contains(&name.as_str()) {
                                acc.has_terminal_session = true;
                            }
                            acc.count(Role::Tool);
                        }
                        ContentBlock::Thinking { .. } => acc.count(Role::Reasoning),
                        ContentBlock::ToolResult { .. } | ContentBlock::Unknown => {}
                    }
                }
            }
            None => {}
        }
    }
}

impl LineScanner for ClaudeScanner {
    fn scan_line(&mut self, line: &str, acc: &mut SessionAccumulator) -> LineKind {
        let raw: RawRecord = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => return LineKind::Malformed(e.to_string()),
        };
        let Some(record_type) = raw.record_type.as_deref() else {
            return LineKind::Skipped;
        };

        if raw.is_sidechain == Some(true) {
            return LineKind::Record;
        }

        if let Some(ts) = &raw.timestamp {
            acc.observe_rfc3339(ts);
        }
        if let Some(cwd) = &raw.cwd {
            acc.set_cwd(cwd);
        }

        match record_type {
            "user" => self.scan_user(&raw, acc),
            "assistant" => self.scan_assistant(&raw, acc),
            "system" => acc.count(Role::Other),
            _ => {}
        }
        LineKind::Record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenTotals;
    use chrono::TimeZone;

    fn scan(lines: &[&str]) -> (SessionAccumulator, Vec<LineKind>) {
        let mut acc = SessionAccumulator::new(300);
        let mut scanner = ClaudeCodeParser.new_scanner();
        let kinds = lines.iter().map(|l| scanner.scan_line(l, &mut acc)).collect();
        scanner.finish(&mut acc);
        (acc, kinds)
    }

    #[test]
    fn test_extract_session_id() {
        let path = PathBuf::from(
            "/home/u/.claude/projects/-home-u-dev-alpha/3f2a9c1e-1111-2222-3333-444455556666.jsonl",
        );
        assert_eq!(
            ClaudeCodeParser.session_id(&path).as_deref(),
            Some("3f2a9c1e-1111-2222-3333-444455556666")
        );
        assert_eq!(ClaudeCodeParser.project_hint(&path).as_deref(), Some("alpha"));
        assert_eq!(
            ClaudeCodeParser.working_directory_hint(&path),
            Some(PathBuf::from("/home/u/dev/alpha"))
        );
    }

    #[test]
    fn test_encode_project_dir() {
        assert_eq!(encode_project_dir("my_proj.v2"), "my-proj-v2");
        assert_eq!(encode_project_dir("alpha"), "alpha");
    }

    #[test]
    fn test_counts_roles() {
        let (acc, kinds) = scan(&[
            r#"{"type":"user","timestamp":"2025-01-01T10:00:00Z","cwd":"/work/alpha","message":{"role":"user","content":"fix the bug"}}"#,
            r#"{"type":"assistant","timestamp":"2025-01-01T10:00:05Z","message":{"id":"m1","content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"ok"},{"type":"tool_use","id":"t1","name":"Bash","input":{}}]}}"#,
            r#"{"type":"user","timestamp":"2025-01-01T10:00:06Z","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"done"}]}}"#,
            r#"{"type":"system","timestamp":"2025-01-01T10:00:07Z","content":"compacted"}"#,
            r#"{"type":"summary","summary":"Bug fix"}"#,
        ]);

        assert!(kinds.iter().all(|k| *k == LineKind::Record));
        assert_eq!(acc.messages.user, 1);
        assert_eq!(acc.messages.assistant, 1);
        assert_eq!(acc.messages.tool, 2);
        assert_eq!(acc.messages.reasoning, 1);
        assert_eq!(acc.messages.other, 1);
        assert!(acc.has_terminal_session);
        assert!(!acc.has_review_activity);
        assert_eq!(acc.cwd.as_deref(), Some("/work/alpha"));
        assert_eq!(
            acc.first_at(),
            Some(chrono::Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(acc.active_time_ms(), 7_000);
    }

    #[test]
    fn test_usage_counted_once_per_message_id() {
        let usage = r#""usage":{"input_tokens":100,"output_tokens":50,"cache_read_input_tokens":1000,"cache_creation_input_tokens":10}"#;
        let a = format!(
            r#"{{"type":"assistant","message":{{"id":"m1","content":[{{"type":"text","text":"a"}}],{usage}}}}}"#
        );
        let b = format!(
            r#"{{"type":"assistant","message":{{"id":"m1","content":[{{"type":"tool_use","name":"Read"}}],{usage}}}}}"#
        );
        let c = format!(
            r#"{{"type":"assistant","message":{{"id":"m2","content":[{{"type":"text","text":"c"}}],{usage}}}}}"#
        );
        let (acc, _) = scan(&[&a, &b, &c]);

        assert_eq!(
            acc.tokens.with_total(),
            TokenTotals {
                input: 200,
                output: 100,
                cache_read: 2000,
                cache_creation: 20,
                total: 2320,
            }
        );
    }

    #[test]
    fn test_review_and_injected_context() {
        let (acc, _) = scan(&[
            r#"{"type":"user","message":{"content":"<command-name>/review</command-name>"}}"#,
            r#"{"type":"user","isMeta":true,"message":{"content":"Caveat: The messages below were generated by the user"}}"#,
        ]);
        assert!(acc.has_review_activity);
        assert_eq!(acc.messages.other, 2);
        assert_eq!(acc.messages.user, 0);
    }

    #[test]
    fn test_sidechain_not_counted() {
        let (acc, kinds) = scan(&[
            r#"{"type":"user","isSidechain":true,"message":{"content":"subagent prompt"}}"#,
        ]);
        assert_eq!(kinds, vec![LineKind::Record]);
        assert_eq!(acc.messages.total(), 0);
    }

    #[test]
    fn test_malformed_and_foreign_lines() {
        let (_, kinds) = scan(&[r#"{"type":"user","message":"#, r#"{"foo":1}"#]);
        assert!(matches!(kinds[0], LineKind::Malformed(_)));
        assert_eq!(kinds[1], LineKind::Skipped);
    }

    #[test]
    fn test_usage_saturates_instead_of_overflowing() {
        let line = |id: &str| {
            format!(
                r#"{{"type":"assistant","message":{{"id":"{id}","content":"x","usage":{{"input_tokens":{},"output_tokens":1}}}}}}"#,
                u64::MAX
            )
        };
        let (acc, _) = scan(&[&line("m1"), &line("m2")]);
        let tokens = acc.tokens.with_total();
        assert_eq!(tokens.input, u64::MAX);
        assert_eq!(tokens.total, u64::MAX);
    }

    #[test]
    fn test_project_scope_admits_by_logged_cwd() {
        let dir = tempfile::TempDir::new().unwrap();
        let folder = dir.path().join("projects/-w-alpha-beta");
        std::fs::create_dir_all(&folder).unwrap();

        let nested = folder.join("nested.jsonl");
        std::fs::write(
            &nested,
            "{\"type\":\"summary\",\"summary\":\"s\"}\n{\"type\":\"user\",\"cwd\":\"/w/alpha/beta\",\"message\":{\"content\":\"hi\"}}\n",
        )
        .unwrap();
        let dashed = folder.join("dashed.jsonl");
        std::fs::write(
            &dashed,
            "{\"type\":\"user\",\"cwd\":\"/w/alpha-beta\",\"message\":{\"content\":\"hi\"}}\n",
        )
        .unwrap();
        // No cwd anywhere: the folder name decides
        let bare = folder.join("bare.jsonl");
        std::fs::write(&bare, "{\"type\":\"summary\",\"summary\":\"s\"}\n").unwrap();

        let beta = Scope::project("beta");
        assert!(ClaudeCodeParser.admits(&nested, &beta));
        assert!(!ClaudeCodeParser.admits(&dashed, &beta));
        assert!(ClaudeCodeParser.admits(&dashed, &Scope::project("alpha-beta")));
        assert!(ClaudeCodeParser.admits(&bare, &beta));
        assert!(ClaudeCodeParser.admits(&dashed, &Scope::All));
    }

    #[test]
    fn test_scope_patterns_for_project() {
        let patterns =
            ClaudeCodeParser.scope_patterns(Path::new("/r"), &Scope::projects(["alpha", "my_app"]));
        assert_eq!(
            patterns,
            vec![
                "/r/projects/*-alpha/*.jsonl".to_string(),
                "/r/projects/*-my-app/*.jsonl".to_string()
            ]
        );
    }
}
