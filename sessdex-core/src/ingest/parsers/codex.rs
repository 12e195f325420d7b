//! OpenAI Codex CLI JSONL parser
//!
//! Parses session logs from `~/.codex/sessions/YYYY/MM/DD/rollout-*.jsonl`.
//!
//! Token usage is reported as running totals in `event_msg/token_count`
//! records, so the last one seen wins. `input_tokens` includes cached input;
//! the cached part is split out into `cache_read`.
//!
//! Malformed lines are skipped; unknown record and item types are recognized
//! but not counted.

use crate::catalog::root_glob;
use crate::ingest::parser::{
    LineKind, LineScanner, SessionAccumulator, SessionParser, SourcePattern,
};
use crate::types::{Role, Scope, Source, TokenTotals};
use chrono::{Datelike, Duration, NaiveDate};
use serde::Deserialize;
use std::path::Path;

/// Date ranges longer than this are covered by month directories instead of
/// day directories.
const MAX_DAY_PATTERNS: i64 = 62;

/// Parser for OpenAI Codex CLI JSONL logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct CodexParser;

impl CodexParser {
    pub fn new() -> Self {
        Self
    }
}

/// Detect system-injected context sent under the "user" role.
fn is_system_injected_context(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.starts_with("<environment_context>")
        || trimmed.starts_with("<user_shell_command>")
        || trimmed.starts_with("<INSTRUCTIONS>")
        || trimmed.starts_with("<user_instructions>")
        || trimmed.starts_with("<system")
        || trimmed.starts_with("# AGENTS.md instructions for")
}

/// Function names that execute shell commands
const SHELL_FUNCTIONS: &[&str] = &["shell", "shell_command", "exec_command", "local_shell"];

// ============================================
// Raw JSONL record types (serde deserialization)
// ============================================

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawEvent {
    timestamp: Option<String>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct SessionMetaPayload {
    cwd: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct EventMsgPayload {
    #[serde(rename = "type")]
    msg_type: Option<String>,
    info: Option<TokenInfo>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TokenInfo {
    total_token_usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
#[serde(default)]
struct TokenUsage {
    input_tokens: Option<u64>,
    cached_input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

impl TokenUsage {
    fn to_totals(self) -> TokenTotals {
        let input = self.input_tokens.unwrap_or(0);
        let cached = self.cached_input_tokens.unwrap_or(0).min(input);
        TokenTotals {
            input: input - cached,
            output: self.output_tokens.unwrap_or(0),
            cache_read: cached,
            cache_creation: 0,
            total: 0,
        }
        .with_total()
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ResponseItemPayload {
    #[serde(rename = "type")]
    item_type: Option<String>,
    role: Option<String>,
    content: Option<Vec<ContentBlock>>,
    name: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "input_text")]
    InputText { text: String },
    #[serde(rename = "output_text")]
    OutputText { text: String },
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Unknown,
}

impl ContentBlock {
    fn text(&self) -> Option<&str> {
        match self {
            ContentBlock::InputText { text }
            | ContentBlock::OutputText { text }
            | ContentBlock::Text { text } => Some(text),
            ContentBlock::Unknown => None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TurnContextPayload {
    cwd: Option<String>,
}

impl SessionParser for CodexParser {
    fn source(&self) -> Source {
        Source::Codex
    }

    fn source_patterns(&self) -> Vec<SourcePattern> {
        vec![SourcePattern {
            pattern: "sessions/*/*/*/rollout-*.jsonl".to_string(),
            description: "Codex session logs".to_string(),
        }]
    }

    fn session_id(&self, path: &Path) -> Option<String> {
        // rollout-2025-11-24T19-33-35-019ab86e-1e83-75b0-b2d7-d335492e7026
        let stem = path.file_stem()?.to_str()?;
        let parts: Vec<&str> = stem.split('-').collect();
        for i in 0..parts.len().saturating_sub(4) {
            let candidate = &parts[i..];
            if candidate.len() >= 5
                && candidate[0].len() == 8
                && candidate[0].chars().all(|c| c.is_ascii_hexdigit())
            {
                return Some(candidate[..5].join("-"));
            }
        }
        Some(stem.to_string())
    }

    fn scope_patterns(&self, root: &Path, scope: &Scope) -> Vec<String> {
        match scope {
            Scope::All => vec![root_glob(root, "sessions/*/*/*/rollout-*.jsonl")],
            // The project lives inside the file, not in its path
            Scope::Project(_) => Vec::new(),
            Scope::DateRange { start, end, .. } => {
                // Directories are named in local time; widen by a day each side
                let first = (*start - Duration::days(1)).date_naive();
                let last = (*end + Duration::days(1)).date_naive();
                date_dir_patterns(root, first, last)
            }
        }
    }

    fn new_scanner(&self) -> Box<dyn LineScanner> {
        Box::new(CodexScanner::default())
    }
}

fn date_dir_patterns(root: &Path, first: NaiveDate, last: NaiveDate) -> Vec<String> {
    let days = (last - first).num_days();
    if days < 0 {
        return Vec::new();
    }

    let mut patterns = Vec::new();
    if days <= MAX_DAY_PATTERNS {
        let mut day = first;
        while day <= last {
            patterns.push(root_glob(
                root,
                &format!(
                    "sessions/{:04}/{:02}/{:02}/rollout-*.jsonl",
                    day.year(),
                    day.month(),
                    day.day()
                ),
            ));
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
    } else {
        let (mut year, mut month) = (first.year(), first.month());
        while (year, month) <= (last.year(), last.month()) {
            patterns.push(root_glob(
                root,
                &format!("sessions/{year:04}/{month:02}/*/rollout-*.jsonl"),
            ));
            if month == 12 {
                year += 1;
                month = 1;
            } else {
                month += 1;
            }
        }
    }
    patterns
}

#[derive(Default)]
struct CodexScanner {
    last_usage: Option<TokenUsage>,
}

impl CodexScanner {
    fn scan_response_item(&mut self, payload: serde_json::Value, acc: &mut SessionAccumulator) {
        let Ok(item) = serde_json::from_value::<ResponseItemPayload>(payload) else {
            return;
        };

        match item.item_type.as_deref() {
            Some("message") => {
                let text = item
                    .content
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(ContentBlock::text)
                    .next()
                    .unwrap_or("");
                let role = match item.role.as_deref() {
                    Some("user") if is_system_injected_context(text) => Role::Other,
                    Some("user") => {
                        if text.trim_start().starts_with("/review") {
                            acc.has_review_activity = true;
                        }
                        Role::User
                    }
                    Some("assistant") => Role::Assistant,
                    _ => Role::Other,
                };
                acc.count(role);
            }
            Some("function_call") | Some("custom_tool_call") => {
                if item
                    .name
                    .as_deref()
                    .is_some_and(|n| SHELL_FUNCTIONS.contains(&n))
                {
                    acc.has_terminal_session = true;
                }
                acc.count(Role::Tool);
            }
            Some("local_shell_call") => {
                acc.has_terminal_session = true;
                acc.count(Role::Tool);
            }
            Some("function_call_output") | Some("custom_tool_call_output") => {
                acc.count(Role::Tool)
            }
            Some("reasoning") => acc.count(Role::Reasoning),
            _ => {}
        }
    }

    fn scan_event_msg(&mut self, payload: serde_json::Value, acc: &mut SessionAccumulator) {
        let Ok(event) = serde_json::from_value::<EventMsgPayload>(payload) else {
            return;
        };
        match event.msg_type.as_deref() {
            Some("token_count") => {
                if let Some(usage) = event.info.and_then(|i| i.total_token_usage) {
                    self.last_usage = Some(usage);
                }
            }
            Some("entered_review_mode") | Some("exited_review_mode") => {
                acc.has_review_activity = true
            }
            Some("exec_command_begin") => acc.has_terminal_session = true,
            _ => {}
        }
    }
}

impl LineScanner for CodexScanner {
    fn scan_line(&mut self, line: &str, acc: &mut SessionAccumulator) -> LineKind {
        let raw: RawEvent = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => return LineKind::Malformed(e.to_string()),
        };
        let Some(event_type) = raw.event_type else {
            return LineKind::Skipped;
        };

        if let Some(ts) = &raw.timestamp {
            acc.observe_rfc3339(ts);
        }

        match event_type.as_str() {
            "session_meta" => {
                if let Ok(meta) = serde_json::from_value::<SessionMetaPayload>(raw.payload) {
                    if let Some(cwd) = meta.cwd {
                        acc.set_cwd(&cwd);
                    }
                }
            }
            "turn_context" => {
                if let Ok(ctx) = serde_json::from_value::<TurnContextPayload>(raw.payload) {
                    if let Some(cwd) = ctx.cwd {
                        acc.set_cwd(&cwd);
                    }
                }
            }
            "response_item" => self.scan_response_item(raw.payload, acc),
            "event_msg" => self.scan_event_msg(raw.payload, acc),
            _ => {}
        }
        LineKind::Record
    }

    fn finish(&mut self, acc: &mut SessionAccumulator) {
        if let Some(usage) = self.last_usage {
            acc.tokens = usage.to_totals();
        }
    }
}
