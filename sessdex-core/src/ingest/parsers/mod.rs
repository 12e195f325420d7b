//! Source-specific parsers
//!
//! Each supported source has a module implementing
//! [`SessionParser`](super::SessionParser).
//!
//! | Source | Module | Layout |
//! |--------|--------|--------|
//! | Claude Code | [`claude`] | `projects/<encoded-cwd>/<id>.jsonl` |
//! | Codex | [`codex`] | `sessions/YYYY/MM/DD/rollout-*.jsonl` |
//! | Aider | [`aider`] | `<project>/.aider.chat.history.md` |

mod aider;
mod claude;
mod codex;

pub use aider::AiderParser;
pub use claude::ClaudeCodeParser;
pub use codex::CodexParser;

use super::SessionParser;
use crate::types::Source;
use std::sync::Arc;

/// Get the parser for a source.
pub fn parser_for(source: Source) -> Arc<dyn SessionParser> {
    match source {
        Source::ClaudeCode => Arc::new(ClaudeCodeParser::new()),
        Source::Codex => Arc::new(CodexParser::new()),
        Source::Aider => Arc::new(AiderParser::new()),
    }
}
