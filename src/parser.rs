//! Transcript record parsing.
//!
//! Session logs are newline-delimited JSON. A record is a user message, an
//! assistant message (whose content is a list of blocks), or a system event.
//! Only `type`, `timestamp`, `message.content`, `cwd`, and an optional
//! `todos` array are consumed — content parsing feeds metadata, never state
//! transitions.
//!
//! # Record shapes
//!
//! ```json
//! {"type":"user","timestamp":"2026-07-01T10:00:00Z","cwd":"/repo",
//!  "message":{"content":"fix the flaky test"}}
//! {"type":"assistant","timestamp":"2026-07-01T10:00:05Z",
//!  "message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{}}]}}
//! {"type":"system","subtype":"turn_duration","durationMs":5000}
//! ```

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::session::TodoProgress;

/// Errors that can occur while parsing a transcript line.
#[derive(Error, Debug)]
pub enum ParseError {
    /// The line is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Raw transcript record. Unrecognized fields are ignored.
#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(rename = "type", default)]
    record_type: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    todos: Option<Vec<TodoEntry>>,
    #[serde(default)]
    cwd: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Option<MessageContent>,
}

/// Message content is either a bare string (user prompts) or a block list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A content block. Unknown block types fall through to `Other` instead of
/// failing the whole record.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentBlock {
    Known(KnownBlock),
    Other(Value),
}

/// Only the block type matters here: a `tool_use` block marks an assistant
/// turn as a message, a `text` block can seed the original prompt. The
/// blocks' inner fields are not consumed.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KnownBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {},
    ToolResult {},
    Thinking {},
}

/// A todo entry; only the status is consumed.
#[derive(Debug, Deserialize)]
struct TodoEntry {
    #[serde(default)]
    status: Option<String>,
}

/// Metadata extracted from one transcript record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedEntry {
    /// The record's timestamp, when it carries one.
    pub timestamp: Option<DateTime<Utc>>,
    /// True for user-prompt records and assistant records containing a
    /// tool-use block; these drive the published message count.
    pub counts_as_message: bool,
    /// Todo progress, when the record carries a todo list.
    pub todos: Option<TodoProgress>,
    /// Text of a user prompt, used only to bootstrap `original_prompt`.
    pub user_text: Option<String>,
    /// Working directory, used only to bootstrap a hook-less session.
    pub cwd: Option<String>,
}

/// Parses one transcript line into its metadata.
///
/// # Errors
///
/// Returns `ParseError::InvalidJson` when the line is not a JSON object.
/// Records of unknown `type` parse successfully into an entry that counts
/// nothing.
pub fn parse_line(line: &str) -> Result<ParsedEntry, ParseError> {
    let record: RawRecord = serde_json::from_str(line)?;

    let mut entry = ParsedEntry {
        timestamp: record.timestamp,
        cwd: record.cwd,
        ..ParsedEntry::default()
    };

    if let Some(todos) = &record.todos {
        let completed = todos
            .iter()
            .filter(|t| t.status.as_deref() == Some("completed"))
            .count() as u32;
        entry.todos = Some(TodoProgress {
            total: todos.len() as u32,
            completed,
        });
    }

    let content = record.message.and_then(|m| m.content);
    match record.record_type.as_deref() {
        Some("user") => {
            entry.user_text = content.as_ref().and_then(prompt_text);
            entry.counts_as_message = entry.user_text.is_some();
        }
        Some("assistant") => {
            entry.counts_as_message = content.as_ref().is_some_and(has_tool_use);
        }
        _ => {}
    }

    Ok(entry)
}

/// Extracts prompt text from user message content. Tool-result-only user
/// records yield `None` and do not count as messages.
fn prompt_text(content: &MessageContent) -> Option<String> {
    match content {
        MessageContent::Text(text) if !text.trim().is_empty() => Some(text.clone()),
        MessageContent::Text(_) => None,
        MessageContent::Blocks(blocks) => blocks.iter().find_map(|block| match block {
            ContentBlock::Known(KnownBlock::Text { text }) if !text.trim().is_empty() => {
                Some(text.clone())
            }
            _ => None,
        }),
    }
}

/// True when the content contains at least one tool-use block.
fn has_tool_use(content: &MessageContent) -> bool {
    match content {
        MessageContent::Text(_) => false,
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .any(|block| matches!(block, ContentBlock::Known(KnownBlock::ToolUse { .. }))),
    }
}
