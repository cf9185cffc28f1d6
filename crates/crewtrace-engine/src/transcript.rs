//! Tolerant reader for append-only JSONL transcript files.
//!
//! The schema is unowned (the external agent process writes it), so the
//! reader tolerates missing fields, nested content-block lists, malformed
//! lines, mid-file truncation, and UTF-8 irregularities. The byte offset is
//! the sole cursor state; callers persist it between reads.

use crate::error::Result;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptRole {
    User,
    Assistant,
    Other,
}

/// One parsed line of the transcript.
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub kind: String,
    pub role: TranscriptRole,
    pub text: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl TranscriptEntry {
    pub fn has_text(&self) -> bool {
        self.text
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Read entries appended since `offset`, returning them with the new
/// offset. If the file shrank below the offset (rotation or truncation),
/// reading restarts from zero. A missing file yields no entries and the
/// unchanged offset.
pub fn read_entries_from_offset(
    path: &Path,
    offset: u64,
) -> Result<(Vec<TranscriptEntry>, u64)> {
    if !path.exists() {
        return Ok((Vec::new(), offset));
    }

    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = if offset > len { 0 } else { offset };

    file.seek(SeekFrom::Start(start))?;
    let mut bytes = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut bytes)?;
    let new_offset = start + bytes.len() as u64;

    let content = String::from_utf8_lossy(&bytes);
    let mut entries = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(entry) = parse_line(line) {
            entries.push(entry);
        }
    }

    Ok((entries, new_offset))
}

/// Extract the last assistant response from the whole transcript, truncated
/// to `max_len` characters. Returns `None` when no assistant text exists.
pub fn last_agent_response(path: &Path, max_len: usize) -> Result<Option<String>> {
    let (entries, _) = read_entries_from_offset(path, 0)?;
    for entry in entries.iter().rev() {
        if entry.role == TranscriptRole::Assistant && entry.has_text() {
            let text = entry.text.as_deref().unwrap_or_default();
            if text.chars().count() > max_len {
                let truncated: String = text.chars().take(max_len).collect();
                return Ok(Some(format!("{}... [truncated]", truncated)));
            }
            return Ok(Some(text.to_string()));
        }
    }
    Ok(None)
}

fn parse_line(line: &str) -> Option<TranscriptEntry> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let obj = value.as_object()?;

    let kind = obj
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    // Role may live at top level or inside a nested message record.
    let role_str = obj
        .get("role")
        .and_then(|v| v.as_str())
        .or_else(|| {
            obj.get("message")
                .and_then(|m| m.get("role"))
                .and_then(|v| v.as_str())
        })
        .unwrap_or_default();
    let role = match role_str {
        "user" => TranscriptRole::User,
        "assistant" => TranscriptRole::Assistant,
        _ => {
            // Fall back to the line type when no role field is present.
            match kind.as_str() {
                "user" => TranscriptRole::User,
                "assistant" => TranscriptRole::Assistant,
                _ => TranscriptRole::Other,
            }
        }
    };

    let text = obj
        .get("content")
        .and_then(flatten_content)
        .or_else(|| {
            obj.get("message")
                .and_then(|m| m.get("content"))
                .and_then(flatten_content)
        })
        .or_else(|| {
            obj.get("message")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
        });

    let timestamp = obj
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Some(TranscriptEntry {
        kind,
        role,
        text,
        timestamp,
    })
}

/// Flatten content: either a plain string or a list of content blocks
/// (`[{"type": "text", "text": "..."}, ...]`) joined by newlines.
fn flatten_content(content: &serde_json::Value) -> Option<String> {
    match content {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        _ => None,
    }
}
