//! Transcript fixtures: append-only JSONL files in the external agent's
//! on-disk format, written line by line so tests can model late flushes.

use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct TranscriptFixture {
    _dir: TempDir,
    path: PathBuf,
}

impl Default for TranscriptFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create fixture dir");
        let path = dir.path().join("session.jsonl");
        // The file exists from the start, like a real session log.
        std::fs::write(&path, b"").expect("create transcript file");
        Self { _dir: dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn path_str(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    fn append(&self, line: &str) {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .expect("open transcript for append");
        writeln!(file, "{}", line).expect("append transcript line");
        file.flush().expect("flush transcript");
    }

    pub fn append_user(&self, text: &str) {
        self.append(
            &serde_json::json!({
                "type": "user",
                "role": "user",
                "content": text,
            })
            .to_string(),
        );
    }

    pub fn append_assistant(&self, text: &str) {
        self.append(
            &serde_json::json!({
                "type": "assistant",
                "role": "assistant",
                "content": text,
            })
            .to_string(),
        );
    }

    pub fn append_assistant_at(&self, text: &str, timestamp: DateTime<Utc>) {
        self.append(
            &serde_json::json!({
                "type": "assistant",
                "role": "assistant",
                "content": text,
                "timestamp": timestamp.to_rfc3339(),
            })
            .to_string(),
        );
    }

    /// Content-block form, as the external tool writes for rich replies.
    pub fn append_assistant_blocks(&self, parts: &[&str]) {
        let blocks: Vec<serde_json::Value> = parts
            .iter()
            .map(|text| serde_json::json!({"type": "text", "text": text}))
            .collect();
        self.append(
            &serde_json::json!({
                "type": "assistant",
                "role": "assistant",
                "content": blocks,
            })
            .to_string(),
        );
    }

    /// A line no parser should accept; readers must skip it.
    pub fn append_garbage(&self) {
        self.append("{not valid json at all");
    }
}
