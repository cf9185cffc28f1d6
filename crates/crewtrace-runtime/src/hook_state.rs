//! Thread-safe per-agent ephemeral flags for hook processing.
//!
//! One mutex guards the whole table: the flags are correlated (session end
//! clears several at once) and hold times are microseconds.

use crewtrace_types::FileMeta;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const RESPOND_PENDING_TTL: Duration = Duration::from_secs(10);
const RESPOND_INFLIGHT_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct AgentFlags {
    /// Name of the tool that put the task into AWAITING_INPUT.
    awaiting_tool: Option<String>,
    /// A user answer was just committed; suppress the echoed
    /// user_prompt_submit hook within the TTL.
    respond_pending: Option<Instant>,
    /// A user answer is about to be sent (pre-commit).
    respond_inflight: Option<Instant>,
    /// Single-flight claim for the deferred-stop worker.
    deferred_stop: bool,
    /// Last byte offset read from the agent's transcript.
    transcript_offset: Option<u64>,
    /// Intermediate agent text captured between tool calls.
    progress_texts: Vec<String>,
    /// File uploaded with an idle-state command; attached to the next
    /// hook-created turn.
    file_upload: Option<FileMeta>,
}

/// Singleton container, constructed by the wiring layer and shared by
/// reference.
#[derive(Default)]
pub struct AgentHookState {
    inner: Mutex<HashMap<i64, AgentFlags>>,
}

impl AgentHookState {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_flags<T>(&self, agent_id: i64, f: impl FnOnce(&mut AgentFlags) -> T) -> T {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(inner.entry(agent_id).or_default())
    }

    // ── Awaiting tool ────────────────────────────────────────────────

    pub fn set_awaiting_tool(&self, agent_id: i64, tool_name: &str) {
        self.with_flags(agent_id, |flags| {
            flags.awaiting_tool = Some(tool_name.to_string())
        });
    }

    pub fn awaiting_tool(&self, agent_id: i64) -> Option<String> {
        self.with_flags(agent_id, |flags| flags.awaiting_tool.clone())
    }

    pub fn clear_awaiting_tool(&self, agent_id: i64) -> Option<String> {
        self.with_flags(agent_id, |flags| flags.awaiting_tool.take())
    }

    // ── Respond pending / inflight ───────────────────────────────────

    /// Upgrade: inflight → pending (post-commit).
    pub fn set_respond_pending(&self, agent_id: i64) {
        self.with_flags(agent_id, |flags| {
            flags.respond_pending = Some(Instant::now());
            flags.respond_inflight = None;
        });
    }

    /// Non-consuming TTL check. The flag stays set so it can suppress
    /// multiple echoed hooks inside the window (slash-command expansion
    /// fires a second one).
    pub fn is_respond_pending(&self, agent_id: i64) -> bool {
        self.with_flags(agent_id, |flags| match flags.respond_pending {
            Some(set_at) if set_at.elapsed() < RESPOND_PENDING_TTL => true,
            Some(_) => {
                flags.respond_pending = None;
                false
            }
            None => false,
        })
    }

    /// Atomically check TTL and clear.
    pub fn consume_respond_pending(&self, agent_id: i64) -> bool {
        self.with_flags(agent_id, |flags| match flags.respond_pending.take() {
            Some(set_at) => set_at.elapsed() < RESPOND_PENDING_TTL,
            None => false,
        })
    }

    pub fn set_respond_inflight(&self, agent_id: i64) {
        self.with_flags(agent_id, |flags| {
            flags.respond_inflight = Some(Instant::now())
        });
    }

    pub fn is_respond_inflight(&self, agent_id: i64) -> bool {
        self.with_flags(agent_id, |flags| match flags.respond_inflight {
            Some(set_at) => set_at.elapsed() < RESPOND_INFLIGHT_TTL,
            None => false,
        })
    }

    pub fn clear_respond_inflight(&self, agent_id: i64) {
        self.with_flags(agent_id, |flags| flags.respond_inflight = None);
    }

    // ── Deferred stop (single-flight) ────────────────────────────────

    /// Claim the deferred-stop slot. Returns false when a worker is
    /// already in flight for this agent.
    pub fn try_claim_deferred_stop(&self, agent_id: i64) -> bool {
        self.with_flags(agent_id, |flags| {
            if flags.deferred_stop {
                false
            } else {
                flags.deferred_stop = true;
                true
            }
        })
    }

    pub fn release_deferred_stop(&self, agent_id: i64) {
        self.with_flags(agent_id, |flags| flags.deferred_stop = false);
    }

    pub fn is_deferred_stop_pending(&self, agent_id: i64) -> bool {
        self.with_flags(agent_id, |flags| flags.deferred_stop)
    }

    // ── Transcript offset ────────────────────────────────────────────

    pub fn transcript_offset(&self, agent_id: i64) -> Option<u64> {
        self.with_flags(agent_id, |flags| flags.transcript_offset)
    }

    pub fn set_transcript_offset(&self, agent_id: i64, offset: u64) {
        self.with_flags(agent_id, |flags| flags.transcript_offset = Some(offset));
    }

    pub fn clear_transcript_offset(&self, agent_id: i64) -> Option<u64> {
        self.with_flags(agent_id, |flags| flags.transcript_offset.take())
    }

    // ── Progress buffer ──────────────────────────────────────────────

    pub fn append_progress_text(&self, agent_id: i64, text: &str) {
        self.with_flags(agent_id, |flags| {
            flags.progress_texts.push(text.to_string())
        });
    }

    /// Atomically pop the whole buffer.
    pub fn consume_progress_texts(&self, agent_id: i64) -> Vec<String> {
        self.with_flags(agent_id, |flags| std::mem::take(&mut flags.progress_texts))
    }

    pub fn progress_texts(&self, agent_id: i64) -> Vec<String> {
        self.with_flags(agent_id, |flags| flags.progress_texts.clone())
    }

    // ── File upload (single-shot) ────────────────────────────────────

    pub fn set_file_upload_pending(&self, agent_id: i64, meta: FileMeta) {
        self.with_flags(agent_id, |flags| flags.file_upload = Some(meta));
    }

    pub fn consume_file_upload_pending(&self, agent_id: i64) -> Option<FileMeta> {
        self.with_flags(agent_id, |flags| flags.file_upload.take())
    }

    // ── Lifecycle bulk operations ────────────────────────────────────

    /// New session: session-scoped cursors reset.
    pub fn on_session_start(&self, agent_id: i64) {
        self.with_flags(agent_id, |flags| {
            flags.transcript_offset = None;
            flags.progress_texts.clear();
        });
    }

    /// Session ended: drop the whole row.
    pub fn on_session_end(&self, agent_id: i64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(&agent_id);
    }

    /// A new user → agent response cycle begins.
    pub fn on_new_response_cycle(&self, agent_id: i64) {
        self.with_flags(agent_id, |flags| {
            flags.awaiting_tool = None;
            flags.progress_texts.clear();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_awaiting_tool_set_get_clear() {
        let state = AgentHookState::new();
        state.set_awaiting_tool(1, "AskUserQuestion");
        assert_eq!(state.awaiting_tool(1).as_deref(), Some("AskUserQuestion"));
        assert_eq!(state.clear_awaiting_tool(1).as_deref(), Some("AskUserQuestion"));
        assert!(state.awaiting_tool(1).is_none());
    }

    #[test]
    fn test_respond_pending_is_non_consuming_within_ttl() {
        let state = AgentHookState::new();
        state.set_respond_pending(1);
        assert!(state.is_respond_pending(1));
        // A second check within the TTL still sees it.
        assert!(state.is_respond_pending(1));
        assert!(state.consume_respond_pending(1));
        assert!(!state.is_respond_pending(1));
    }

    #[test]
    fn test_respond_pending_upgrade_clears_inflight() {
        let state = AgentHookState::new();
        state.set_respond_inflight(1);
        assert!(state.is_respond_inflight(1));
        state.set_respond_pending(1);
        assert!(!state.is_respond_inflight(1));
        assert!(state.is_respond_pending(1));
    }

    #[test]
    fn test_deferred_stop_single_flight() {
        let state = AgentHookState::new();
        assert!(state.try_claim_deferred_stop(1));
        assert!(!state.try_claim_deferred_stop(1));
        assert!(state.is_deferred_stop_pending(1));
        state.release_deferred_stop(1);
        assert!(state.try_claim_deferred_stop(1));
    }

    #[test]
    fn test_deferred_stop_is_per_agent() {
        let state = AgentHookState::new();
        assert!(state.try_claim_deferred_stop(1));
        assert!(state.try_claim_deferred_stop(2));
    }

    #[test]
    fn test_progress_buffer_consume_empties() {
        let state = AgentHookState::new();
        state.append_progress_text(1, "reading files");
        state.append_progress_text(1, "running tests");
        assert_eq!(state.progress_texts(1).len(), 2);
        let texts = state.consume_progress_texts(1);
        assert_eq!(texts, vec!["reading files", "running tests"]);
        assert!(state.consume_progress_texts(1).is_empty());
    }

    #[test]
    fn test_file_upload_is_single_shot() {
        let state = AgentHookState::new();
        state.set_file_upload_pending(
            1,
            FileMeta {
                name: "notes.txt".to_string(),
                path: "/tmp/notes.txt".to_string(),
                mime_type: None,
                size_bytes: Some(12),
            },
        );
        assert!(state.consume_file_upload_pending(1).is_some());
        assert!(state.consume_file_upload_pending(1).is_none());
    }

    #[test]
    fn test_session_end_clears_row() {
        let state = AgentHookState::new();
        state.set_awaiting_tool(1, "AskUserQuestion");
        state.set_transcript_offset(1, 100);
        state.append_progress_text(1, "x");
        state.on_session_end(1);
        assert!(state.awaiting_tool(1).is_none());
        assert!(state.transcript_offset(1).is_none());
        assert!(state.progress_texts(1).is_empty());
    }

    #[test]
    fn test_new_response_cycle_keeps_offset() {
        let state = AgentHookState::new();
        state.set_transcript_offset(1, 512);
        state.set_awaiting_tool(1, "AskUserQuestion");
        state.append_progress_text(1, "x");
        state.on_new_response_cycle(1);
        assert_eq!(state.transcript_offset(1), Some(512));
        assert!(state.awaiting_tool(1).is_none());
        assert!(state.progress_texts(1).is_empty());
    }
}
