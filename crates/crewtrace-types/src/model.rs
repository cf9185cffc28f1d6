use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Five-state task lifecycle.
///
/// The agent's effective state is derived from its current (most recent
/// non-COMPLETE) task, or `Idle` when no such task exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Commanded,
    Processing,
    AwaitingInput,
    Complete,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Idle => "idle",
            TaskState::Commanded => "commanded",
            TaskState::Processing => "processing",
            TaskState::AwaitingInput => "awaiting_input",
            TaskState::Complete => "complete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(TaskState::Idle),
            "commanded" => Some(TaskState::Commanded),
            "processing" => Some(TaskState::Processing),
            "awaiting_input" => Some(TaskState::AwaitingInput),
            "complete" => Some(TaskState::Complete),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnActor {
    User,
    Agent,
}

impl TurnActor {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnActor::User => "user",
            TurnActor::Agent => "agent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(TurnActor::User),
            "agent" => Some(TurnActor::Agent),
            _ => None,
        }
    }
}

impl std::fmt::Display for TurnActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The classified intent of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnIntent {
    Command,
    Answer,
    Question,
    Progress,
    Completion,
    EndOfTask,
}

impl TurnIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnIntent::Command => "command",
            TurnIntent::Answer => "answer",
            TurnIntent::Question => "question",
            TurnIntent::Progress => "progress",
            TurnIntent::Completion => "completion",
            TurnIntent::EndOfTask => "end_of_task",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "command" => Some(TurnIntent::Command),
            "answer" => Some(TurnIntent::Answer),
            "question" => Some(TurnIntent::Question),
            "progress" => Some(TurnIntent::Progress),
            "completion" => Some(TurnIntent::Completion),
            "end_of_task" => Some(TurnIntent::EndOfTask),
            _ => None,
        }
    }

    /// Intents that close a task.
    pub fn is_completing(&self) -> bool {
        matches!(self, TurnIntent::Completion | TurnIntent::EndOfTask)
    }
}

impl std::fmt::Display for TurnIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a turn's timestamp came from.
///
/// Hook-created turns start with `Server` time; the reconciler corrects
/// them to `Jsonl` when the transcript entry carries its own timestamp.
/// `User` marks answers entered through the respond path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    Server,
    Jsonl,
    User,
}

impl TimestampSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampSource::Server => "server",
            TimestampSource::Jsonl => "jsonl",
            TimestampSource::User => "user",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "server" => Some(TimestampSource::Server),
            "jsonl" => Some(TimestampSource::Jsonl),
            "user" => Some(TimestampSource::User),
            _ => None,
        }
    }
}

/// A monitored codebase. Identified by a unique absolute path and a
/// unique URL-safe slug derived from its name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub path: String,
    pub repo_url: Option<String>,
    pub description: Option<String>,
    pub paused: bool,
    pub paused_at: Option<DateTime<Utc>>,
    pub paused_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One live (or historical) coding-agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    /// Server-assigned identity.
    pub session_uuid: Uuid,
    /// Identifier issued by the external agent process, when known.
    pub external_session_id: Option<String>,
    pub project_id: i64,
    /// Terminal pane address for capture and text injection.
    pub pane_id: Option<String>,
    pub transcript_path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub priority_score: Option<i64>,
    pub priority_reason: Option<String>,
}

impl Agent {
    /// Human-readable name: session UUID prefix, optionally project-qualified
    /// by the caller.
    pub fn short_name(&self) -> String {
        let uuid = self.session_uuid.to_string();
        format!("agent-{}", &uuid[..8])
    }

    pub fn is_live(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// A unit of work the agent performs for the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub agent_id: i64,
    pub state: TaskState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Accumulated raw user command text (follow-ups newline-joined).
    pub full_command: Option<String>,
    /// Raw agent output captured at completion.
    pub full_output: Option<String>,
    /// Short AI-generated instruction summary, back-filled post-commit.
    pub instruction: Option<String>,
    pub instruction_generated_at: Option<DateTime<Utc>>,
    /// AI-generated completion summary, back-filled post-commit.
    pub completion_summary: Option<String>,
    pub completion_summary_generated_at: Option<DateTime<Utc>>,
}

/// Origin of a structured question payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionSource {
    ToolInput,
    PermissionRequest,
    Notification,
    FreeText,
}

impl QuestionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionSource::ToolInput => "tool_input",
            QuestionSource::PermissionRequest => "permission_request",
            QuestionSource::Notification => "notification",
            QuestionSource::FreeText => "free_text",
        }
    }
}

/// Structured question captured from a question-asking tool invocation,
/// a permission request, or detected free text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionPayload {
    pub text: String,
    #[serde(default)]
    pub options: Vec<String>,
    pub source: QuestionSource,
}

/// Metadata for a file attached to a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

/// One atomic message in a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: i64,
    pub task_id: i64,
    pub actor: TurnActor,
    pub intent: TurnIntent,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub timestamp_source: TimestampSource,
    /// 16-hex-char dedup hash over (actor, normalized text).
    pub content_hash: Option<String>,
    /// Weak back-reference: the question turn this USER/ANSWER replies to.
    pub answers_turn_id: Option<i64>,
    pub question: Option<QuestionPayload>,
    pub file_meta: Option<FileMeta>,
    /// Sub-agent protocol chatter, hidden from transcripts by default.
    pub is_internal: bool,
    pub summary: Option<String>,
    pub summary_generated_at: Option<DateTime<Utc>>,
}

/// Append-only audit record. References entities by id but is not owned
/// by them; foreign keys null out when the referenced rows are deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub project_id: Option<i64>,
    pub agent_id: Option<i64>,
    pub task_id: Option<i64>,
    pub turn_id: Option<i64>,
    pub event_type: String,
    pub payload: Option<serde_json::Value>,
}

/// Event type tags used by the core.
pub mod event_type {
    pub const STATE_TRANSITION: &str = "state_transition";
    pub const SESSION_DISCOVERED: &str = "session_discovered";
    pub const SESSION_ENDED: &str = "session_ended";
    pub const REAPER_ENDED: &str = "reaper_ended";
    pub const TURN_RECOVERED: &str = "turn_recovered";
}

/// Structured payload of every state-transition audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionPayload {
    pub from_state: TaskState,
    pub to_state: TaskState,
    pub trigger: String,
    pub confidence: f64,
}
