//! Insert-parameter structs for the wider rows.

use chrono::{DateTime, Utc};
use crewtrace_types::{FileMeta, QuestionPayload, TimestampSource, TurnActor, TurnIntent};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewAgent {
    pub session_uuid: Uuid,
    pub external_session_id: Option<String>,
    pub project_id: i64,
    pub pane_id: Option<String>,
    pub transcript_path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTurn {
    pub task_id: i64,
    pub actor: TurnActor,
    pub intent: TurnIntent,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub timestamp_source: TimestampSource,
    pub content_hash: Option<String>,
    pub answers_turn_id: Option<i64>,
    pub question: Option<QuestionPayload>,
    pub file_meta: Option<FileMeta>,
    pub is_internal: bool,
}

impl NewTurn {
    /// A server-timestamped turn with only the required fields set.
    pub fn basic(task_id: i64, actor: TurnActor, intent: TurnIntent, text: &str) -> Self {
        Self {
            task_id,
            actor,
            intent,
            text: text.to_string(),
            timestamp: Utc::now(),
            timestamp_source: TimestampSource::Server,
            content_hash: None,
            answers_turn_id: None,
            question: None,
            file_meta: None,
            is_internal: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub timestamp: DateTime<Utc>,
    pub project_id: Option<i64>,
    pub agent_id: Option<i64>,
    pub task_id: Option<i64>,
    pub turn_id: Option<i64>,
    pub event_type: String,
    pub payload: Option<serde_json::Value>,
}

impl NewEvent {
    pub fn now(event_type: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            project_id: None,
            agent_id: None,
            task_id: None,
            turn_id: None,
            event_type: event_type.to_string(),
            payload: None,
        }
    }
}
