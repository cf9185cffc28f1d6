//! Typed events fanned out to subscribers.

use chrono::{DateTime, Utc};
use crewtrace_engine::CardState;
use serde::Serialize;

/// One delivered event: a monotonic id (per-process), a server timestamp,
/// and the typed payload. The id gives subscribers a replay sequence; it
/// carries no cross-agent causal meaning.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastEvent {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SessionCreated {
        agent_id: i64,
        project_id: i64,
        session_uuid: String,
    },
    SessionEnded {
        agent_id: i64,
        project_id: i64,
        session_uuid: String,
        reason: Option<String>,
    },
    StateChanged {
        agent_id: i64,
        project_id: i64,
        event_type: String,
        new_state: String,
        message: Option<String>,
    },
    TurnCreated {
        agent_id: i64,
        project_id: i64,
        task_id: i64,
        turn_id: i64,
        actor: String,
        intent: String,
        text: String,
        tool_input: Option<serde_json::Value>,
    },
    TurnUpdated {
        agent_id: i64,
        turn_id: i64,
        timestamp: DateTime<Utc>,
        update_type: String,
    },
    CardRefresh {
        agent_id: i64,
        project_id: i64,
        card: CardState,
        reason: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::SessionCreated { .. } => "session_created",
            EventPayload::SessionEnded { .. } => "session_ended",
            EventPayload::StateChanged { .. } => "state_changed",
            EventPayload::TurnCreated { .. } => "turn_created",
            EventPayload::TurnUpdated { .. } => "turn_updated",
            EventPayload::CardRefresh { .. } => "card_refresh",
        }
    }

    pub fn agent_id(&self) -> Option<i64> {
        match self {
            EventPayload::SessionCreated { agent_id, .. }
            | EventPayload::SessionEnded { agent_id, .. }
            | EventPayload::StateChanged { agent_id, .. }
            | EventPayload::TurnCreated { agent_id, .. }
            | EventPayload::TurnUpdated { agent_id, .. }
            | EventPayload::CardRefresh { agent_id, .. } => Some(*agent_id),
        }
    }

    pub fn project_id(&self) -> Option<i64> {
        match self {
            EventPayload::SessionCreated { project_id, .. }
            | EventPayload::SessionEnded { project_id, .. }
            | EventPayload::StateChanged { project_id, .. }
            | EventPayload::TurnCreated { project_id, .. }
            | EventPayload::CardRefresh { project_id, .. } => Some(*project_id),
            EventPayload::TurnUpdated { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        let payload = EventPayload::SessionEnded {
            agent_id: 1,
            project_id: 2,
            session_uuid: "abc".to_string(),
            reason: Some("reaper:pane_not_found".to_string()),
        };
        assert_eq!(payload.kind(), "session_ended");
        assert_eq!(payload.agent_id(), Some(1));
        assert_eq!(payload.project_id(), Some(2));
    }

    #[test]
    fn test_serializes_with_type_tag() {
        let payload = EventPayload::StateChanged {
            agent_id: 3,
            project_id: 4,
            event_type: "stop".to_string(),
            new_state: "COMPLETE".to_string(),
            message: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["new_state"], "COMPLETE");
    }

    #[test]
    fn test_turn_updated_has_no_project_scope() {
        let payload = EventPayload::TurnUpdated {
            agent_id: 1,
            turn_id: 9,
            timestamp: Utc::now(),
            update_type: "timestamp_correction".to_string(),
        };
        assert_eq!(payload.project_id(), None);
    }
}
