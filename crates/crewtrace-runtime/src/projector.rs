//! Store-backed card projection and the card_refresh broadcast helper.
//!
//! Pull responses and push events go through the same `load_card`, so a
//! dashboard never has to reload to see the truth.

use crate::broadcaster::Broadcaster;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::EventPayload;
use chrono::{Duration, Utc};
use crewtrace_engine::card::{build_card, CardInputs, CardState};
use crewtrace_store::Database;
use crewtrace_types::TaskState;
use tracing::debug;

pub fn load_card(db: &Database, agent_id: i64, config: &Config) -> Result<CardState> {
    let agent = db
        .get_agent(agent_id)?
        .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?;

    let tasks = db.tasks_for_agent_desc(agent.id)?;
    let display_task = tasks
        .iter()
        .find(|t| t.state != TaskState::Complete)
        .or_else(|| tasks.first());
    let turns = match display_task {
        Some(task) => db.turns_for_task(task.id)?,
        None => Vec::new(),
    };
    let project_name = db.get_project(agent.project_id)?.map(|p| p.name);

    let inputs = CardInputs {
        agent: &agent,
        project_name: project_name.as_deref(),
        tasks: &tasks,
        turns: &turns,
    };
    Ok(build_card(
        &inputs,
        Utc::now(),
        Duration::seconds(config.stale_processing_seconds as i64),
        Duration::minutes(config.active_timeout_minutes as i64),
    ))
}

/// Broadcast a card_refresh with the full projection. Failures never
/// propagate to the caller.
pub fn broadcast_card_refresh(
    db: &Database,
    broadcaster: &Broadcaster,
    agent_id: i64,
    reason: &str,
    config: &Config,
) {
    match load_card(db, agent_id, config) {
        Ok(card) => {
            broadcaster.broadcast(EventPayload::CardRefresh {
                agent_id,
                project_id: card.project_id,
                card,
                reason: reason.to_string(),
            });
        }
        Err(err) => {
            debug!(agent_id, %err, "card_refresh skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crewtrace_store::{NewAgent, NewTurn};
    use crewtrace_types::{TurnActor, TurnIntent};
    use uuid::Uuid;

    #[test]
    fn test_load_card_reflects_current_task() {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("api", "/api").unwrap();
        let agent = db
            .create_agent(&NewAgent {
                session_uuid: Uuid::new_v4(),
                external_session_id: None,
                project_id: project.id,
                pane_id: None,
                transcript_path: None,
                started_at: Utc::now(),
                last_seen_at: Utc::now(),
            })
            .unwrap();
        let task = db
            .create_task(agent.id, TaskState::AwaitingInput, Utc::now())
            .unwrap();
        db.create_turn(&NewTurn::basic(
            task.id,
            TurnActor::Agent,
            TurnIntent::Question,
            "Proceed with the drop?",
        ))
        .unwrap();

        let card = load_card(&db, agent.id, &Config::default()).unwrap();
        assert_eq!(card.state, "AWAITING_INPUT");
        assert_eq!(card.project_name.as_deref(), Some("api"));
        assert_eq!(card.task_summary, "Proceed with the drop?");
    }

    #[test]
    fn test_load_card_missing_agent_errors() {
        let db = Database::open_in_memory().unwrap();
        let err = load_card(&db, 999, &Config::default()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
