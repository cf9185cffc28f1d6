//! Transcript reconciler: repairs the timeline against the on-disk JSONL.
//!
//! Hook-created turns carry approximate server timestamps; the transcript
//! is authoritative but late. Incremental reconciliation matches recent
//! turns by content hash (current and legacy formats) and corrects their
//! timestamps; entries with no match become recovered turns. Recovered
//! turns with state-relevant intents feed the lifecycle's forced path so
//! missed transitions catch up; PROGRESS recoveries are informational
//! only. A dedicated reconcile lock (same manager, distinct namespace)
//! serializes passes so a manual trigger cannot race the watchdog.

use crate::error::{Error, Result};
use crate::events::EventPayload;
use crate::hooks::turn_created_payload;
use crate::lifecycle::TaskLifecycle;
use crate::runtime::Core;
use chrono::{DateTime, Duration, Utc};
use crewtrace_engine::intent::{detect_agent_intent, detect_user_intent, IntentResult};
use crewtrace_engine::transcript::{read_entries_from_offset, TranscriptEntry, TranscriptRole};
use crewtrace_store::{Database, LockNamespace, NewEvent, NewTurn};
use crewtrace_types::{
    content_hash, event_type, is_team_internal_content, legacy_content_hash, Agent, Task,
    TaskState, TimestampSource, Turn, TurnActor, TurnIntent,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// (turn_id, old_timestamp, new_timestamp) corrections.
    pub updated: Vec<(i64, DateTime<Utc>, DateTime<Utc>)>,
    /// Newly recovered turns.
    pub created: Vec<Turn>,
}

impl ReconcileOutcome {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.created.is_empty()
    }
}

fn entry_actor(entry: &TranscriptEntry) -> Option<TurnActor> {
    match entry.role {
        TranscriptRole::User => Some(TurnActor::User),
        TranscriptRole::Assistant => Some(TurnActor::Agent),
        TranscriptRole::Other => None,
    }
}

fn detect_entry_intent(actor: TurnActor, text: &str, task_state: TaskState) -> IntentResult {
    match actor {
        TurnActor::User => detect_user_intent(Some(text), task_state),
        TurnActor::Agent => detect_agent_intent(Some(text)),
    }
}

/// Incremental reconciliation of newly-read entries against a task's
/// recent turns. Deterministic via content hash: a second pass over the
/// same byte range creates nothing.
pub fn reconcile_entries(
    core: &Core,
    db: &Database,
    agent: &Agent,
    task: &Task,
    entries: &[TranscriptEntry],
    lifecycle: &mut TaskLifecycle,
) -> Result<ReconcileOutcome> {
    let mut outcome = ReconcileOutcome::default();
    if entries.is_empty() {
        return Ok(outcome);
    }

    let window = Duration::seconds(core.config.reconcile_match_window_seconds as i64);
    let cutoff = Utc::now() - window;
    let recent = db.recent_turns_for_task(task.id, cutoff)?;

    // Index recent turns by both hash formats; first writer wins so a
    // duplicate text maps to the earliest turn.
    let mut index: HashMap<String, Turn> = HashMap::new();
    for turn in recent {
        let new_key = content_hash(turn.actor.as_str(), &turn.text);
        let legacy_key = legacy_content_hash(turn.actor.as_str(), &turn.text);
        index.entry(new_key).or_insert_with(|| turn.clone());
        index.entry(legacy_key).or_insert(turn);
    }

    for entry in entries {
        let Some(actor) = entry_actor(entry) else {
            continue;
        };
        let Some(text) = entry.text.as_deref() else {
            continue;
        };
        let text = text.trim();
        if text.is_empty() {
            continue;
        }

        let content_key = content_hash(actor.as_str(), text);
        let legacy_key = legacy_content_hash(actor.as_str(), text);

        let matched = index
            .remove(&content_key)
            .or_else(|| index.remove(&legacy_key));

        match (matched, entry.timestamp) {
            (Some(turn), Some(jsonl_ts)) => {
                // Stored timestamps are microsecond-truncated; anything
                // inside a millisecond is the same instant, not a
                // correction.
                if (turn.timestamp - jsonl_ts).abs() > Duration::milliseconds(1) {
                    db.set_turn_timestamp(turn.id, jsonl_ts, TimestampSource::Jsonl)?;
                    db.set_turn_hash(turn.id, &content_key)?;
                    info!(
                        turn_id = turn.id,
                        old = %turn.timestamp,
                        new = %jsonl_ts,
                        "reconciler corrected turn timestamp"
                    );
                    outcome.updated.push((turn.id, turn.timestamp, jsonl_ts));
                } else if turn.content_hash.is_none() {
                    db.set_turn_hash(turn.id, &content_key)?;
                }
            }
            (Some(turn), None) => {
                if turn.content_hash.is_none() {
                    db.set_turn_hash(turn.id, &content_key)?;
                }
            }
            (None, _) => {
                let task_state = db
                    .get_task(task.id)?
                    .map(|t| t.state)
                    .unwrap_or(task.state);
                let turn = create_recovered_turn(
                    db, agent, task.id, actor, text, entry.timestamp, &content_key,
                )?;
                let intent = detect_entry_intent(actor, text, task_state);
                apply_recovered_lifecycle(db, agent, task.id, &turn, &intent, lifecycle);
                outcome.created.push(turn);
            }
        }
    }

    Ok(outcome)
}

fn create_recovered_turn(
    db: &Database,
    agent: &Agent,
    task_id: i64,
    actor: TurnActor,
    text: &str,
    jsonl_ts: Option<DateTime<Utc>>,
    content_key: &str,
) -> Result<Turn> {
    let task_state = db
        .get_task(task_id)?
        .map(|t| t.state)
        .unwrap_or(TaskState::Processing);
    let intent = detect_entry_intent(actor, text, task_state);

    let mut new_turn = NewTurn::basic(task_id, actor, intent.intent, text);
    new_turn.timestamp = jsonl_ts.unwrap_or_else(Utc::now);
    new_turn.timestamp_source = if jsonl_ts.is_some() {
        TimestampSource::Jsonl
    } else {
        TimestampSource::Server
    };
    new_turn.content_hash = Some(content_key.to_string());
    new_turn.is_internal = is_team_internal_content(Some(text));
    let turn = db.create_turn(&new_turn)?;

    db.record_event(&NewEvent {
        timestamp: Utc::now(),
        project_id: Some(agent.project_id),
        agent_id: Some(agent.id),
        task_id: Some(task_id),
        turn_id: Some(turn.id),
        event_type: event_type::TURN_RECOVERED.to_string(),
        payload: Some(serde_json::json!({
            "intent": turn.intent.as_str(),
            "content_hash": content_key,
        })),
    })?;

    info!(
        turn_id = turn.id,
        agent_id = agent.id,
        intent = %turn.intent,
        hash = content_key,
        "reconciler recovered turn with no matching hook-created turn"
    );
    Ok(turn)
}

/// Feed a recovered turn into the lifecycle's forced path. Transition
/// failures log and continue; the turn row stays either way.
fn apply_recovered_lifecycle(
    db: &Database,
    agent: &Agent,
    task_id: i64,
    turn: &Turn,
    intent: &IntentResult,
    lifecycle: &mut TaskLifecycle,
) {
    if !matches!(
        turn.intent,
        TurnIntent::Question | TurnIntent::Completion | TurnIntent::EndOfTask
    ) {
        return;
    }
    let Ok(Some(task)) = db.get_task(task_id) else {
        return;
    };
    if task.state == TaskState::Complete {
        return;
    }

    let result = match turn.intent {
        TurnIntent::Question => lifecycle.update_task_state(
            db,
            agent,
            &task,
            TaskState::AwaitingInput,
            "reconciler:recovered_turn",
            intent.confidence,
        ),
        _ => lifecycle
            .complete_task(
                db,
                agent,
                &task,
                "reconciler:recovered_turn",
                None,
                turn.intent,
            )
            .map(|_| ()),
    };
    match result {
        Ok(()) => {
            info!(turn_id = turn.id, task_id, "recovered turn triggered state transition");
        }
        Err(Error::InvalidTransition(reason)) => {
            warn!(turn_id = turn.id, %reason, "recovered turn transition rejected; turn preserved");
        }
        Err(err) => {
            warn!(turn_id = turn.id, %err, "recovered turn lifecycle integration failed");
        }
    }
}

/// Broadcast the phase-3 updates for a completed reconciliation pass.
pub fn broadcast_outcome(core: &Core, agent: &Agent, outcome: &ReconcileOutcome) {
    for (turn_id, _, new_ts) in &outcome.updated {
        core.broadcaster.broadcast(EventPayload::TurnUpdated {
            agent_id: agent.id,
            turn_id: *turn_id,
            timestamp: *new_ts,
            update_type: "timestamp_correction".to_string(),
        });
    }
    for turn in &outcome.created {
        core.broadcaster.broadcast(turn_created_payload(agent, turn, None));
    }
}

/// Full-transcript reconciliation: read from offset zero and cover the
/// whole session. Used on session end and by the watchdog safety net.
/// Serialized by the reconcile lock; busy means another pass is running
/// and this trigger is dropped.
pub fn reconcile_full_session(core: &Arc<Core>, agent_id: i64) {
    let Some(_guard) = core.locks.try_lock(LockNamespace::Reconcile, agent_id) else {
        debug!(agent_id, "reconciliation already in progress; skipping");
        return;
    };

    let mut lifecycle = TaskLifecycle::new();
    let result = run_full_session(core, agent_id, &mut lifecycle);
    match result {
        Ok(Some((agent, outcome))) => {
            if !outcome.is_empty() {
                core.enqueue_post_commit(agent_id, &mut lifecycle);
                broadcast_outcome(core, &agent, &outcome);
                core.card_refresh(agent_id, "reconciler");
                info!(
                    agent_id,
                    created = outcome.created.len(),
                    "full-session reconciliation recovered turns"
                );
            }
        }
        Ok(None) => {}
        Err(err) => {
            warn!(agent_id, %err, "full-session reconciliation failed");
        }
    }
}

fn run_full_session(
    core: &Arc<Core>,
    agent_id: i64,
    lifecycle: &mut TaskLifecycle,
) -> Result<Option<(Agent, ReconcileOutcome)>> {
    let db = core.db.lock().unwrap_or_else(|e| e.into_inner());
    let Some(agent) = db.get_agent(agent_id)? else {
        return Ok(None);
    };
    let Some(path) = agent.transcript_path.clone() else {
        return Ok(None);
    };

    let (entries, _) = read_entries_from_offset(Path::new(path.as_str()), 0)
        .map_err(|e| Error::TranscriptUnavailable(e.to_string()))?;
    if entries.is_empty() {
        return Ok(None);
    }

    let tasks = db.tasks_for_agent(agent.id)?;
    let Some(latest_task) = tasks.last().cloned() else {
        return Ok(None);
    };

    // Hashes over every turn the agent owns, in both formats, plus any
    // stored hash from earlier passes.
    let mut seen: HashSet<String> = HashSet::new();
    for turn in db.turns_for_agent(agent.id)? {
        seen.insert(content_hash(turn.actor.as_str(), &turn.text));
        seen.insert(legacy_content_hash(turn.actor.as_str(), &turn.text));
        if let Some(hash) = turn.content_hash {
            seen.insert(hash);
        }
    }

    let tx = db.begin()?;
    let mut outcome = ReconcileOutcome::default();
    for entry in &entries {
        let Some(actor) = entry_actor(entry) else {
            continue;
        };
        let Some(text) = entry.text.as_deref() else {
            continue;
        };
        let text = text.trim();
        if text.is_empty() {
            continue;
        }

        let content_key = content_hash(actor.as_str(), text);
        let legacy_key = legacy_content_hash(actor.as_str(), text);
        if seen.contains(&content_key) || seen.contains(&legacy_key) {
            continue;
        }
        seen.insert(content_key.clone());
        seen.insert(legacy_key);

        let turn = create_recovered_turn(
            &db,
            &agent,
            latest_task.id,
            actor,
            text,
            entry.timestamp,
            &content_key,
        )?;
        // Missed transitions catch up only while the agent is live; an
        // ended session's timeline is closed.
        if agent.ended_at.is_none() {
            let task_state = db
                .get_task(latest_task.id)?
                .map(|t| t.state)
                .unwrap_or(latest_task.state);
            let intent = detect_entry_intent(actor, text, task_state);
            apply_recovered_lifecycle(&db, &agent, latest_task.id, &turn, &intent, lifecycle);
        }
        outcome.created.push(turn);
    }
    tx.commit()?;

    Ok(Some((agent, outcome)))
}
