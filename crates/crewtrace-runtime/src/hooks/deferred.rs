//! Deferred-stop worker: handles the race where the stop hook fires
//! before the agent process has flushed its transcript.
//!
//! One single-flight background worker per agent, claimed through the
//! hook state. A fixed delay schedule is used instead of exponential
//! backoff: the 5s ceiling is the contract, not average latency. The
//! worker self-cancels when the task completes under it or the agent is
//! ended by session_end or the reaper.

use crate::error::Result;
use crate::events::EventPayload;
use crate::hooks::{turn_created_payload, PLACEHOLDER_QUESTION};
use crate::lifecycle::TaskLifecycle;
use crate::runtime::Core;
use chrono::Utc;
use crewtrace_engine::intent::detect_agent_intent;
use crewtrace_engine::transcript::{last_agent_response, read_entries_from_offset, TranscriptRole};
use crewtrace_store::LockNamespace;
use crewtrace_types::{
    QuestionPayload, QuestionSource, TaskState, Turn, TurnActor, TurnIntent,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_RESPONSE_LEN: usize = 10_000;
const POLL_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Claim the agent's deferred-stop slot and spawn the worker. A second
/// stop while one is in flight is a silent no-op.
pub fn schedule_deferred_stop(core: Arc<Core>, agent_id: i64, task_id: i64) {
    if !core.hook_state.try_claim_deferred_stop(agent_id) {
        info!(agent_id, "deferred_stop skipped (already pending)");
        return;
    }

    let spawn = std::thread::Builder::new()
        .name(format!("deferred-stop-{}", agent_id))
        .spawn(move || {
            let result = run_deferred_stop(&core, agent_id, task_id);
            if let Err(err) = result {
                warn!(agent_id, %err, "deferred_stop failed");
            }
            core.hook_state.release_deferred_stop(agent_id);
        });
    if let Err(err) = spawn {
        warn!(agent_id, %err, "deferred_stop spawn failed");
    }
}

fn run_deferred_stop(core: &Arc<Core>, agent_id: i64, task_id: i64) -> Result<()> {
    let mut agent_text: Option<String> = None;
    let mut polls = 0;

    for delay in core.config.deferred_stop_delays() {
        std::thread::sleep(delay);
        polls += 1;

        let Ok(guard) = core
            .locks
            .lock(LockNamespace::Agent, agent_id, POLL_LOCK_TIMEOUT)
        else {
            continue;
        };
        let transcript_path = {
            let db = core.db.lock().unwrap_or_else(|e| e.into_inner());
            let Some(task) = db.get_task(task_id)? else {
                return Ok(());
            };
            if task.state == TaskState::Complete {
                // Another commit already closed it out.
                return Ok(());
            }
            let Some(agent) = db.get_agent(agent_id)? else {
                return Ok(());
            };
            if agent.ended_at.is_some() {
                // Session ended or reaped while we were waiting.
                return Ok(());
            }
            agent.transcript_path
        };
        drop(guard);

        if let Some(path) = transcript_path {
            if let Ok(Some(text)) = last_agent_response(Path::new(path.as_str()), MAX_RESPONSE_LEN)
            {
                agent_text = Some(text);
                break;
            }
        }
    }

    debug!(
        agent_id,
        polls,
        found = agent_text.is_some(),
        "deferred_stop transcript retry finished"
    );

    let guard = core.locks.lock(
        LockNamespace::Agent,
        agent_id,
        core.config.lock_timeout(),
    )?;
    let mut lifecycle = TaskLifecycle::new();
    let mut broadcasts: Vec<EventPayload> = Vec::new();
    let final_state;
    {
        let db = core.db.lock().unwrap_or_else(|e| e.into_inner());
        let tx = db.begin()?;

        let Some(task) = db.get_task(task_id)? else {
            return Ok(());
        };
        if task.state == TaskState::Complete {
            return Ok(());
        }
        let Some(agent) = db.get_agent(agent_id)? else {
            return Ok(());
        };
        if agent.ended_at.is_some() {
            return Ok(());
        }

        match &agent_text {
            None => {
                // Delay schedule exhausted and still nothing: close out empty.
                lifecycle.complete_task(
                    &db,
                    &agent,
                    &task,
                    "hook:stop:deferred_empty",
                    None,
                    TurnIntent::Completion,
                )?;
                final_state = TaskState::Complete;
            }
            Some(full_text) => {
                let completion_text =
                    deduped_completion_text(core, &agent.transcript_path, agent_id, full_text);
                // Fast-forward the cursor past everything this task
                // consumed so the next task's stop reads only its own
                // output.
                if let Some(path) = &agent.transcript_path {
                    if let Ok(meta) = std::fs::metadata(Path::new(path.as_str())) {
                        core.hook_state.set_transcript_offset(agent_id, meta.len());
                    }
                }

                // Intent over the FULL tail; a trailing question wins.
                let intent = detect_agent_intent(Some(full_text));
                let placeholder = find_placeholder_turn(&db, task.id)?;

                if intent.intent == TurnIntent::Question {
                    let question = QuestionPayload {
                        text: full_text.clone(),
                        options: Vec::new(),
                        source: QuestionSource::FreeText,
                    };
                    match &placeholder {
                        Some(turn) => {
                            db.upgrade_turn(
                                turn.id,
                                full_text,
                                TurnIntent::Question,
                                Some(&question),
                            )?;
                            broadcasts.push(EventPayload::TurnUpdated {
                                agent_id,
                                turn_id: turn.id,
                                timestamp: Utc::now(),
                                update_type: "placeholder_upgrade".to_string(),
                            });
                        }
                        None => {
                            let mut new_turn = crewtrace_store::NewTurn::basic(
                                task.id,
                                TurnActor::Agent,
                                TurnIntent::Question,
                                full_text,
                            );
                            new_turn.question = Some(question);
                            let turn = db.create_turn(&new_turn)?;
                            lifecycle.queue_turn_summarisation(turn.id);
                            broadcasts.push(turn_created_payload(&agent, &turn, None));
                        }
                    }
                    if task.state != TaskState::AwaitingInput {
                        lifecycle.update_task_state(
                            &db,
                            &agent,
                            &task,
                            TaskState::AwaitingInput,
                            "hook:stop:deferred_question",
                            intent.confidence,
                        )?;
                    }
                    final_state = TaskState::AwaitingInput;
                } else {
                    let final_intent = if intent.intent.is_completing() {
                        intent.intent
                    } else {
                        TurnIntent::Completion
                    };
                    let trigger = if final_intent == TurnIntent::EndOfTask {
                        "hook:stop:deferred_end_of_task"
                    } else {
                        "hook:stop:deferred"
                    };

                    match &placeholder {
                        Some(turn) => {
                            // The "waiting for input" placeholder was a
                            // false alarm; it becomes the completion turn.
                            db.upgrade_turn(turn.id, &completion_text, final_intent, None)?;
                            lifecycle.complete_task(&db, &agent, &task, trigger, None, final_intent)?;
                            broadcasts.push(EventPayload::TurnUpdated {
                                agent_id,
                                turn_id: turn.id,
                                timestamp: Utc::now(),
                                update_type: "placeholder_upgrade".to_string(),
                            });
                        }
                        None => {
                            let turn = lifecycle.complete_task(
                                &db,
                                &agent,
                                &task,
                                trigger,
                                Some(&completion_text),
                                final_intent,
                            )?;
                            if let Some(turn) = &turn {
                                broadcasts.push(turn_created_payload(&agent, turn, None));
                            }
                        }
                    }
                    db.set_task_full_output(task.id, full_text)?;
                    final_state = TaskState::Complete;
                }

                broadcasts.push(EventPayload::StateChanged {
                    agent_id,
                    project_id: agent.project_id,
                    event_type: "stop_deferred".to_string(),
                    new_state: final_state.as_str().to_uppercase(),
                    message: None,
                });
            }
        }
        tx.commit()?;
    }
    drop(guard);

    core.enqueue_post_commit(agent_id, &mut lifecycle);
    for payload in broadcasts {
        core.broadcaster.broadcast(payload);
    }
    core.card_refresh(agent_id, "stop_deferred");

    info!(agent_id, new_state = %final_state, "deferred_stop applied");
    Ok(())
}

/// Completion text excludes what was already surfaced as PROGRESS turns:
/// re-read the transcript from the saved offset and keep only the fresh
/// assistant entries. When everything was captured (or nothing fresh
/// parses), fall back to the full tail so a completion turn still exists.
fn deduped_completion_text(
    core: &Arc<Core>,
    transcript_path: &Option<String>,
    agent_id: i64,
    full_text: &str,
) -> String {
    let captured = core.hook_state.consume_progress_texts(agent_id);
    if captured.is_empty() {
        return full_text.to_string();
    }

    let offset = core.hook_state.transcript_offset(agent_id).unwrap_or(0);
    if offset == 0 {
        return full_text.to_string();
    }
    let Some(path) = transcript_path else {
        return full_text.to_string();
    };

    let Ok((entries, _)) = read_entries_from_offset(Path::new(path.as_str()), offset) else {
        return full_text.to_string();
    };
    let fresh: Vec<String> = entries
        .into_iter()
        .filter(|e| e.role == TranscriptRole::Assistant && e.has_text())
        .filter_map(|e| e.text)
        .map(|t| t.trim().to_string())
        .collect();
    if fresh.is_empty() {
        full_text.to_string()
    } else {
        fresh.join("\n\n")
    }
}

fn find_placeholder_turn(
    db: &crewtrace_store::Database,
    task_id: i64,
) -> Result<Option<Turn>> {
    let turns = db.turns_for_task(task_id)?;
    Ok(turns
        .into_iter()
        .rev()
        .find(|t| {
            t.actor == TurnActor::Agent
                && t.intent == TurnIntent::Question
                && t.text == PLACEHOLDER_QUESTION
        }))
}
