//! Hook ingestor: turns the external push-event stream into timeline
//! mutations.
//!
//! Every handler follows the same skeleton: correlate, take the per-agent
//! lock, mutate inside one transaction, commit, release, then run
//! summarizations and broadcasts post-commit. Post-commit failures are
//! logged and swallowed; they never poison the timeline.

pub mod deferred;

use crate::correlator::Correlation;
use crate::error::{Error, Result};
use crate::events::EventPayload;
use crate::lifecycle::TaskLifecycle;
use crate::runtime::Core;
use chrono::Utc;
use crewtrace_engine::intent::detect_agent_intent;
use crewtrace_engine::transcript::{read_entries_from_offset, TranscriptRole};
use crewtrace_store::{Database, LockNamespace, NewEvent, NewTurn};
use crewtrace_types::{
    event_type, is_team_internal_content, Agent, FileMeta, QuestionPayload, QuestionSource, Task,
    TaskState, TimestampSource, Turn, TurnActor, TurnIntent,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Placeholder text for the ambient "waiting for input" signal; the
/// deferred-stop worker replaces it with the real question once the
/// transcript flushes.
pub const PLACEHOLDER_QUESTION: &str = "Agent is waiting for your input";

const MIN_PROGRESS_LEN: usize = 10;
const TERMINAL_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// One push event from the external agent's lifecycle hooks.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookEvent {
    pub session_id: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<serde_json::Value>,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub pane_id: Option<String>,
}

impl HookEvent {
    pub fn for_session(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            ..Default::default()
        }
    }
}

/// Result of one ingest call.
#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub ok: bool,
    pub agent_id: i64,
    pub new_state: String,
    pub state_changed: bool,
    pub error: Option<String>,
}

impl HookOutcome {
    fn ok(agent_id: i64, new_state: TaskState, state_changed: bool) -> Self {
        Self {
            ok: true,
            agent_id,
            new_state: new_state.as_str().to_uppercase(),
            state_changed,
            error: None,
        }
    }
}

/// Result of the respond path.
#[derive(Debug, Clone)]
pub struct RespondOutcome {
    pub ok: bool,
    pub new_state: String,
    pub latency_ms: u64,
    pub error_kind: Option<String>,
}

impl RespondOutcome {
    fn failure(kind: &str, state: &str, started: Instant) -> Self {
        Self {
            ok: false,
            new_state: state.to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
            error_kind: Some(kind.to_string()),
        }
    }
}

enum StopAction {
    NoTask,
    Applied {
        new_state: TaskState,
        turn: Option<Turn>,
    },
    Deferred {
        task_id: i64,
    },
}

pub struct HookIngestor {
    core: Arc<Core>,
}

impl HookIngestor {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    fn correlate(&self, event: &HookEvent) -> Result<Correlation> {
        if event.session_id.trim().is_empty() {
            return Err(Error::PayloadInvalid("session_id is required".to_string()));
        }
        let db = self.core.db.lock().unwrap_or_else(|e| e.into_inner());
        self.core.correlator.correlate(
            &db,
            &event.session_id,
            event.working_directory.as_deref(),
        )
    }

    /// Post-commit epilogue: summarizations to the worker, broadcasts,
    /// card refresh. Must run with no locks held.
    fn finish(
        &self,
        agent_id: i64,
        lifecycle: &mut TaskLifecycle,
        broadcasts: Vec<EventPayload>,
        reason: &str,
    ) {
        self.core.enqueue_post_commit(agent_id, lifecycle);
        for payload in broadcasts {
            self.core.broadcaster.broadcast(payload);
        }
        self.core.card_refresh(agent_id, reason);
    }

    // ── session_start ────────────────────────────────────────────────

    pub fn session_start(&self, event: &HookEvent) -> Result<HookOutcome> {
        let correlation = self.correlate(event)?;
        let agent = correlation.agent;
        self.core.record_hook("session_start");

        let guard = self.core.locks.lock(
            LockNamespace::Agent,
            agent.id,
            self.core.config.lock_timeout(),
        )?;
        let mut lifecycle = TaskLifecycle::new();
        let new_state;
        {
            let db = self.core.db.lock().unwrap_or_else(|e| e.into_inner());
            let tx = db.begin()?;
            db.touch_agent(agent.id, Utc::now())?;
            if let Some(path) = &event.transcript_path {
                db.set_agent_transcript_path(agent.id, path)?;
            }
            if let Some(pane) = &event.pane_id {
                db.set_agent_pane(agent.id, pane)?;
            }
            if correlation.is_new {
                db.record_event(&NewEvent {
                    timestamp: Utc::now(),
                    project_id: Some(agent.project_id),
                    agent_id: Some(agent.id),
                    task_id: None,
                    turn_id: None,
                    event_type: event_type::SESSION_DISCOVERED.to_string(),
                    payload: Some(serde_json::json!({
                        "session_id": event.session_id,
                        "method": correlation.method.as_str(),
                    })),
                })?;
            }
            new_state = TaskLifecycle::derive_agent_state(&db, agent.id)?;
            tx.commit()?;
        }
        self.core.hook_state.on_session_start(agent.id);
        drop(guard);

        let mut broadcasts = Vec::new();
        if correlation.is_new {
            broadcasts.push(EventPayload::SessionCreated {
                agent_id: agent.id,
                project_id: agent.project_id,
                session_uuid: agent.session_uuid.to_string(),
            });
        }
        self.finish(agent.id, &mut lifecycle, broadcasts, "session_start");

        info!(agent_id = agent.id, session = %event.session_id, "hook: session_start");
        Ok(HookOutcome::ok(agent.id, new_state, false))
    }

    // ── user_prompt_submit ───────────────────────────────────────────

    pub fn user_prompt_submit(&self, event: &HookEvent) -> Result<HookOutcome> {
        let correlation = self.correlate(event)?;
        let agent = correlation.agent;
        self.core.record_hook("user_prompt_submit");

        // The system's own echo: a respond was just delivered through the
        // terminal sink. Suppress within the TTL.
        if self.core.hook_state.is_respond_pending(agent.id)
            || self.core.hook_state.is_respond_inflight(agent.id)
        {
            debug!(agent_id = agent.id, "user_prompt_submit suppressed (respond echo)");
            let db = self.core.db.lock().unwrap_or_else(|e| e.into_inner());
            let state = TaskLifecycle::derive_agent_state(&db, agent.id)?;
            return Ok(HookOutcome::ok(agent.id, state, false));
        }

        let guard = self.core.locks.lock(
            LockNamespace::Agent,
            agent.id,
            self.core.config.lock_timeout(),
        )?;
        let mut lifecycle = TaskLifecycle::new();
        let outcome;
        let new_state;
        {
            let db = self.core.db.lock().unwrap_or_else(|e| e.into_inner());
            let tx = db.begin()?;
            db.touch_agent(agent.id, Utc::now())?;
            self.core.hook_state.on_new_response_cycle(agent.id);
            let file_meta = self.core.hook_state.consume_file_upload_pending(agent.id);

            outcome = lifecycle.process_turn(
                &db,
                &agent,
                TurnActor::User,
                event.text.as_deref(),
                file_meta,
                false,
            )?;

            // The agent process starts working as soon as the prompt is
            // accepted; reflect that without waiting for its first output.
            if outcome.success {
                if let Some(task) = &outcome.task {
                    if task.state == TaskState::Commanded {
                        lifecycle.update_task_state(
                            &db,
                            &agent,
                            task,
                            TaskState::Processing,
                            "hook:user_prompt_submit",
                            1.0,
                        )?;
                    }
                }
            }
            new_state = TaskLifecycle::derive_agent_state(&db, agent.id)?;
            tx.commit()?;
        }
        drop(guard);

        let mut broadcasts = Vec::new();
        if outcome.success {
            broadcasts.push(EventPayload::StateChanged {
                agent_id: agent.id,
                project_id: agent.project_id,
                event_type: "user_prompt_submit".to_string(),
                new_state: new_state.as_str().to_uppercase(),
                message: None,
            });
            if let Some(turn) = &outcome.created_turn {
                broadcasts.push(turn_created_payload(&agent, turn, None));
            }
        }
        self.finish(agent.id, &mut lifecycle, broadcasts, "user_prompt_submit");

        info!(
            agent_id = agent.id,
            session = %event.session_id,
            new_state = %new_state,
            ok = outcome.success,
            "hook: user_prompt_submit"
        );
        Ok(HookOutcome {
            ok: outcome.success,
            agent_id: agent.id,
            new_state: new_state.as_str().to_uppercase(),
            state_changed: outcome.success,
            error: outcome.error,
        })
    }

    // ── pre_tool_use ─────────────────────────────────────────────────

    pub fn pre_tool_use(&self, event: &HookEvent) -> Result<HookOutcome> {
        let correlation = self.correlate(event)?;
        let agent = correlation.agent;
        self.core.record_hook("pre_tool_use");

        let tool_name = event.tool_name.as_deref().unwrap_or_default();
        let is_question_tool = self.core.config.is_question_tool(tool_name);

        let guard = self.core.locks.lock(
            LockNamespace::Agent,
            agent.id,
            self.core.config.lock_timeout(),
        )?;
        let mut lifecycle = TaskLifecycle::new();
        let mut created_turns: Vec<Turn> = Vec::new();
        let mut question_turn: Option<Turn> = None;
        let mut state_changed = false;
        let new_state;
        {
            let db = self.core.db.lock().unwrap_or_else(|e| e.into_inner());
            let tx = db.begin()?;
            db.touch_agent(agent.id, Utc::now())?;

            let current = db.current_task(agent.id)?;

            // Intermediate agent text between tool calls becomes visible
            // PROGRESS turns and feeds deferred-stop dedup.
            if let Some(task) = &current {
                if task.state == TaskState::Processing {
                    created_turns.extend(self.capture_progress(
                        &db,
                        &agent,
                        task,
                        &mut lifecycle,
                    )?);
                }
            }

            // A question that never got its answer: if AWAITING_INPUT has
            // sat past the window and the agent is now using tools again,
            // recover with a synthetic progress marker first.
            if let Some(task) = &current {
                if task.state == TaskState::AwaitingInput && self.awaiting_is_stale(&db, task)? {
                    let turn = db.create_turn(&NewTurn::basic(
                        task.id,
                        TurnActor::Agent,
                        TurnIntent::Progress,
                        "Recovered from stale awaiting-input state",
                    ))?;
                    lifecycle.queue_turn_summarisation(turn.id);
                    lifecycle.update_task_state(
                        &db,
                        &agent,
                        task,
                        TaskState::AwaitingInput,
                        "hook:pre_tool_use:stale_awaiting_recovery",
                        1.0,
                    )?;
                    created_turns.push(turn);
                }
            }

            if is_question_tool {
                if let Some(task) = db.current_task(agent.id)? {
                    let question = question_from_tool_input(
                        tool_name,
                        event.tool_input.as_ref(),
                        QuestionSource::ToolInput,
                    );
                    let mut new_turn = NewTurn::basic(
                        task.id,
                        TurnActor::Agent,
                        TurnIntent::Question,
                        &question.text,
                    );
                    new_turn.question = Some(question);
                    let turn = db.create_turn(&new_turn)?;
                    lifecycle.queue_turn_summarisation(turn.id);
                    self.core.hook_state.set_awaiting_tool(agent.id, tool_name);
                    lifecycle.update_task_state(
                        &db,
                        &agent,
                        &task,
                        TaskState::AwaitingInput,
                        "pre_tool_use",
                        1.0,
                    )?;
                    question_turn = Some(turn);
                    state_changed = true;
                }
            }

            new_state = TaskLifecycle::derive_agent_state(&db, agent.id)?;
            tx.commit()?;
        }
        drop(guard);

        let mut broadcasts = Vec::new();
        for turn in &created_turns {
            broadcasts.push(turn_created_payload(&agent, turn, None));
        }
        if let Some(turn) = &question_turn {
            broadcasts.push(turn_created_payload(&agent, turn, event.tool_input.clone()));
        }
        if state_changed {
            broadcasts.push(EventPayload::StateChanged {
                agent_id: agent.id,
                project_id: agent.project_id,
                event_type: "pre_tool_use".to_string(),
                new_state: new_state.as_str().to_uppercase(),
                message: Some(tool_name.to_string()),
            });
        }
        self.finish(agent.id, &mut lifecycle, broadcasts, "pre_tool_use");

        Ok(HookOutcome::ok(agent.id, new_state, state_changed))
    }

    // ── permission_request ───────────────────────────────────────────

    pub fn permission_request(&self, event: &HookEvent) -> Result<HookOutcome> {
        let correlation = self.correlate(event)?;
        let agent = correlation.agent;
        self.core.record_hook("permission_request");

        let tool_name = event.tool_name.as_deref().unwrap_or("a tool");

        let guard = self.core.locks.lock(
            LockNamespace::Agent,
            agent.id,
            self.core.config.lock_timeout(),
        )?;
        let mut lifecycle = TaskLifecycle::new();
        let mut created_turn = None;
        let mut state_changed = false;
        let new_state;
        {
            let db = self.core.db.lock().unwrap_or_else(|e| e.into_inner());
            let tx = db.begin()?;
            db.touch_agent(agent.id, Utc::now())?;

            if let Some(task) = db.current_task(agent.id)? {
                let mut question = question_from_tool_input(
                    tool_name,
                    event.tool_input.as_ref(),
                    QuestionSource::PermissionRequest,
                );
                if question.text == tool_name {
                    question.text = format!("Permission required: {}", tool_name);
                }
                let mut new_turn = NewTurn::basic(
                    task.id,
                    TurnActor::Agent,
                    TurnIntent::Question,
                    &question.text,
                );
                new_turn.question = Some(question);
                let turn = db.create_turn(&new_turn)?;
                lifecycle.queue_turn_summarisation(turn.id);
                self.core.hook_state.set_awaiting_tool(agent.id, tool_name);
                lifecycle.update_task_state(
                    &db,
                    &agent,
                    &task,
                    TaskState::AwaitingInput,
                    "permission_request",
                    1.0,
                )?;
                created_turn = Some(turn);
                state_changed = true;
            }

            new_state = TaskLifecycle::derive_agent_state(&db, agent.id)?;
            tx.commit()?;
        }
        drop(guard);

        let mut broadcasts = Vec::new();
        if let Some(turn) = &created_turn {
            broadcasts.push(turn_created_payload(&agent, turn, event.tool_input.clone()));
            broadcasts.push(EventPayload::StateChanged {
                agent_id: agent.id,
                project_id: agent.project_id,
                event_type: "permission_request".to_string(),
                new_state: new_state.as_str().to_uppercase(),
                message: Some(tool_name.to_string()),
            });
        }
        self.finish(agent.id, &mut lifecycle, broadcasts, "permission_request");

        Ok(HookOutcome::ok(agent.id, new_state, state_changed))
    }

    // ── stop ─────────────────────────────────────────────────────────

    pub fn stop(&self, event: &HookEvent) -> Result<HookOutcome> {
        let correlation = self.correlate(event)?;
        let agent = correlation.agent;
        self.core.record_hook("stop");

        let guard = self.core.locks.lock(
            LockNamespace::Agent,
            agent.id,
            self.core.config.lock_timeout(),
        )?;
        let mut lifecycle = TaskLifecycle::new();
        let action;
        let new_state;
        {
            let db = self.core.db.lock().unwrap_or_else(|e| e.into_inner());
            let tx = db.begin()?;
            db.touch_agent(agent.id, Utc::now())?;

            match db.current_task(agent.id)? {
                None => {
                    action = StopAction::NoTask;
                }
                Some(task) => {
                    action = self.apply_stop(&db, &agent, &task, &mut lifecycle)?;
                }
            }
            new_state = TaskLifecycle::derive_agent_state(&db, agent.id)?;
            tx.commit()?;
        }
        drop(guard);

        let mut broadcasts = Vec::new();
        let mut state_changed = false;
        match &action {
            StopAction::NoTask => {}
            StopAction::Applied { new_state, turn } => {
                state_changed = true;
                broadcasts.push(EventPayload::StateChanged {
                    agent_id: agent.id,
                    project_id: agent.project_id,
                    event_type: "stop".to_string(),
                    new_state: new_state.as_str().to_uppercase(),
                    message: None,
                });
                if let Some(turn) = turn {
                    broadcasts.push(turn_created_payload(&agent, turn, None));
                }
            }
            StopAction::Deferred { .. } => {}
        }
        self.finish(agent.id, &mut lifecycle, broadcasts, "stop");

        if let StopAction::Deferred { task_id } = action {
            deferred::schedule_deferred_stop(Arc::clone(&self.core), agent.id, task_id);
        }

        info!(agent_id = agent.id, session = %event.session_id, new_state = %new_state, "hook: stop");
        Ok(HookOutcome::ok(agent.id, new_state, state_changed))
    }

    fn apply_stop(
        &self,
        db: &Database,
        agent: &Agent,
        task: &Task,
        lifecycle: &mut TaskLifecycle,
    ) -> Result<StopAction> {
        let offset = self.core.hook_state.transcript_offset(agent.id).unwrap_or(0);
        let assistant_texts = match &agent.transcript_path {
            Some(path) => {
                let (entries, new_offset) =
                    read_entries_from_offset(Path::new(path), offset).unwrap_or((Vec::new(), offset));
                self.core.hook_state.set_transcript_offset(agent.id, new_offset);
                entries
                    .into_iter()
                    .filter(|e| e.role == TranscriptRole::Assistant && e.has_text())
                    .filter_map(|e| e.text)
                    .map(|t| t.trim().to_string())
                    .collect::<Vec<_>>()
            }
            None => Vec::new(),
        };

        if assistant_texts.is_empty() {
            if task.state == TaskState::Processing {
                // Transcript not flushed yet; hand off to the deferred
                // single-flight worker.
                return Ok(StopAction::Deferred { task_id: task.id });
            }
            if task.state == TaskState::AwaitingInput {
                // The question is already on record; this stop is the
                // agent going quiet while it waits.
                return Ok(StopAction::NoTask);
            }
            // Nothing to attach and nothing in flight: close it out.
            self.core.hook_state.consume_progress_texts(agent.id);
            lifecycle.complete_task(db, agent, task, "hook:stop", None, TurnIntent::Completion)?;
            return Ok(StopAction::Applied {
                new_state: TaskState::Complete,
                turn: None,
            });
        }

        let full_text = assistant_texts.join("\n\n");

        // Text already surfaced as PROGRESS turns is not repeated in the
        // completion turn.
        let captured: HashSet<String> = self
            .core
            .hook_state
            .consume_progress_texts(agent.id)
            .into_iter()
            .map(|t| t.trim().to_string())
            .collect();
        let fresh: Vec<String> = assistant_texts
            .iter()
            .filter(|t| !captured.contains(t.as_str()))
            .cloned()
            .collect();
        let completion_text = if fresh.is_empty() {
            full_text.clone()
        } else {
            fresh.join("\n\n")
        };

        // Intent over the FULL tail; trailing questions live there.
        let intent = detect_agent_intent(Some(&full_text));
        if intent.intent == TurnIntent::Question {
            let mut new_turn =
                NewTurn::basic(task.id, TurnActor::Agent, TurnIntent::Question, &full_text);
            new_turn.question = Some(QuestionPayload {
                text: full_text.clone(),
                options: Vec::new(),
                source: QuestionSource::FreeText,
            });
            new_turn.is_internal = is_team_internal_content(Some(&full_text));
            let turn = db.create_turn(&new_turn)?;
            lifecycle.queue_turn_summarisation(turn.id);
            lifecycle.update_task_state(
                db,
                agent,
                task,
                TaskState::AwaitingInput,
                "hook:stop:question_detected",
                intent.confidence,
            )?;
            return Ok(StopAction::Applied {
                new_state: TaskState::AwaitingInput,
                turn: Some(turn),
            });
        }

        let final_intent = if intent.intent.is_completing() {
            intent.intent
        } else {
            TurnIntent::Completion
        };
        let turn = lifecycle.complete_task(
            db,
            agent,
            task,
            "hook:stop",
            Some(&completion_text),
            final_intent,
        )?;
        if completion_text != full_text {
            db.set_task_full_output(task.id, &full_text)?;
        }
        Ok(StopAction::Applied {
            new_state: TaskState::Complete,
            turn,
        })
    }

    // ── notification ─────────────────────────────────────────────────

    pub fn notification(&self, event: &HookEvent) -> Result<HookOutcome> {
        let correlation = self.correlate(event)?;
        let agent = correlation.agent;
        self.core.record_hook("notification");

        let guard = self.core.locks.lock(
            LockNamespace::Agent,
            agent.id,
            self.core.config.lock_timeout(),
        )?;
        let mut lifecycle = TaskLifecycle::new();
        let mut created_turn = None;
        let mut state_changed = false;
        let new_state;
        {
            let db = self.core.db.lock().unwrap_or_else(|e| e.into_inner());
            let tx = db.begin()?;
            db.touch_agent(agent.id, Utc::now())?;

            // An ambient "waiting for input" while PROCESSING means the
            // transcript has not revealed the question yet. Record a
            // placeholder the deferred-stop worker can upgrade in place.
            if let Some(task) = db.current_task(agent.id)? {
                if task.state == TaskState::Processing {
                    let mut new_turn = NewTurn::basic(
                        task.id,
                        TurnActor::Agent,
                        TurnIntent::Question,
                        PLACEHOLDER_QUESTION,
                    );
                    new_turn.question = Some(QuestionPayload {
                        text: PLACEHOLDER_QUESTION.to_string(),
                        options: Vec::new(),
                        source: QuestionSource::Notification,
                    });
                    let turn = db.create_turn(&new_turn)?;
                    lifecycle.update_task_state(
                        &db,
                        &agent,
                        &task,
                        TaskState::AwaitingInput,
                        "notification",
                        0.8,
                    )?;
                    created_turn = Some(turn);
                    state_changed = true;
                }
            }

            new_state = TaskLifecycle::derive_agent_state(&db, agent.id)?;
            tx.commit()?;
        }
        drop(guard);

        let mut broadcasts = Vec::new();
        if let Some(turn) = &created_turn {
            broadcasts.push(turn_created_payload(&agent, turn, None));
            broadcasts.push(EventPayload::StateChanged {
                agent_id: agent.id,
                project_id: agent.project_id,
                event_type: "notification".to_string(),
                new_state: new_state.as_str().to_uppercase(),
                message: None,
            });
        }
        self.finish(agent.id, &mut lifecycle, broadcasts, "notification");

        Ok(HookOutcome::ok(agent.id, new_state, state_changed))
    }

    // ── session_end ──────────────────────────────────────────────────

    pub fn session_end(&self, event: &HookEvent) -> Result<HookOutcome> {
        let correlation = self.correlate(event)?;
        let agent = correlation.agent;
        self.core.record_hook("session_end");

        let guard = self.core.locks.lock(
            LockNamespace::Agent,
            agent.id,
            self.core.config.lock_timeout(),
        )?;
        let mut lifecycle = TaskLifecycle::new();
        {
            let db = self.core.db.lock().unwrap_or_else(|e| e.into_inner());
            let tx = db.begin()?;
            let now = Utc::now();
            db.touch_agent(agent.id, now)?;
            db.set_agent_ended(agent.id, now)?;

            if let Some(task) = db.current_task(agent.id)? {
                lifecycle.complete_task(
                    &db,
                    &agent,
                    &task,
                    "hook:session_end",
                    None,
                    TurnIntent::Completion,
                )?;
            }

            db.record_event(&NewEvent {
                timestamp: now,
                project_id: Some(agent.project_id),
                agent_id: Some(agent.id),
                task_id: None,
                turn_id: None,
                event_type: event_type::SESSION_ENDED.to_string(),
                payload: Some(serde_json::json!({
                    "session_uuid": agent.session_uuid.to_string(),
                })),
            })?;
            tx.commit()?;
        }
        self.core.hook_state.on_session_end(agent.id);
        drop(guard);

        let broadcasts = vec![
            EventPayload::StateChanged {
                agent_id: agent.id,
                project_id: agent.project_id,
                event_type: "session_end".to_string(),
                new_state: "COMPLETE".to_string(),
                message: None,
            },
            EventPayload::SessionEnded {
                agent_id: agent.id,
                project_id: agent.project_id,
                session_uuid: agent.session_uuid.to_string(),
                reason: None,
            },
        ];
        self.finish(agent.id, &mut lifecycle, broadcasts, "session_end");

        // The transcript is final now; cover the whole session, not just
        // the recent window.
        crate::reconciler::reconcile_full_session(&self.core, agent.id);

        info!(agent_id = agent.id, session = %event.session_id, "hook: session_end");
        Ok(HookOutcome {
            ok: true,
            agent_id: agent.id,
            new_state: "COMPLETE".to_string(),
            state_changed: true,
            error: None,
        })
    }

    // ── respond (user answer) ────────────────────────────────────────

    pub fn user_answer(
        &self,
        agent_id: i64,
        text: &str,
        file_meta: Option<FileMeta>,
    ) -> Result<RespondOutcome> {
        let started = Instant::now();
        let text = text.trim();
        if text.is_empty() {
            return Ok(RespondOutcome::failure("missing_text", "UNKNOWN", started));
        }

        let (agent, task) = {
            let db = self.core.db.lock().unwrap_or_else(|e| e.into_inner());
            let Some(agent) = db.get_agent(agent_id)? else {
                return Ok(RespondOutcome::failure("agent_not_found", "UNKNOWN", started));
            };
            let task = db.current_task(agent_id)?;
            (agent, task)
        };

        let state_label = task
            .as_ref()
            .map(|t| t.state.as_str().to_uppercase())
            .unwrap_or_else(|| "IDLE".to_string());
        let Some(task) = task.filter(|t| t.state == TaskState::AwaitingInput) else {
            return Ok(RespondOutcome::failure("wrong_state", &state_label, started));
        };

        let Some(pane_id) = agent.pane_id.clone() else {
            return Ok(RespondOutcome::failure(
                "no_pane",
                "AWAITING_INPUT",
                started,
            ));
        };

        // Pre-commit marker so the echoed hook skips turn creation even
        // before the commit lands.
        self.core.hook_state.set_respond_inflight(agent.id);
        if let Err(reason) = self
            .core
            .terminal
            .send_text(&pane_id, text, TERMINAL_SEND_TIMEOUT)
        {
            self.core.hook_state.clear_respond_inflight(agent.id);
            warn!(agent_id, %reason, "respond: terminal send failed");
            return Ok(RespondOutcome::failure(
                "terminal_send_failed",
                "AWAITING_INPUT",
                started,
            ));
        }

        let guard = self.core.locks.lock(
            LockNamespace::Agent,
            agent.id,
            self.core.config.lock_timeout(),
        )?;
        let mut lifecycle = TaskLifecycle::new();
        let created_turn;
        {
            let db = self.core.db.lock().unwrap_or_else(|e| e.into_inner());
            let tx = db.begin()?;
            db.touch_agent(agent.id, Utc::now())?;

            let mut new_turn = NewTurn::basic(task.id, TurnActor::User, TurnIntent::Answer, text);
            new_turn.timestamp_source = TimestampSource::User;
            new_turn.file_meta = file_meta;
            new_turn.answers_turn_id = db
                .turns_for_task(task.id)?
                .iter()
                .rev()
                .find(|t| t.actor == TurnActor::Agent && t.intent == TurnIntent::Question)
                .map(|t| t.id);
            created_turn = db.create_turn(&new_turn)?;
            lifecycle.queue_turn_summarisation(created_turn.id);

            lifecycle.update_task_state(&db, &agent, &task, TaskState::Processing, "user:answer", 1.0)?;
            tx.commit()?;
        }
        self.core.hook_state.clear_awaiting_tool(agent.id);
        self.core.hook_state.set_respond_pending(agent.id);
        drop(guard);

        let broadcasts = vec![
            EventPayload::StateChanged {
                agent_id: agent.id,
                project_id: agent.project_id,
                event_type: "respond".to_string(),
                new_state: "PROCESSING".to_string(),
                message: Some("User responded".to_string()),
            },
            turn_created_payload(&agent, &created_turn, None),
        ];
        self.finish(agent.id, &mut lifecycle, broadcasts, "respond");

        let latency_ms = started.elapsed().as_millis() as u64;
        info!(agent_id, latency_ms, "respond: delivered");
        Ok(RespondOutcome {
            ok: true,
            new_state: "PROCESSING".to_string(),
            latency_ms,
            error_kind: None,
        })
    }

    // ── helpers ──────────────────────────────────────────────────────

    /// Create PROGRESS turns for assistant text written to the transcript
    /// since the last capture. First call only sets the baseline offset.
    fn capture_progress(
        &self,
        db: &Database,
        agent: &Agent,
        task: &Task,
        lifecycle: &mut TaskLifecycle,
    ) -> Result<Vec<Turn>> {
        let Some(path) = agent.transcript_path.as_deref() else {
            return Ok(Vec::new());
        };
        let path = Path::new(path);

        let offset = match self.core.hook_state.transcript_offset(agent.id) {
            Some(offset) => offset,
            None => {
                if let Ok(meta) = std::fs::metadata(path) {
                    self.core.hook_state.set_transcript_offset(agent.id, meta.len());
                }
                return Ok(Vec::new());
            }
        };

        let Ok((entries, new_offset)) = read_entries_from_offset(path, offset) else {
            return Ok(Vec::new());
        };
        if new_offset == offset {
            return Ok(Vec::new());
        }
        self.core.hook_state.set_transcript_offset(agent.id, new_offset);

        let mut turns = Vec::new();
        for entry in entries {
            if entry.role != TranscriptRole::Assistant {
                continue;
            }
            let Some(text) = entry.text.as_deref() else {
                continue;
            };
            let text = text.trim();
            if text.len() < MIN_PROGRESS_LEN {
                continue;
            }
            self.core.hook_state.append_progress_text(agent.id, text);

            let mut new_turn =
                NewTurn::basic(task.id, TurnActor::Agent, TurnIntent::Progress, text);
            new_turn.is_internal = is_team_internal_content(Some(text));
            if let Some(ts) = entry.timestamp {
                new_turn.timestamp = ts;
                new_turn.timestamp_source = TimestampSource::Jsonl;
            }
            let turn = db.create_turn(&new_turn)?;
            lifecycle.queue_turn_summarisation(turn.id);
            turns.push(turn);
        }
        if !turns.is_empty() {
            debug!(agent_id = agent.id, count = turns.len(), "captured progress turns");
        }
        Ok(turns)
    }

    fn awaiting_is_stale(&self, db: &Database, task: &Task) -> Result<bool> {
        let window = chrono::Duration::seconds(self.core.config.stale_awaiting_seconds as i64);
        let turns = db.turns_for_task(task.id)?;
        let last_question = turns
            .iter()
            .rev()
            .find(|t| t.actor == TurnActor::Agent && t.intent == TurnIntent::Question);
        let Some(question) = last_question else {
            return Ok(false);
        };
        // A user answer after the question means it resolved normally.
        let answered = turns
            .iter()
            .any(|t| t.actor == TurnActor::User && t.timestamp >= question.timestamp);
        Ok(!answered && Utc::now() - question.timestamp > window)
    }
}

pub(crate) fn turn_created_payload(
    agent: &Agent,
    turn: &Turn,
    tool_input: Option<serde_json::Value>,
) -> EventPayload {
    EventPayload::TurnCreated {
        agent_id: agent.id,
        project_id: agent.project_id,
        task_id: turn.task_id,
        turn_id: turn.id,
        actor: turn.actor.as_str().to_string(),
        intent: turn.intent.as_str().to_string(),
        text: turn.text.clone(),
        tool_input,
    }
}

/// Extract a question payload from structured tool input. Falls back to
/// the tool name when no text field is recognizable.
fn question_from_tool_input(
    tool_name: &str,
    tool_input: Option<&serde_json::Value>,
    source: QuestionSource,
) -> QuestionPayload {
    let mut text = None;
    let mut options = Vec::new();

    if let Some(input) = tool_input {
        for key in ["question", "prompt", "message", "plan"] {
            if let Some(value) = input.get(key).and_then(|v| v.as_str()) {
                text = Some(value.to_string());
                break;
            }
        }
        // AskUserQuestion-style nested shape: {"questions": [{"question", "options"}]}
        if text.is_none() {
            if let Some(first) = input
                .get("questions")
                .and_then(|v| v.as_array())
                .and_then(|a| a.first())
            {
                text = first
                    .get("question")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                options = extract_options(first.get("options"));
            }
        }
        if options.is_empty() {
            options = extract_options(input.get("options"));
        }
    }

    QuestionPayload {
        text: text.unwrap_or_else(|| tool_name.to_string()),
        options,
        source,
    }
}

fn extract_options(value: Option<&serde_json::Value>) -> Vec<String> {
    let Some(array) = value.and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    array
        .iter()
        .filter_map(|option| {
            option.as_str().map(|s| s.to_string()).or_else(|| {
                option
                    .get("label")
                    .and_then(|l| l.as_str())
                    .map(|s| s.to_string())
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_from_flat_tool_input() {
        let input = serde_json::json!({"question": "Pick a database", "options": ["postgres", "sqlite"]});
        let q = question_from_tool_input("AskUserQuestion", Some(&input), QuestionSource::ToolInput);
        assert_eq!(q.text, "Pick a database");
        assert_eq!(q.options, vec!["postgres", "sqlite"]);
    }

    #[test]
    fn test_question_from_nested_questions_array() {
        let input = serde_json::json!({
            "questions": [{
                "question": "Which port?",
                "options": [{"label": "8080"}, {"label": "3000"}]
            }]
        });
        let q = question_from_tool_input("AskUserQuestion", Some(&input), QuestionSource::ToolInput);
        assert_eq!(q.text, "Which port?");
        assert_eq!(q.options, vec!["8080", "3000"]);
    }

    #[test]
    fn test_question_falls_back_to_tool_name() {
        let q = question_from_tool_input("ExitPlanMode", None, QuestionSource::ToolInput);
        assert_eq!(q.text, "ExitPlanMode");
        assert!(q.options.is_empty());
    }

    #[test]
    fn test_hook_event_requires_session_id() {
        let event = HookEvent::default();
        assert!(event.session_id.is_empty());
        let event = HookEvent::for_session("sess-1");
        assert_eq!(event.session_id, "sess-1");
    }
}
