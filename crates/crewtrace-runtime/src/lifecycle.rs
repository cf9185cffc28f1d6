//! Task lifecycle manager: the single mutation engine for tasks and turns.
//!
//! `update_task_state` validates strictly and rejects disallowed moves.
//! `complete_task` validates advisorily (it logs and proceeds) because
//! forced completions (session end, reaper sweep) describe an external
//! lifecycle that has already ended; refusing would leave orphans.
//!
//! Summarization is queued here and executed by the caller after commit;
//! it never blocks the hot path or shares its transaction.

use crate::error::{Error, Result};
use chrono::Utc;
use crewtrace_engine::intent::{detect_intent, IntentResult};
use crewtrace_store::{Database, NewEvent, NewTurn};
use crewtrace_types::{
    event_type, is_team_internal_content, validate_transition, Agent, FileMeta, Task, TaskState,
    TransitionPayload, TransitionResult, Turn, TurnActor, TurnIntent,
};
use tracing::{debug, info, warn};

/// Deferred post-commit summarization work.
#[derive(Debug, Clone, PartialEq)]
pub enum SummarisationRequest {
    Turn { turn_id: i64 },
    Instruction { task_id: i64, command_text: String },
    TaskCompletion { task_id: i64 },
}

/// Deferred post-commit notification work. Completion notifications are
/// not queued here; they ride behind the TaskCompletion summarization so
/// the text they carry is the AI summary.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationRequest {
    AwaitingInput {
        agent_id: i64,
        task_id: i64,
        question_text: Option<String>,
    },
}

/// Result of processing one turn.
#[derive(Debug, Clone)]
pub struct TurnProcessingOutcome {
    pub success: bool,
    pub task: Option<Task>,
    pub transition: Option<TransitionResult>,
    pub intent: Option<IntentResult>,
    pub new_task_created: bool,
    pub created_turn: Option<Turn>,
    pub error: Option<String>,
}

impl TurnProcessingOutcome {
    fn failure(reason: &str, task: Option<Task>, intent: Option<IntentResult>) -> Self {
        Self {
            success: false,
            task,
            transition: None,
            intent,
            new_task_created: false,
            created_turn: None,
            error: Some(reason.to_string()),
        }
    }
}

/// Map a trigger tag onto the (actor, intent) pair the state machine
/// validates with. Hook-originated triggers carry their own tags; the
/// target state refines the intent when they disagree.
fn trigger_actor_intent(trigger: &str, to_state: TaskState) -> (TurnActor, TurnIntent) {
    let (actor, mut intent) = match trigger {
        "hook:user_prompt_submit" | "user:command" => (TurnActor::User, TurnIntent::Command),
        "user:answer" | "respond" => (TurnActor::User, TurnIntent::Answer),
        "hook:stop:question_detected"
        | "hook:stop:deferred_question"
        | "notification"
        | "pre_tool_use"
        | "permission_request"
        | "agent:question" => (TurnActor::Agent, TurnIntent::Question),
        "hook:pre_tool_use:stale_awaiting_recovery"
        | "hook:post_tool_use:inferred"
        | "agent:progress" => (TurnActor::Agent, TurnIntent::Progress),
        "agent:completion" => (TurnActor::Agent, TurnIntent::Completion),
        "agent:end_of_task" => (TurnActor::Agent, TurnIntent::EndOfTask),
        _ => (TurnActor::Agent, TurnIntent::Progress),
    };
    if to_state == TaskState::AwaitingInput {
        intent = TurnIntent::Question;
    } else if to_state == TaskState::Complete && !intent.is_completing() {
        intent = TurnIntent::Completion;
    } else if to_state == TaskState::Processing && intent == TurnIntent::Command {
        // The accepted-prompt bridge: once the prompt is in, the agent is
        // working. Validates as the agent's first progress.
        return (TurnActor::Agent, TurnIntent::Progress);
    }
    (actor, intent)
}

/// Stateful only in its pending-work queues; every row read goes through
/// the store.
#[derive(Default)]
pub struct TaskLifecycle {
    pending_summarisations: Vec<SummarisationRequest>,
    pending_notifications: Vec<NotificationRequest>,
}

impl TaskLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a turn summarization for a turn created outside the
    /// process_turn path (progress capture, question turns).
    pub fn queue_turn_summarisation(&mut self, turn_id: i64) {
        self.pending_summarisations
            .push(SummarisationRequest::Turn { turn_id });
    }

    /// Drain queued post-commit work.
    pub fn take_pending(&mut self) -> (Vec<SummarisationRequest>, Vec<NotificationRequest>) {
        (
            std::mem::take(&mut self.pending_summarisations),
            std::mem::take(&mut self.pending_notifications),
        )
    }

    pub fn current_task(db: &Database, agent_id: i64) -> Result<Option<Task>> {
        Ok(db.current_task(agent_id)?)
    }

    /// The agent's effective state: its current task's state, or IDLE.
    pub fn derive_agent_state(db: &Database, agent_id: i64) -> Result<TaskState> {
        Ok(db
            .current_task(agent_id)?
            .map(|t| t.state)
            .unwrap_or(TaskState::Idle))
    }

    /// Create a task and write the creation transition event.
    pub fn create_task(
        &mut self,
        db: &Database,
        agent: &Agent,
        initial_state: TaskState,
    ) -> Result<Task> {
        let task = db.create_task(agent.id, initial_state, Utc::now())?;
        info!(
            task_id = task.id,
            agent_id = agent.id,
            state = %initial_state,
            "created task"
        );
        self.write_transition_event(
            db,
            agent,
            &task,
            TaskState::Idle,
            initial_state,
            "user:command",
            1.0,
        )?;
        Ok(task)
    }

    /// Strictly validated state update. Creates no turns.
    pub fn update_task_state(
        &mut self,
        db: &Database,
        agent: &Agent,
        task: &Task,
        to_state: TaskState,
        trigger: &str,
        confidence: f64,
    ) -> Result<()> {
        let from_state = task.state;
        let (actor, intent) = trigger_actor_intent(trigger, to_state);
        let validation = validate_transition(from_state, actor, intent);
        if !validation.valid {
            return Err(Error::InvalidTransition(format!(
                "{} (trigger={}, task={})",
                validation.reason, trigger, task.id
            )));
        }

        db.set_task_state(task.id, to_state)?;
        debug!(task_id = task.id, from = %from_state, to = %to_state, trigger, "state updated");

        if to_state == TaskState::AwaitingInput {
            let question_text = db
                .turns_for_task(task.id)?
                .iter()
                .rev()
                .find(|t| t.actor == TurnActor::Agent && t.intent == TurnIntent::Question)
                .map(|t| t.summary.clone().unwrap_or_else(|| t.text.clone()));
            self.pending_notifications.push(NotificationRequest::AwaitingInput {
                agent_id: agent.id,
                task_id: task.id,
                question_text,
            });
        }

        self.write_transition_event(db, agent, task, from_state, to_state, trigger, confidence)?;
        Ok(())
    }

    /// Forced completion. Advisory validation only: unusual transitions
    /// log a warning and proceed, because the external lifecycle already
    /// ended. Returns the completion turn when text was attached.
    pub fn complete_task(
        &mut self,
        db: &Database,
        agent: &Agent,
        task: &Task,
        trigger: &str,
        agent_text: Option<&str>,
        intent: TurnIntent,
    ) -> Result<Option<Turn>> {
        let from_state = task.state;
        let validation = validate_transition(from_state, TurnActor::Agent, intent);
        if !validation.valid {
            warn!(
                task_id = task.id,
                agent_id = agent.id,
                from = %from_state,
                trigger,
                reason = %validation.reason,
                "complete_task: transition not in table (allowing anyway)"
            );
        }

        let now = Utc::now();
        db.set_task_completed(task.id, now)?;

        if let Some(text) = agent_text {
            if !text.is_empty() {
                db.set_task_full_output(task.id, text)?;
            }
        }

        // A completion turn only when there is actual content; empty text
        // would produce noise rows.
        let turn = match agent_text {
            Some(text) if !text.trim().is_empty() => {
                let mut new_turn = NewTurn::basic(task.id, TurnActor::Agent, intent, text);
                new_turn.is_internal = is_team_internal_content(Some(text));
                let turn = db.create_turn(&new_turn)?;
                self.pending_summarisations
                    .push(SummarisationRequest::Turn { turn_id: turn.id });
                Some(turn)
            }
            _ => None,
        };

        info!(task_id = task.id, trigger, "task completed");

        self.write_transition_event(
            db,
            agent,
            task,
            from_state,
            TaskState::Complete,
            trigger,
            1.0,
        )?;

        self.pending_summarisations
            .push(SummarisationRequest::TaskCompletion { task_id: task.id });

        Ok(turn)
    }

    /// The main entry point for (agent, actor, text) turn events.
    pub fn process_turn(
        &mut self,
        db: &Database,
        agent: &Agent,
        actor: TurnActor,
        text: Option<&str>,
        file_meta: Option<FileMeta>,
        is_internal: bool,
    ) -> Result<TurnProcessingOutcome> {
        let current_task = db.current_task(agent.id)?;
        let current_state = current_task
            .as_ref()
            .map(|t| t.state)
            .unwrap_or(TaskState::Idle);

        let intent_result = detect_intent(text, actor, current_state);
        debug!(
            agent_id = agent.id,
            actor = %actor,
            intent = %intent_result.intent,
            confidence = intent_result.confidence,
            "detected intent"
        );

        // USER COMMAND routing: every non-terminal state has a defined
        // answer for "the user spoke a new command".
        if actor == TurnActor::User && intent_result.intent == TurnIntent::Command {
            return self.route_user_command(
                db,
                agent,
                current_task,
                current_state,
                text,
                file_meta,
                is_internal,
                intent_result,
            );
        }

        let Some(task) = current_task else {
            warn!(agent_id = agent.id, "no active task and turn is not a command");
            return Ok(TurnProcessingOutcome::failure(
                "No active task and turn is not a user command",
                None,
                Some(intent_result),
            ));
        };

        let transition = validate_transition(current_state, actor, intent_result.intent);
        if !transition.valid {
            warn!(reason = %transition.reason, "invalid transition rejected");
            return Ok(TurnProcessingOutcome {
                success: false,
                task: Some(task),
                error: Some(transition.reason.clone()),
                transition: Some(transition),
                intent: Some(intent_result),
                new_task_created: false,
                created_turn: None,
            });
        }

        let created_turn = if transition.to_state == TaskState::Complete {
            self.complete_task(
                db,
                agent,
                &task,
                &transition.trigger,
                text,
                intent_result.intent,
            )?
        } else {
            self.update_task_state(
                db,
                agent,
                &task,
                transition.to_state,
                &transition.trigger,
                intent_result.confidence,
            )?;

            let mut new_turn = NewTurn::basic(
                task.id,
                actor,
                intent_result.intent,
                text.unwrap_or_default(),
            );
            new_turn.file_meta = file_meta;
            new_turn.is_internal = is_internal || is_team_internal_content(text);
            // Answers link back to the question they resolve.
            if actor == TurnActor::User && intent_result.intent == TurnIntent::Answer {
                new_turn.answers_turn_id = db
                    .turns_for_task(task.id)?
                    .iter()
                    .rev()
                    .find(|t| t.actor == TurnActor::Agent && t.intent == TurnIntent::Question)
                    .map(|t| t.id);
            }
            let turn = db.create_turn(&new_turn)?;
            self.pending_summarisations
                .push(SummarisationRequest::Turn { turn_id: turn.id });
            Some(turn)
        };

        let task = db.get_task(task.id)?;
        Ok(TurnProcessingOutcome {
            success: true,
            task,
            transition: Some(transition),
            intent: Some(intent_result),
            new_task_created: false,
            created_turn,
            error: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn route_user_command(
        &mut self,
        db: &Database,
        agent: &Agent,
        current_task: Option<Task>,
        current_state: TaskState,
        text: Option<&str>,
        file_meta: Option<FileMeta>,
        is_internal: bool,
        intent_result: IntentResult,
    ) -> Result<TurnProcessingOutcome> {
        // Follow-up before the agent started: append to the same task.
        if current_state == TaskState::Commanded {
            if let Some(task) = &current_task {
                let full_command = match (&task.full_command, text) {
                    (Some(existing), Some(new)) => format!("{}\n{}", existing, new),
                    (None, Some(new)) => new.to_string(),
                    (Some(existing), None) => existing.clone(),
                    (None, None) => String::new(),
                };
                if !full_command.is_empty() {
                    db.set_task_full_command(task.id, &full_command)?;
                }

                let turn =
                    self.create_user_command_turn(db, task.id, text, file_meta, is_internal)?;
                if text.is_some() {
                    self.pending_summarisations
                        .push(SummarisationRequest::Instruction {
                            task_id: task.id,
                            command_text: full_command,
                        });
                }
                info!(task_id = task.id, agent_id = agent.id, "attached follow-up command");
                return Ok(TurnProcessingOutcome {
                    success: true,
                    task: db.get_task(task.id)?,
                    transition: None,
                    intent: Some(intent_result),
                    new_task_created: false,
                    created_turn: Some(turn),
                    error: None,
                });
            }
        }

        // Race against a post-tool-use inferred task: a PROCESSING task
        // with no user turns was opened before this prompt hook arrived.
        // Attach instead of completing it and losing its progress rows.
        if current_state == TaskState::Processing {
            if let Some(task) = &current_task {
                if db.user_turn_count(task.id)? == 0 {
                    if let Some(text) = text {
                        db.set_task_full_command(task.id, text)?;
                    }
                    let turn =
                        self.create_user_command_turn(db, task.id, text, file_meta, is_internal)?;
                    if let Some(text) = text {
                        self.pending_summarisations
                            .push(SummarisationRequest::Instruction {
                                task_id: task.id,
                                command_text: text.to_string(),
                            });
                    }
                    info!(task_id = task.id, agent_id = agent.id, "attached command to inferred task");
                    return Ok(TurnProcessingOutcome {
                        success: true,
                        task: db.get_task(task.id)?,
                        transition: None,
                        intent: Some(intent_result),
                        new_task_created: false,
                        created_turn: Some(turn),
                        error: None,
                    });
                }
            }
        }

        // IDLE / AWAITING_INPUT / lingering PROCESSING: close out whatever
        // is open and start fresh.
        if let Some(task) = &current_task {
            if task.state != TaskState::Complete {
                self.complete_task(db, agent, task, "user:new_command", None, TurnIntent::Completion)?;
            }
        }

        let new_task = self.create_task(db, agent, TaskState::Commanded)?;
        if let Some(text) = text {
            db.set_task_full_command(new_task.id, text)?;
        }
        let turn = self.create_user_command_turn(db, new_task.id, text, file_meta, is_internal)?;
        if let Some(text) = text {
            self.pending_summarisations
                .push(SummarisationRequest::Instruction {
                    task_id: new_task.id,
                    command_text: text.to_string(),
                });
        }

        Ok(TurnProcessingOutcome {
            success: true,
            task: db.get_task(new_task.id)?,
            transition: None,
            intent: Some(intent_result),
            new_task_created: true,
            created_turn: Some(turn),
            error: None,
        })
    }

    fn create_user_command_turn(
        &mut self,
        db: &Database,
        task_id: i64,
        text: Option<&str>,
        file_meta: Option<FileMeta>,
        is_internal: bool,
    ) -> Result<Turn> {
        let mut new_turn = NewTurn::basic(
            task_id,
            TurnActor::User,
            TurnIntent::Command,
            text.unwrap_or_default(),
        );
        new_turn.file_meta = file_meta;
        new_turn.is_internal = is_internal || is_team_internal_content(text);
        let turn = db.create_turn(&new_turn)?;
        self.pending_summarisations
            .push(SummarisationRequest::Turn { turn_id: turn.id });
        Ok(turn)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_transition_event(
        &self,
        db: &Database,
        agent: &Agent,
        task: &Task,
        from_state: TaskState,
        to_state: TaskState,
        trigger: &str,
        confidence: f64,
    ) -> Result<()> {
        let payload = TransitionPayload {
            from_state,
            to_state,
            trigger: trigger.to_string(),
            confidence,
        };
        db.record_event(&NewEvent {
            timestamp: Utc::now(),
            project_id: Some(agent.project_id),
            agent_id: Some(agent.id),
            task_id: Some(task.id),
            turn_id: None,
            event_type: event_type::STATE_TRANSITION.to_string(),
            payload: Some(serde_json::to_value(&payload).unwrap_or_default()),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewtrace_store::NewAgent;
    use uuid::Uuid;

    fn setup() -> (Database, Agent) {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("p", "/p").unwrap();
        let agent = db
            .create_agent(&NewAgent {
                session_uuid: Uuid::new_v4(),
                external_session_id: Some("sess".to_string()),
                project_id: project.id,
                pane_id: None,
                transcript_path: None,
                started_at: Utc::now(),
                last_seen_at: Utc::now(),
            })
            .unwrap();
        (db, agent)
    }

    #[test]
    fn test_user_command_from_idle_creates_task() {
        let (db, agent) = setup();
        let mut lifecycle = TaskLifecycle::new();

        let outcome = lifecycle
            .process_turn(&db, &agent, TurnActor::User, Some("fix auth"), None, false)
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.new_task_created);

        let task = outcome.task.unwrap();
        assert_eq!(task.state, TaskState::Commanded);
        assert_eq!(task.full_command.as_deref(), Some("fix auth"));

        let turns = db.turns_for_task(task.id).unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].intent, TurnIntent::Command);

        // Creation writes a transition event.
        assert_eq!(db.count_events("state_transition").unwrap(), 1);

        let (summaries, _) = lifecycle.take_pending();
        assert!(summaries
            .iter()
            .any(|s| matches!(s, SummarisationRequest::Instruction { .. })));
    }

    #[test]
    fn test_agent_progress_moves_commanded_to_processing() {
        let (db, agent) = setup();
        let mut lifecycle = TaskLifecycle::new();
        lifecycle
            .process_turn(&db, &agent, TurnActor::User, Some("go"), None, false)
            .unwrap();

        let outcome = lifecycle
            .process_turn(
                &db,
                &agent,
                TurnActor::Agent,
                Some("Reading the codebase."),
                None,
                false,
            )
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.task.unwrap().state, TaskState::Processing);
    }

    #[test]
    fn test_agent_completion_completes_task() {
        let (db, agent) = setup();
        let mut lifecycle = TaskLifecycle::new();
        lifecycle
            .process_turn(&db, &agent, TurnActor::User, Some("go"), None, false)
            .unwrap();

        let outcome = lifecycle
            .process_turn(
                &db,
                &agent,
                TurnActor::Agent,
                Some("I've finished the migration."),
                None,
                false,
            )
            .unwrap();
        assert!(outcome.success);
        let task = outcome.task.unwrap();
        assert_eq!(task.state, TaskState::Complete);
        assert!(task.completed_at.is_some());
        assert_eq!(task.full_output.as_deref(), Some("I've finished the migration."));

        let (summaries, _) = lifecycle.take_pending();
        assert!(summaries
            .iter()
            .any(|s| matches!(s, SummarisationRequest::TaskCompletion { .. })));
    }

    #[test]
    fn test_question_transitions_to_awaiting_and_queues_notification() {
        let (db, agent) = setup();
        let mut lifecycle = TaskLifecycle::new();
        lifecycle
            .process_turn(&db, &agent, TurnActor::User, Some("go"), None, false)
            .unwrap();

        let outcome = lifecycle
            .process_turn(
                &db,
                &agent,
                TurnActor::Agent,
                Some("Which database should I use?"),
                None,
                false,
            )
            .unwrap();
        assert_eq!(outcome.task.unwrap().state, TaskState::AwaitingInput);

        let (_, notifications) = lifecycle.take_pending();
        assert_eq!(notifications.len(), 1);
    }

    #[test]
    fn test_answer_links_to_question_turn() {
        let (db, agent) = setup();
        let mut lifecycle = TaskLifecycle::new();
        lifecycle
            .process_turn(&db, &agent, TurnActor::User, Some("go"), None, false)
            .unwrap();
        let question = lifecycle
            .process_turn(
                &db,
                &agent,
                TurnActor::Agent,
                Some("Which database should I use?"),
                None,
                false,
            )
            .unwrap();
        let question_turn_id = question.created_turn.unwrap().id;

        let answer = lifecycle
            .process_turn(&db, &agent, TurnActor::User, Some("postgres"), None, false)
            .unwrap();
        assert!(answer.success);
        let turn = answer.created_turn.unwrap();
        assert_eq!(turn.intent, TurnIntent::Answer);
        assert_eq!(turn.answers_turn_id, Some(question_turn_id));
        assert_eq!(answer.task.unwrap().state, TaskState::Processing);
    }

    #[test]
    fn test_user_text_while_awaiting_resumes_task() {
        let (db, agent) = setup();
        let mut lifecycle = TaskLifecycle::new();
        lifecycle
            .process_turn(&db, &agent, TurnActor::User, Some("go"), None, false)
            .unwrap();
        lifecycle
            .process_turn(&db, &agent, TurnActor::Agent, Some("Proceed?"), None, false)
            .unwrap();
        let first_task = db.current_task(agent.id).unwrap().unwrap();

        let outcome = lifecycle
            .process_turn(&db, &agent, TurnActor::User, Some("also fix CI"), None, false)
            .unwrap();
        // detect_user_intent returns ANSWER while AWAITING_INPUT, so this
        // resumes the task. A genuinely new command arrives via explicit
        // COMMAND routing only from IDLE. Verify resume semantics here.
        assert!(outcome.success);
        assert_eq!(outcome.task.as_ref().unwrap().id, first_task.id);
        assert_eq!(outcome.task.unwrap().state, TaskState::Processing);
    }

    #[test]
    fn test_follow_up_while_commanded_appends() {
        let (db, agent) = setup();
        let mut lifecycle = TaskLifecycle::new();
        lifecycle
            .process_turn(&db, &agent, TurnActor::User, Some("fix auth"), None, false)
            .unwrap();

        let outcome = lifecycle
            .process_turn(&db, &agent, TurnActor::User, Some("and add tests"), None, false)
            .unwrap();
        assert!(outcome.success);
        assert!(!outcome.new_task_created);

        let task = outcome.task.unwrap();
        assert_eq!(task.full_command.as_deref(), Some("fix auth\nand add tests"));
        assert_eq!(db.turns_for_task(task.id).unwrap().len(), 2);
    }

    #[test]
    fn test_command_attaches_to_inferred_processing_task() {
        let (db, agent) = setup();
        let mut lifecycle = TaskLifecycle::new();

        // An inferred task: PROCESSING with no user turns.
        let inferred = db
            .create_task(agent.id, TaskState::Processing, Utc::now())
            .unwrap();

        let outcome = lifecycle
            .process_turn(&db, &agent, TurnActor::User, Some("fix auth"), None, false)
            .unwrap();
        assert!(outcome.success);
        assert!(!outcome.new_task_created);
        assert_eq!(outcome.task.unwrap().id, inferred.id);
    }

    #[test]
    fn test_agent_turn_without_task_fails_without_mutation() {
        let (db, agent) = setup();
        let mut lifecycle = TaskLifecycle::new();

        let outcome = lifecycle
            .process_turn(&db, &agent, TurnActor::Agent, Some("Done."), None, false)
            .unwrap();
        assert!(!outcome.success);
        assert!(db.current_task(agent.id).unwrap().is_none());
        assert_eq!(db.count_events("state_transition").unwrap(), 0);
    }

    #[test]
    fn test_update_task_state_rejects_invalid() {
        let (db, agent) = setup();
        let mut lifecycle = TaskLifecycle::new();
        let task = db.create_task(agent.id, TaskState::Idle, Utc::now()).unwrap();

        let err = lifecycle
            .update_task_state(&db, &agent, &task, TaskState::AwaitingInput, "agent:question", 1.0)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
        // No mutation on rejection.
        assert_eq!(db.get_task(task.id).unwrap().unwrap().state, TaskState::Idle);
    }

    #[test]
    fn test_complete_task_forces_through_unusual_states() {
        let (db, agent) = setup();
        let mut lifecycle = TaskLifecycle::new();
        let task = db
            .create_task(agent.id, TaskState::Commanded, Utc::now())
            .unwrap();
        // COMMANDED + completion is in-table; IDLE + completion is not,
        // yet the forced path must still close it.
        let idle_task = db.create_task(agent.id, TaskState::Idle, Utc::now()).unwrap();

        lifecycle
            .complete_task(&db, &agent, &task, "hook:session_end", None, TurnIntent::Completion)
            .unwrap();
        lifecycle
            .complete_task(&db, &agent, &idle_task, "reaper:orphaned_task", None, TurnIntent::Completion)
            .unwrap();

        assert_eq!(db.get_task(task.id).unwrap().unwrap().state, TaskState::Complete);
        assert_eq!(db.get_task(idle_task.id).unwrap().unwrap().state, TaskState::Complete);
    }

    #[test]
    fn test_complete_task_skips_empty_completion_turn() {
        let (db, agent) = setup();
        let mut lifecycle = TaskLifecycle::new();
        let task = db
            .create_task(agent.id, TaskState::Processing, Utc::now())
            .unwrap();

        let turn = lifecycle
            .complete_task(&db, &agent, &task, "hook:stop", Some("   "), TurnIntent::Completion)
            .unwrap();
        assert!(turn.is_none());
        assert!(db.turns_for_task(task.id).unwrap().is_empty());
    }

    #[test]
    fn test_every_transition_writes_exactly_one_event() {
        let (db, agent) = setup();
        let mut lifecycle = TaskLifecycle::new();
        lifecycle
            .process_turn(&db, &agent, TurnActor::User, Some("go"), None, false)
            .unwrap();
        lifecycle
            .process_turn(&db, &agent, TurnActor::Agent, Some("working"), None, false)
            .unwrap();
        lifecycle
            .process_turn(&db, &agent, TurnActor::Agent, Some("Done."), None, false)
            .unwrap();

        // IDLE→COMMANDED, COMMANDED→PROCESSING, PROCESSING→COMPLETE.
        assert_eq!(db.count_events("state_transition").unwrap(), 3);

        let events = db.events_for_agent(agent.id).unwrap();
        for event in events {
            let payload = event.payload.unwrap();
            assert!(payload.get("from_state").is_some());
            assert!(payload.get("to_state").is_some());
            assert!(payload.get("trigger").is_some());
            assert!(payload.get("confidence").is_some());
        }
    }
}
