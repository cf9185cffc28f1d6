//! Post-commit summarization executor.
//!
//! Drains queued `SummarisationRequest`s on a dedicated worker thread,
//! writing summaries back into the timeline, and delivers the
//! notifications that depend on them. Inference failures are logged and
//! ignored; they must never poison the timeline. Completion notifications
//! are sent from here, after the completion summary exists, so their
//! text is the AI summary rather than raw transcript bytes.

use crate::collaborators::{notify_quietly, InferenceClient, Notifier};
use crate::lifecycle::{NotificationRequest, SummarisationRequest};
use chrono::Utc;
use crewtrace_store::Database;
use crewtrace_types::{Task, TurnActor, TurnIntent};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// One commit's worth of deferred work.
pub struct SummaryJob {
    pub agent_id: i64,
    pub summaries: Vec<SummarisationRequest>,
    pub notifications: Vec<NotificationRequest>,
}

pub struct SummaryWorker {
    tx: Mutex<Option<Sender<SummaryJob>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SummaryWorker {
    pub fn start(
        db: Arc<Mutex<Database>>,
        inference: Option<Arc<dyn InferenceClient>>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (tx, rx) = channel::<SummaryJob>();
        let handle = std::thread::Builder::new()
            .name("summary-worker".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    execute_job(&db, inference.as_deref(), notifier.as_ref(), job);
                }
            })
            .expect("spawn summary-worker");

        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Hand off a job. Dropped silently when the worker is stopping;
    /// post-commit work is best-effort by contract.
    pub fn enqueue(&self, job: SummaryJob) {
        if job.summaries.is_empty() && job.notifications.is_empty() {
            return;
        }
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match tx.as_ref() {
            Some(tx) if tx.send(job).is_ok() => {}
            _ => warn!("summary worker gone; dropping post-commit job"),
        }
    }

    /// Drain and join with a bounded wait (the channel closes, the worker
    /// finishes its backlog, then exits).
    pub fn stop(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for SummaryWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn execute_job(
    db: &Arc<Mutex<Database>>,
    inference: Option<&dyn InferenceClient>,
    notifier: &dyn Notifier,
    job: SummaryJob,
) {
    let mut completed_tasks: Vec<i64> = Vec::new();

    for request in &job.summaries {
        let result = apply_summarisation(db, inference, request);
        if let Err(reason) = result {
            warn!(agent_id = job.agent_id, %reason, "summarisation failed (non-fatal)");
        }
        if let SummarisationRequest::TaskCompletion { task_id } = request {
            completed_tasks.push(*task_id);
        }
    }

    for notification in &job.notifications {
        match notification {
            NotificationRequest::AwaitingInput {
                agent_id,
                task_id,
                question_text,
            } => {
                send_awaiting_input(db, notifier, *agent_id, *task_id, question_text.as_deref());
            }
        }
    }

    // Deferred completion notifications: summaries above have landed.
    for task_id in completed_tasks {
        send_task_complete(db, notifier, job.agent_id, task_id);
    }
}

fn apply_summarisation(
    db: &Arc<Mutex<Database>>,
    inference: Option<&dyn InferenceClient>,
    request: &SummarisationRequest,
) -> Result<(), String> {
    let Some(client) = inference else {
        debug!(?request, "no inference client; summarisation skipped");
        return Ok(());
    };

    match request {
        SummarisationRequest::Turn { turn_id } => {
            let text = {
                let db = db.lock().unwrap_or_else(|e| e.into_inner());
                db.get_turn(*turn_id)
                    .map_err(|e| e.to_string())?
                    .map(|t| t.text)
            };
            let Some(text) = text else {
                return Err(format!("turn {} vanished", turn_id));
            };
            if text.trim().is_empty() {
                return Ok(());
            }
            let summary = client.summarize("turn", &text)?;
            let db = db.lock().unwrap_or_else(|e| e.into_inner());
            db.set_turn_summary(*turn_id, &summary, Utc::now())
                .map_err(|e| e.to_string())
        }
        SummarisationRequest::Instruction {
            task_id,
            command_text,
        } => {
            let summary = client.summarize("instruction", command_text)?;
            let db = db.lock().unwrap_or_else(|e| e.into_inner());
            db.set_task_instruction(*task_id, &summary, Utc::now())
                .map_err(|e| e.to_string())
        }
        SummarisationRequest::TaskCompletion { task_id } => {
            let output = {
                let db = db.lock().unwrap_or_else(|e| e.into_inner());
                db.get_task(*task_id)
                    .map_err(|e| e.to_string())?
                    .and_then(|t| t.full_output)
            };
            let Some(output) = output else {
                return Ok(());
            };
            if output.trim().is_empty() {
                return Ok(());
            }
            let summary = client.summarize("task_completion", &output)?;
            let db = db.lock().unwrap_or_else(|e| e.into_inner());
            db.set_task_completion_summary(*task_id, &summary, Utc::now())
                .map_err(|e| e.to_string())
        }
    }
}

/// Instruction text for notification bodies: the AI summary, or the first
/// raw user command truncated.
pub fn instruction_for_notification(db: &Database, task: &Task) -> Option<String> {
    if let Some(instruction) = &task.instruction {
        return Some(instruction.clone());
    }
    let turns = db.turns_for_task(task.id).ok()?;
    for turn in &turns {
        if turn.actor == TurnActor::User && turn.intent == TurnIntent::Command {
            let text = turn.text.trim();
            if !text.is_empty() {
                if text.chars().count() > 120 {
                    let head: String = text.chars().take(117).collect();
                    return Some(format!("{}...", head));
                }
                return Some(text.to_string());
            }
        }
    }
    None
}

fn agent_label(db: &Database, agent_id: i64) -> (String, Option<String>) {
    let Ok(Some(agent)) = db.get_agent(agent_id) else {
        return (format!("Agent {}", agent_id), None);
    };
    let project = db
        .get_project(agent.project_id)
        .ok()
        .flatten()
        .map(|p| p.name);
    (agent.short_name(), project)
}

fn send_awaiting_input(
    db: &Arc<Mutex<Database>>,
    notifier: &dyn Notifier,
    agent_id: i64,
    task_id: i64,
    question_text: Option<&str>,
) {
    let (title, subtitle, body) = {
        let db = db.lock().unwrap_or_else(|e| e.into_inner());
        let (name, project) = agent_label(&db, agent_id);
        let body = question_text
            .map(|t| t.to_string())
            .or_else(|| {
                db.get_task(task_id)
                    .ok()
                    .flatten()
                    .and_then(|t| instruction_for_notification(&db, &t))
            })
            .unwrap_or_else(|| "Agent is waiting for input".to_string());
        (format!("{} needs input", name), project, body)
    };
    notify_quietly(notifier, &title, subtitle.as_deref(), &body);
}

fn send_task_complete(
    db: &Arc<Mutex<Database>>,
    notifier: &dyn Notifier,
    agent_id: i64,
    task_id: i64,
) {
    let (title, subtitle, body) = {
        let db = db.lock().unwrap_or_else(|e| e.into_inner());
        let (name, project) = agent_label(&db, agent_id);
        let task = db.get_task(task_id).ok().flatten();
        let body = task
            .as_ref()
            .and_then(|t| t.completion_summary.clone())
            .or_else(|| {
                task.as_ref()
                    .and_then(|t| instruction_for_notification(&db, t))
            })
            .unwrap_or_else(|| "Task complete".to_string());
        (format!("{} finished a task", name), project, body)
    };
    notify_quietly(notifier, &title, subtitle.as_deref(), &body);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewtrace_store::{NewAgent, NewTurn};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct CountingNotifier(AtomicUsize);
    impl Notifier for CountingNotifier {
        fn notify(&self, _title: &str, _subtitle: Option<&str>, _body: &str, _url: Option<&str>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct EchoClient;
    impl InferenceClient for EchoClient {
        fn summarize(&self, kind: &str, text: &str) -> Result<String, String> {
            let head: String = text.chars().take(20).collect();
            Ok(format!("[{}] {}", kind, head))
        }
    }

    fn setup() -> (Arc<Mutex<Database>>, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("p", "/p").unwrap();
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
            .create_task(agent.id, crewtrace_types::TaskState::Processing, Utc::now())
            .unwrap();
        (Arc::new(Mutex::new(db)), agent.id, task.id)
    }

    #[test]
    fn test_turn_summary_written_back() {
        let (db, agent_id, task_id) = setup();
        let turn = {
            let db_guard = db.lock().unwrap();
            db_guard
                .create_turn(&NewTurn::basic(
                    task_id,
                    TurnActor::Agent,
                    TurnIntent::Progress,
                    "long running progress output",
                ))
                .unwrap()
        };

        let notifier = Arc::new(CountingNotifier(AtomicUsize::new(0)));
        let worker = SummaryWorker::start(
            Arc::clone(&db),
            Some(Arc::new(EchoClient)),
            notifier,
        );
        worker.enqueue(SummaryJob {
            agent_id,
            summaries: vec![SummarisationRequest::Turn { turn_id: turn.id }],
            notifications: vec![],
        });
        worker.stop();

        let db_guard = db.lock().unwrap();
        let reloaded = db_guard.get_turn(turn.id).unwrap().unwrap();
        assert!(reloaded.summary.unwrap().starts_with("[turn]"));
        assert!(reloaded.summary_generated_at.is_some());
    }

    #[test]
    fn test_completion_notification_follows_summary() {
        let (db, agent_id, task_id) = setup();
        {
            let db_guard = db.lock().unwrap();
            db_guard
                .set_task_full_output(task_id, "refactored the auth module end to end")
                .unwrap();
        }

        let notifier = Arc::new(CountingNotifier(AtomicUsize::new(0)));
        let worker = SummaryWorker::start(
            Arc::clone(&db),
            Some(Arc::new(EchoClient)),
            Arc::clone(&notifier) as Arc<dyn Notifier>,
        );
        worker.enqueue(SummaryJob {
            agent_id,
            summaries: vec![SummarisationRequest::TaskCompletion { task_id }],
            notifications: vec![],
        });
        worker.stop();

        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
        let db_guard = db.lock().unwrap();
        let task = db_guard.get_task(task_id).unwrap().unwrap();
        assert!(task.completion_summary.unwrap().starts_with("[task_completion]"));
    }

    #[test]
    fn test_no_client_is_a_quiet_no_op_for_summaries() {
        let (db, agent_id, task_id) = setup();
        let notifier = Arc::new(CountingNotifier(AtomicUsize::new(0)));
        let worker =
            SummaryWorker::start(Arc::clone(&db), None, Arc::clone(&notifier) as Arc<dyn Notifier>);
        worker.enqueue(SummaryJob {
            agent_id,
            summaries: vec![SummarisationRequest::TaskCompletion { task_id }],
            notifications: vec![],
        });
        worker.stop();

        // Completion notification still fires; summary stays empty.
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
        let db_guard = db.lock().unwrap();
        assert!(db_guard
            .get_task(task_id)
            .unwrap()
            .unwrap()
            .completion_summary
            .is_none());
    }

    #[test]
    fn test_awaiting_input_notification() {
        let (db, agent_id, task_id) = setup();
        let notifier = Arc::new(CountingNotifier(AtomicUsize::new(0)));
        let worker =
            SummaryWorker::start(Arc::clone(&db), None, Arc::clone(&notifier) as Arc<dyn Notifier>);
        worker.enqueue(SummaryJob {
            agent_id,
            summaries: vec![],
            notifications: vec![NotificationRequest::AwaitingInput {
                agent_id,
                task_id,
                question_text: Some("Which port?".to_string()),
            }],
        });
        worker.stop();
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_instruction_for_notification_falls_back_to_raw_command() {
        let (db, _agent_id, task_id) = setup();
        let db_guard = db.lock().unwrap();
        db_guard
            .create_turn(&NewTurn::basic(
                task_id,
                TurnActor::User,
                TurnIntent::Command,
                "fix the flaky login test",
            ))
            .unwrap();
        let task = db_guard.get_task(task_id).unwrap().unwrap();
        let text = instruction_for_notification(&db_guard, &task).unwrap();
        assert_eq!(text, "fix the flaky login test");
    }
}
