//! Agent reaper: detects dead sessions and closes out their timelines.
//!
//! Liveness, in order of authority: the process tree under the agent's
//! pane (an agent process must be running there), pane presence and
//! ownership in the multiplexer, and finally plain inactivity. Reaped
//! agents get ended_at set, every orphaned task force-completed through
//! the lifecycle's forced path, a reaper_ended audit event, and a
//! session_ended broadcast. One agent per transaction; broadcasts happen
//! post-commit.

use crate::collaborators::descendant_command_contains;
use crate::events::EventPayload;
use crate::lifecycle::TaskLifecycle;
use crate::runtime::Core;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crewtrace_engine::transcript::last_agent_response;
use crewtrace_store::{LockNamespace, NewEvent};
use crewtrace_types::{event_type, Agent, TurnIntent};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const AGENT_PROCESS_NEEDLE: &str = "claude";
const REAP_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_TAIL_LEN: usize = 10_000;

#[derive(Debug, Clone)]
pub struct ReapDetail {
    pub agent_id: i64,
    pub session_uuid: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ReapResult {
    pub checked: usize,
    pub reaped: usize,
    pub skipped_grace: usize,
    pub skipped_alive: usize,
    pub skipped_error: usize,
    pub details: Vec<ReapDetail>,
}

pub struct AgentReaper {
    core: Arc<Core>,
    stop_flag: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AgentReaper {
    pub fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            stop_flag: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            return;
        }
        self.stop_flag.store(false, Ordering::Relaxed);

        let core = Arc::clone(&self.core);
        let stop_flag = Arc::clone(&self.stop_flag);
        let interval = Duration::from_secs(core.config.reaper.interval_seconds);

        *handle = Some(
            std::thread::Builder::new()
                .name("agent-reaper".to_string())
                .spawn(move || {
                    while !stop_flag.load(Ordering::Relaxed) {
                        let result = reap_once(&core);
                        if result.reaped > 0 {
                            info!(
                                checked = result.checked,
                                reaped = result.reaped,
                                reasons = ?result.details.iter().map(|d| d.reason.as_str()).collect::<Vec<_>>(),
                                "reaper pass"
                            );
                        } else {
                            debug!(checked = result.checked, "reaper pass: nothing to reap");
                        }
                        let step = Duration::from_millis(200);
                        let mut waited = Duration::ZERO;
                        while waited < interval && !stop_flag.load(Ordering::Relaxed) {
                            std::thread::sleep(step);
                            waited += step;
                        }
                    }
                })
                .expect("spawn agent-reaper"),
        );
        info!(
            interval = self.core.config.reaper.interval_seconds,
            inactivity = self.core.config.reaper.inactivity_timeout_seconds,
            grace = self.core.config.reaper.grace_period_seconds,
            "agent reaper started"
        );
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
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

/// One reaper pass over every live agent. Public so a host (or test) can
/// sweep on demand.
pub fn reap_once(core: &Arc<Core>) -> ReapResult {
    let mut result = ReapResult::default();
    let now = Utc::now();
    let grace_cutoff = now - ChronoDuration::seconds(core.config.reaper.grace_period_seconds as i64);
    let inactivity_cutoff =
        now - ChronoDuration::seconds(core.config.reaper.inactivity_timeout_seconds as i64);

    let agents = {
        let db = core.db.lock().unwrap_or_else(|e| e.into_inner());
        match db.list_live_agents() {
            Ok(agents) => agents,
            Err(err) => {
                warn!(%err, "reaper: could not list agents");
                return result;
            }
        }
    };

    // Pane ownership: the newest agent on a pane id owns it; older rows
    // sharing it are stale.
    let mut pane_owners: HashMap<String, i64> = HashMap::new();
    for agent in &agents {
        if let Some(pane) = &agent.pane_id {
            let owner = pane_owners.entry(pane.clone()).or_insert(agent.id);
            if agent.id > *owner {
                *owner = agent.id;
            }
        }
    }

    // Snapshot the multiplexer and process table once per pass.
    let panes = core.terminal.list_panes();
    let processes = core.probe.processes();

    for agent in agents {
        result.checked += 1;

        if agent.started_at > grace_cutoff {
            result.skipped_grace += 1;
            continue;
        }

        let mut reason: Option<&str> = None;

        if let Some(pane_id) = &agent.pane_id {
            match &panes {
                Ok(pane_list) => {
                    match pane_list.iter().find(|p| &p.pane_id == pane_id) {
                        Some(pane) => {
                            if pane_owners.get(pane_id) != Some(&agent.id) {
                                reason = Some("stale_pane");
                            } else {
                                match &processes {
                                    Ok(table) => {
                                        if descendant_command_contains(
                                            table,
                                            pane.root_pid,
                                            AGENT_PROCESS_NEEDLE,
                                        ) {
                                            result.skipped_alive += 1;
                                            continue;
                                        }
                                        reason = Some("claude_exited");
                                    }
                                    Err(err) => {
                                        debug!(agent_id = agent.id, %err, "process probe failed");
                                        result.skipped_error += 1;
                                        continue;
                                    }
                                }
                            }
                        }
                        None => reason = Some("pane_not_found"),
                    }
                }
                Err(_) => {
                    // Multiplexer unreachable: fall through to inactivity.
                }
            }
        }

        if reason.is_none() {
            if agent.last_seen_at < inactivity_cutoff {
                reason = Some("inactivity_timeout");
            } else {
                result.skipped_alive += 1;
                continue;
            }
        }

        let reason = reason.unwrap_or("inactivity_timeout");
        match reap_agent(core, &agent, reason, now) {
            Ok(()) => {
                result.reaped += 1;
                result.details.push(ReapDetail {
                    agent_id: agent.id,
                    session_uuid: agent.session_uuid.to_string(),
                    reason: reason.to_string(),
                });
            }
            Err(err) => {
                warn!(agent_id = agent.id, %err, "reap failed");
                result.skipped_error += 1;
            }
        }
    }

    result
}

fn reap_agent(
    core: &Arc<Core>,
    agent: &Agent,
    reason: &str,
    now: DateTime<Utc>,
) -> crate::error::Result<()> {
    let _guard = core
        .locks
        .lock(LockNamespace::Agent, agent.id, REAP_LOCK_TIMEOUT)?;
    let mut lifecycle = TaskLifecycle::new();
    let trigger = format!("reaper:{}", reason);
    {
        let db = core.db.lock().unwrap_or_else(|e| e.into_inner());
        let tx = db.begin()?;
        db.set_agent_ended(agent.id, now)?;

        let orphaned = db.open_tasks_for_agent(agent.id)?;
        if !orphaned.is_empty() {
            info!(
                agent_id = agent.id,
                count = orphaned.len(),
                "reaper completing orphaned tasks"
            );

            // Read the transcript tail once; the most recent task gets it
            // as completion text, older ones close empty.
            let tail = agent
                .transcript_path
                .as_deref()
                .and_then(|p| last_agent_response(Path::new(p), MAX_TAIL_LEN).ok())
                .flatten();
            let intent = tail
                .as_deref()
                .map(|text| crewtrace_engine::intent::detect_agent_intent(Some(text)))
                .filter(|r| r.intent.is_completing())
                .map(|r| r.intent)
                .unwrap_or(TurnIntent::Completion);

            for (index, task) in orphaned.iter().enumerate() {
                let text = if index == 0 { tail.as_deref() } else { None };
                lifecycle.complete_task(&db, agent, task, &trigger, text, intent)?;
            }
        }

        db.record_event(&NewEvent {
            timestamp: now,
            project_id: Some(agent.project_id),
            agent_id: Some(agent.id),
            task_id: None,
            turn_id: None,
            event_type: event_type::REAPER_ENDED.to_string(),
            payload: Some(serde_json::json!({
                "session_uuid": agent.session_uuid.to_string(),
                "reason": reason,
            })),
        })?;
        tx.commit()?;
    }
    core.hook_state.on_session_end(agent.id);

    info!(agent_id = agent.id, reason, "reaped agent");
    core.enqueue_post_commit(agent.id, &mut lifecycle);
    core.broadcaster.broadcast(EventPayload::SessionEnded {
        agent_id: agent.id,
        project_id: agent.project_id,
        session_uuid: agent.session_uuid.to_string(),
        reason: Some(trigger),
    });
    core.card_refresh(agent.id, &format!("reaper_{}", reason));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::runtime::Runtime;
    use crewtrace_store::NewAgent;
    use crewtrace_testing::{MockProcessProbe, MockTerminalSink};
    use crewtrace_types::TaskState;
    use uuid::Uuid;

    fn runtime_with_mocks(
        sink: Arc<MockTerminalSink>,
        probe: Arc<MockProcessProbe>,
    ) -> Runtime {
        let mut config = Config::default();
        config.reaper.grace_period_seconds = 0;
        Runtime::builder(config)
            .terminal(sink)
            .probe(probe)
            .build()
            .unwrap()
    }

    fn seed_agent(
        core: &Arc<Core>,
        pane: Option<&str>,
        last_seen_minutes_ago: i64,
    ) -> (i64, i64) {
        let db = core.db.lock().unwrap();
        let project = db.create_project("p", "/p").unwrap();
        let agent = db
            .create_agent(&NewAgent {
                session_uuid: Uuid::new_v4(),
                external_session_id: None,
                project_id: project.id,
                pane_id: pane.map(|p| p.to_string()),
                transcript_path: None,
                started_at: Utc::now() - ChronoDuration::hours(1),
                last_seen_at: Utc::now() - ChronoDuration::minutes(last_seen_minutes_ago),
            })
            .unwrap();
        let task = db
            .create_task(agent.id, TaskState::Processing, Utc::now())
            .unwrap();
        (agent.id, task.id)
    }

    #[test]
    fn test_inactive_agent_without_pane_is_reaped() {
        let sink = Arc::new(MockTerminalSink::new());
        let probe = Arc::new(MockProcessProbe::new());
        let runtime = runtime_with_mocks(Arc::clone(&sink), probe);
        let core = Arc::clone(runtime.core());
        let (agent_id, task_id) = seed_agent(&core, None, 10);

        let result = reap_once(&core);
        assert_eq!(result.reaped, 1);
        assert_eq!(result.details[0].reason, "inactivity_timeout");

        let db = core.db.lock().unwrap();
        let agent = db.get_agent(agent_id).unwrap().unwrap();
        assert!(agent.ended_at.is_some());
        let task = db.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Complete);
        assert_eq!(db.count_events("reaper_ended").unwrap(), 1);
    }

    #[test]
    fn test_recently_seen_agent_survives() {
        let sink = Arc::new(MockTerminalSink::new());
        let probe = Arc::new(MockProcessProbe::new());
        let runtime = runtime_with_mocks(Arc::clone(&sink), probe);
        let core = Arc::clone(runtime.core());
        let (agent_id, _) = seed_agent(&core, None, 0);

        let result = reap_once(&core);
        assert_eq!(result.reaped, 0);
        assert_eq!(result.skipped_alive, 1);

        let db = core.db.lock().unwrap();
        assert!(db.get_agent(agent_id).unwrap().unwrap().ended_at.is_none());
    }

    #[test]
    fn test_pane_with_live_agent_process_survives() {
        let sink = Arc::new(MockTerminalSink::new());
        sink.add_pane("%1", 100);
        let probe = Arc::new(MockProcessProbe::new());
        probe.add_process(200, 100, "claude");
        let runtime = runtime_with_mocks(Arc::clone(&sink), probe);
        let core = Arc::clone(runtime.core());
        // Old last_seen, but the process tree says alive.
        seed_agent(&core, Some("%1"), 60);

        let result = reap_once(&core);
        assert_eq!(result.reaped, 0);
        assert_eq!(result.skipped_alive, 1);
    }

    #[test]
    fn test_pane_whose_agent_exited_is_reaped() {
        let sink = Arc::new(MockTerminalSink::new());
        sink.add_pane("%1", 100);
        let probe = Arc::new(MockProcessProbe::new());
        probe.add_process(200, 100, "bash");
        let runtime = runtime_with_mocks(Arc::clone(&sink), probe);
        let core = Arc::clone(runtime.core());
        seed_agent(&core, Some("%1"), 60);

        let result = reap_once(&core);
        assert_eq!(result.reaped, 1);
        assert_eq!(result.details[0].reason, "claude_exited");
    }

    #[test]
    fn test_missing_pane_is_reaped() {
        let sink = Arc::new(MockTerminalSink::new());
        let probe = Arc::new(MockProcessProbe::new());
        let runtime = runtime_with_mocks(Arc::clone(&sink), probe);
        let core = Arc::clone(runtime.core());
        seed_agent(&core, Some("%gone"), 1);

        let result = reap_once(&core);
        assert_eq!(result.reaped, 1);
        assert_eq!(result.details[0].reason, "pane_not_found");
    }

    #[test]
    fn test_stale_pane_owner_loses_to_newer_agent() {
        let sink = Arc::new(MockTerminalSink::new());
        sink.add_pane("%1", 100);
        let probe = Arc::new(MockProcessProbe::new());
        probe.add_process(200, 100, "claude");
        let runtime = runtime_with_mocks(Arc::clone(&sink), probe);
        let core = Arc::clone(runtime.core());
        let (old_agent, _) = seed_agent(&core, Some("%1"), 60);
        {
            // A newer agent claims the same pane.
            let db = core.db.lock().unwrap();
            let project = db.create_project("q", "/q").unwrap();
            db.create_agent(&NewAgent {
                session_uuid: Uuid::new_v4(),
                external_session_id: None,
                project_id: project.id,
                pane_id: Some("%1".to_string()),
                transcript_path: None,
                started_at: Utc::now() - ChronoDuration::hours(1),
                last_seen_at: Utc::now(),
            })
            .unwrap();
        }

        let result = reap_once(&core);
        assert_eq!(result.reaped, 1);
        assert_eq!(result.details[0].agent_id, old_agent);
        assert_eq!(result.details[0].reason, "stale_pane");
    }

    #[test]
    fn test_grace_period_protects_new_agents() {
        let sink = Arc::new(MockTerminalSink::new());
        let probe = Arc::new(MockProcessProbe::new());
        let mut config = Config::default();
        config.reaper.grace_period_seconds = 24 * 3600;
        let runtime = Runtime::builder(config)
            .terminal(sink)
            .probe(probe)
            .build()
            .unwrap();
        let core = Arc::clone(runtime.core());
        seed_agent(&core, None, 60);

        let result = reap_once(&core);
        assert_eq!(result.reaped, 0);
        assert_eq!(result.skipped_grace, 1);
    }
}
