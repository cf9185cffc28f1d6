//! Transcript-tail watcher: the filesystem half of the reconciliation
//! loop.
//!
//! Watches the directories holding live agents' transcript files and runs
//! an incremental reconciliation when a transcript grows, so timestamp
//! corrections and missed turns land without waiting for the watchdog's
//! gap heuristic. The first observation of a transcript only records a
//! baseline offset; history before the watcher attached is the
//! full-session reconciler's job.

use crate::lifecycle::TaskLifecycle;
use crate::reconciler::{broadcast_outcome, reconcile_entries};
use crate::runtime::Core;
use crewtrace_engine::transcript::read_entries_from_offset;
use crewtrace_store::LockNamespace;
use notify::{Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct TranscriptWatcher {
    core: Arc<Core>,
    stop_flag: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TranscriptWatcher {
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

        *handle = Some(
            std::thread::Builder::new()
                .name("transcript-watcher".to_string())
                .spawn(move || run_watch_loop(core, stop_flag))
                .expect("spawn transcript-watcher"),
        );
        info!("transcript watcher started");
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

fn run_watch_loop(core: Arc<Core>, stop_flag: Arc<AtomicBool>) {
    let (tx_fs, rx_fs) = channel::<Event>();

    let poll = Duration::from_millis(core.config.transcript_watch.poll_interval_ms);
    let config = notify::Config::default().with_poll_interval(poll);
    let mut watcher = match PollWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx_fs.send(event);
            }
        },
        config,
    ) {
        Ok(watcher) => watcher,
        Err(err) => {
            warn!(%err, "transcript watcher could not start");
            return;
        }
    };

    let mut watched_dirs: HashSet<PathBuf> = HashSet::new();
    let mut offsets: HashMap<i64, u64> = HashMap::new();

    while !stop_flag.load(Ordering::Relaxed) {
        let transcripts = live_transcripts(&core);

        // Watch any directory a live transcript lives in.
        for path in transcripts.keys() {
            if let Some(dir) = path.parent() {
                if dir.exists() && watched_dirs.insert(dir.to_path_buf()) {
                    if let Err(err) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                        debug!(dir = %dir.display(), %err, "watch failed");
                        watched_dirs.remove(dir);
                    }
                }
            }
        }
        offsets.retain(|agent_id, _| transcripts.values().any(|id| id == agent_id));

        match rx_fs.recv_timeout(Duration::from_secs(1)) {
            Ok(event) => {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    for path in &event.paths {
                        if let Some(agent_id) = transcripts.get(path) {
                            reconcile_incremental(&core, *agent_id, path, &mut offsets);
                        }
                    }
                }
            }
            Err(_) => {
                // Periodic tick: nothing changed.
            }
        }
    }
}

fn live_transcripts(core: &Arc<Core>) -> HashMap<PathBuf, i64> {
    let db = core.db.lock().unwrap_or_else(|e| e.into_inner());
    match db.list_live_agents() {
        Ok(agents) => agents
            .into_iter()
            .filter_map(|a| {
                a.transcript_path
                    .as_deref()
                    .map(|p| (PathBuf::from(p), a.id))
            })
            .collect(),
        Err(_) => HashMap::new(),
    }
}

fn reconcile_incremental(
    core: &Arc<Core>,
    agent_id: i64,
    path: &Path,
    offsets: &mut HashMap<i64, u64>,
) {
    // First sighting: baseline only.
    let Some(&offset) = offsets.get(&agent_id) else {
        let baseline = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        offsets.insert(agent_id, baseline);
        return;
    };

    let Ok((entries, new_offset)) = read_entries_from_offset(path, offset) else {
        return;
    };
    if entries.is_empty() {
        offsets.insert(agent_id, new_offset);
        return;
    }

    let Some(_guard) = core.locks.try_lock(LockNamespace::Reconcile, agent_id) else {
        // Another pass owns this agent; leave the offset so these entries
        // are retried on the next change.
        debug!(agent_id, "incremental reconcile skipped (busy)");
        return;
    };
    offsets.insert(agent_id, new_offset);

    let mut lifecycle = TaskLifecycle::new();
    let result = {
        let db = core.db.lock().unwrap_or_else(|e| e.into_inner());
        let Ok(Some(agent)) = db.get_agent(agent_id) else {
            return;
        };
        let task = match db.current_task(agent_id) {
            Ok(Some(task)) => task,
            _ => match db.tasks_for_agent_desc(agent_id) {
                Ok(tasks) if !tasks.is_empty() => tasks[0].clone(),
                _ => return,
            },
        };

        let Ok(tx) = db.begin() else {
            return;
        };
        match reconcile_entries(core, &db, &agent, &task, &entries, &mut lifecycle) {
            Ok(outcome) => {
                if tx.commit().is_err() {
                    return;
                }
                Some((agent, outcome))
            }
            Err(err) => {
                warn!(agent_id, %err, "incremental reconcile failed");
                None
            }
        }
    };

    if let Some((agent, outcome)) = result {
        if !outcome.is_empty() {
            core.enqueue_post_commit(agent_id, &mut lifecycle);
            broadcast_outcome(core, &agent, &outcome);
            core.card_refresh(agent_id, "transcript_watch");
            debug!(
                agent_id,
                created = outcome.created.len(),
                updated = outcome.updated.len(),
                "incremental reconcile applied"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::runtime::Runtime;
    use chrono::Utc;
    use crewtrace_store::NewAgent;
    use crewtrace_types::TaskState;
    use std::io::Write;
    use uuid::Uuid;

    #[test]
    fn test_incremental_reconcile_from_baseline() {
        let runtime = Runtime::builder(Config::default()).build().unwrap();
        let core = Arc::clone(runtime.core());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"type": "assistant", "role": "assistant", "content": "history before the watcher attached"}}"#
        )
        .unwrap();
        file.flush().unwrap();

        let agent_id = {
            let db = core.db.lock().unwrap();
            let project = db.create_project("p", "/p").unwrap();
            let agent = db
                .create_agent(&NewAgent {
                    session_uuid: Uuid::new_v4(),
                    external_session_id: None,
                    project_id: project.id,
                    pane_id: None,
                    transcript_path: Some(file.path().to_string_lossy().into_owned()),
                    started_at: Utc::now(),
                    last_seen_at: Utc::now(),
                })
                .unwrap();
            db.create_task(agent.id, TaskState::Processing, Utc::now())
                .unwrap();
            agent.id
        };

        let mut offsets = HashMap::new();

        // First sighting: baseline, no turns created.
        reconcile_incremental(&core, agent_id, file.path(), &mut offsets);
        {
            let db = core.db.lock().unwrap();
            let task = db.current_task(agent_id).unwrap().unwrap();
            assert!(db.turns_for_task(task.id).unwrap().is_empty());
        }

        // Appended content reconciles into a recovered turn.
        writeln!(
            file,
            r#"{{"type": "assistant", "role": "assistant", "content": "Which environment should I deploy to?", "timestamp": "2026-03-01T10:00:00Z"}}"#
        )
        .unwrap();
        file.flush().unwrap();

        reconcile_incremental(&core, agent_id, file.path(), &mut offsets);
        let db = core.db.lock().unwrap();
        let task = db.current_task(agent_id).unwrap().unwrap();
        let turns = db.turns_for_task(task.id).unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(task.state, TaskState::AwaitingInput);
    }
}
