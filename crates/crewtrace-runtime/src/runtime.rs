//! Top-level wiring: constructs the store, lock manager, hook state,
//! correlator, broadcaster, and summary worker, starts the background
//! daemons, and exposes the library surface a host consumes.
//!
//! All singletons are explicit first-class components owned here and
//! passed by reference; no module-level globals.

use crate::broadcaster::{Broadcaster, SubscribeFilters, Subscription};
use crate::collaborators::{
    InferenceClient, LogNotifier, Notifier, ProcessProbe, PsProcessProbe, TerminalSink, TmuxSink,
};
use crate::config::Config;
use crate::correlator::SessionCorrelator;
use crate::error::{Error, Result};
use crate::hook_state::AgentHookState;
use crate::hooks::{HookEvent, HookIngestor, HookOutcome, RespondOutcome};
use crate::lifecycle::TaskLifecycle;
use crate::projector;
use crate::reaper::AgentReaper;
use crate::summarize::{SummaryJob, SummaryWorker};
use crate::transcript_watch::TranscriptWatcher;
use crate::watchdog::TerminalWatchdog;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crewtrace_engine::CardState;
use crewtrace_store::{Database, HeldLock, LockManager, NewAgent};
use crewtrace_types::{Agent, FileMeta, Turn};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const MAX_TRANSCRIPT_PAGE: usize = 200;

/// Hook receiver statistics (debug surface).
#[derive(Debug, Clone, Default)]
pub struct HookStats {
    pub events_received: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_event_type: Option<String>,
}

/// Shared handles threaded through every component.
pub struct Core {
    pub config: Config,
    pub db: Arc<Mutex<Database>>,
    pub locks: Arc<LockManager>,
    pub hook_state: Arc<AgentHookState>,
    pub correlator: Arc<SessionCorrelator>,
    pub broadcaster: Arc<Broadcaster>,
    pub summaries: Arc<SummaryWorker>,
    pub terminal: Arc<dyn TerminalSink>,
    pub probe: Arc<dyn ProcessProbe>,
    pub notifier: Arc<dyn Notifier>,
    hook_stats: Mutex<HookStats>,
}

impl Core {
    pub fn record_hook(&self, event_type: &str) {
        let mut stats = self.hook_stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.events_received += 1;
        stats.last_event_at = Some(Utc::now());
        stats.last_event_type = Some(event_type.to_string());
    }

    pub fn hook_stats(&self) -> HookStats {
        self.hook_stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Queue one commit's deferred work onto the summary worker.
    pub fn enqueue_post_commit(&self, agent_id: i64, lifecycle: &mut TaskLifecycle) {
        let (summaries, notifications) = lifecycle.take_pending();
        self.summaries.enqueue(SummaryJob {
            agent_id,
            summaries,
            notifications,
        });
    }

    /// Post-commit card_refresh broadcast. Takes the store lock briefly;
    /// never call while holding it.
    pub fn card_refresh(&self, agent_id: i64, reason: &str) {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        projector::broadcast_card_refresh(&db, &self.broadcaster, agent_id, reason, &self.config);
    }
}

/// Builder over the collaborator seams. Defaults to the tmux/ps/log
/// implementations with no inference client.
pub struct RuntimeBuilder {
    config: Config,
    db_path: Option<std::path::PathBuf>,
    terminal: Arc<dyn TerminalSink>,
    probe: Arc<dyn ProcessProbe>,
    notifier: Arc<dyn Notifier>,
    inference: Option<Arc<dyn InferenceClient>>,
}

impl RuntimeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            db_path: None,
            terminal: Arc::new(TmuxSink),
            probe: Arc::new(PsProcessProbe),
            notifier: Arc::new(LogNotifier),
            inference: None,
        }
    }

    pub fn db_path(mut self, path: &Path) -> Self {
        self.db_path = Some(path.to_path_buf());
        self
    }

    pub fn terminal(mut self, terminal: Arc<dyn TerminalSink>) -> Self {
        self.terminal = terminal;
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn inference(mut self, inference: Arc<dyn InferenceClient>) -> Self {
        self.inference = Some(inference);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let db = match &self.db_path {
            Some(path) => Database::open(path)?,
            None => Database::open_in_memory()?,
        };
        let db = Arc::new(Mutex::new(db));
        let broadcaster = Arc::new(Broadcaster::new(&self.config.broadcaster));
        let summaries = Arc::new(SummaryWorker::start(
            Arc::clone(&db),
            self.inference.clone(),
            Arc::clone(&self.notifier),
        ));

        let core = Arc::new(Core {
            correlator: Arc::new(SessionCorrelator::new(Duration::from_secs(
                self.config.correlator_cache_ttl_seconds,
            ))),
            locks: Arc::new(LockManager::new()),
            hook_state: Arc::new(AgentHookState::new()),
            broadcaster,
            summaries,
            terminal: self.terminal,
            probe: self.probe,
            notifier: self.notifier,
            hook_stats: Mutex::new(HookStats::default()),
            db,
            config: self.config,
        });

        Ok(Runtime {
            ingestor: HookIngestor::new(Arc::clone(&core)),
            reaper: AgentReaper::new(Arc::clone(&core)),
            watchdog: TerminalWatchdog::new(Arc::clone(&core)),
            transcript_watcher: TranscriptWatcher::new(Arc::clone(&core)),
            core,
        })
    }
}

/// The assembled system. Construct with [`RuntimeBuilder`], `start()` the
/// daemons, ingest hooks, `stop()` on shutdown.
pub struct Runtime {
    core: Arc<Core>,
    ingestor: HookIngestor,
    reaper: AgentReaper,
    watchdog: TerminalWatchdog,
    transcript_watcher: TranscriptWatcher,
}

impl Runtime {
    pub fn builder(config: Config) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Start the background daemons. Idempotent.
    pub fn start(&self) {
        self.core.broadcaster.start_sweeper();
        if self.core.config.reaper.enabled {
            self.reaper.start();
        }
        if self.core.config.watchdog.enabled {
            self.watchdog.start();
        }
        if self.core.config.transcript_watch.enabled {
            self.transcript_watcher.start();
        }
        info!("runtime started");
    }

    /// Drain background workers with a bounded join and drop subscribers.
    pub fn stop(&self) {
        self.transcript_watcher.stop();
        self.watchdog.stop();
        self.reaper.stop();
        self.core.summaries.stop();
        self.core.broadcaster.stop();
        info!("runtime stopped");
    }

    // ── Event subscribe ──────────────────────────────────────────────

    pub fn subscribe(&self, filters: SubscribeFilters) -> Option<Subscription> {
        self.core.broadcaster.subscribe(filters)
    }

    // ── Read projections ─────────────────────────────────────────────

    pub fn get_card(&self, agent_id: i64) -> Result<CardState> {
        let db = self.core.db.lock().unwrap_or_else(|e| e.into_inner());
        projector::load_card(&db, agent_id, &self.core.config)
    }

    pub fn get_transcript(
        &self,
        agent_id: i64,
        before_turn_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Turn>> {
        let limit = limit.min(MAX_TRANSCRIPT_PAGE);
        let db = self.core.db.lock().unwrap_or_else(|e| e.into_inner());
        if db.get_agent(agent_id)?.is_none() {
            return Err(Error::NotFound(format!("agent {}", agent_id)));
        }
        Ok(db.turn_page_for_agent(agent_id, before_turn_id, limit, false)?)
    }

    pub fn list_active_agents(&self, staleness_window: Duration) -> Result<Vec<Agent>> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(staleness_window)
                .unwrap_or_else(|_| ChronoDuration::minutes(5));
        let db = self.core.db.lock().unwrap_or_else(|e| e.into_inner());
        Ok(db.list_active_agents(cutoff)?)
    }

    /// Debug probe over currently held advisory locks.
    pub fn held_locks(&self) -> Vec<HeldLock> {
        self.core.locks.held_locks()
    }

    pub fn hook_status(&self) -> HookStats {
        self.core.hook_stats()
    }

    // ── Explicit registration ────────────────────────────────────────

    /// Pre-register a session. Unlike the correlating ingest paths, this
    /// rejects an already-known session id.
    pub fn register_session(
        &self,
        external_session_id: &str,
        working_directory: Option<&str>,
        transcript_path: Option<&str>,
        pane_id: Option<&str>,
    ) -> Result<Agent> {
        if external_session_id.trim().is_empty() {
            return Err(Error::PayloadInvalid("session_id is required".to_string()));
        }
        let db = self.core.db.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = db.find_agent_by_external_session(external_session_id)? {
            if existing.is_live() {
                return Err(Error::DuplicateSession {
                    agent_id: existing.id,
                });
            }
        }

        let project = match working_directory {
            Some(cwd) => match db.get_project_by_path(cwd)? {
                Some(project) => project,
                None => {
                    let name = Path::new(cwd)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "project".to_string());
                    db.create_project(&name, cwd)?
                }
            },
            None => {
                let path = format!("__unknown__/{}", external_session_id);
                let prefix: String = external_session_id.chars().take(8).collect();
                db.create_project(&format!("unknown-{}", prefix), &path)?
            }
        };

        let now = Utc::now();
        let agent = db.create_agent(&NewAgent {
            session_uuid: Uuid::new_v4(),
            external_session_id: Some(external_session_id.to_string()),
            project_id: project.id,
            pane_id: pane_id.map(|p| p.to_string()),
            transcript_path: transcript_path.map(|p| p.to_string()),
            started_at: now,
            last_seen_at: now,
        })?;
        self.core
            .correlator
            .cache_mapping(external_session_id, agent.id);
        Ok(agent)
    }

    // ── Write-backs from external collaborators ──────────────────────

    /// Stage file metadata uploaded alongside an idle-state command; it is
    /// attached to the next hook-created user turn.
    pub fn stage_file_upload(&self, agent_id: i64, meta: FileMeta) {
        self.core.hook_state.set_file_upload_pending(agent_id, meta);
    }

    /// Write back an externally computed priority score and refresh the
    /// agent's card.
    pub fn set_agent_priority(
        &self,
        agent_id: i64,
        score: i64,
        reason: Option<&str>,
    ) -> Result<()> {
        {
            let db = self.core.db.lock().unwrap_or_else(|e| e.into_inner());
            db.set_agent_priority(agent_id, score, reason)?;
        }
        self.core.card_refresh(agent_id, "priority");
        Ok(())
    }

    /// Flip a project's paused flag, stamping when and why.
    pub fn set_project_paused(
        &self,
        project_id: i64,
        paused: bool,
        reason: Option<&str>,
    ) -> Result<()> {
        let db = self.core.db.lock().unwrap_or_else(|e| e.into_inner());
        let at = if paused { Some(Utc::now()) } else { None };
        db.set_project_paused(project_id, paused, at, reason)?;
        Ok(())
    }

    // ── Hook ingest ──────────────────────────────────────────────────

    pub fn ingest_session_start(&self, event: &HookEvent) -> Result<HookOutcome> {
        self.ingestor.session_start(event)
    }

    pub fn ingest_user_prompt_submit(&self, event: &HookEvent) -> Result<HookOutcome> {
        self.ingestor.user_prompt_submit(event)
    }

    pub fn ingest_pre_tool_use(&self, event: &HookEvent) -> Result<HookOutcome> {
        self.ingestor.pre_tool_use(event)
    }

    pub fn ingest_permission_request(&self, event: &HookEvent) -> Result<HookOutcome> {
        self.ingestor.permission_request(event)
    }

    pub fn ingest_stop(&self, event: &HookEvent) -> Result<HookOutcome> {
        self.ingestor.stop(event)
    }

    pub fn ingest_notification(&self, event: &HookEvent) -> Result<HookOutcome> {
        self.ingestor.notification(event)
    }

    pub fn ingest_session_end(&self, event: &HookEvent) -> Result<HookOutcome> {
        self.ingestor.session_end(event)
    }

    // ── Respond ingest ───────────────────────────────────────────────

    pub fn ingest_user_answer(
        &self,
        agent_id: i64,
        text: &str,
        file_meta: Option<FileMeta>,
    ) -> Result<RespondOutcome> {
        self.ingestor.user_answer(agent_id, text, file_meta)
    }
}
