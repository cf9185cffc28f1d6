//! Terminal watchdog: the "we saw output but no one told us" safety net.
//!
//! Polls each live agent's terminal pane, hashes the capture, and when new
//! content appears with no overlapping recent turn for longer than the gap
//! threshold, triggers a reconciliation pass. Bridges the latency gap
//! between hooks (fast, unreliable) and the transcript (authoritative,
//! seconds late).

use crate::reconciler::reconcile_full_session;
use crate::runtime::Core;
use chrono::{Duration as ChronoDuration, Utc};
use crewtrace_types::content_hash;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const TURN_MATCH_WINDOW_SECONDS: i64 = 30;
const OVERLAP_LINE_COUNT: usize = 3;
const OVERLAP_MIN_LINE_LEN: usize = 20;

pub struct TerminalWatchdog {
    core: Arc<Core>,
    stop_flag: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TerminalWatchdog {
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
        let poll_interval = Duration::from_secs(core.config.watchdog.poll_interval_seconds);

        *handle = Some(
            std::thread::Builder::new()
                .name("terminal-watchdog".to_string())
                .spawn(move || {
                    let mut last_hashes: HashMap<i64, String> = HashMap::new();
                    let mut gap_started: HashMap<i64, Instant> = HashMap::new();
                    while !stop_flag.load(Ordering::Relaxed) {
                        watchdog_pass(&core, &mut last_hashes, &mut gap_started);
                        sleep_interruptible(&stop_flag, poll_interval);
                    }
                })
                .expect("spawn terminal-watchdog"),
        );
        info!(
            interval = self.core.config.watchdog.poll_interval_seconds,
            threshold = self.core.config.watchdog.gap_threshold_seconds,
            "terminal watchdog started"
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

fn sleep_interruptible(stop_flag: &AtomicBool, total: Duration) {
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < total && !stop_flag.load(Ordering::Relaxed) {
        std::thread::sleep(step);
        waited += step;
    }
}

fn watchdog_pass(
    core: &Arc<Core>,
    last_hashes: &mut HashMap<i64, String>,
    gap_started: &mut HashMap<i64, Instant>,
) {
    let agents: Vec<(i64, String)> = {
        let db = core.db.lock().unwrap_or_else(|e| e.into_inner());
        match db.list_live_agents() {
            Ok(agents) => agents
                .into_iter()
                .filter_map(|a| a.pane_id.clone().map(|pane| (a.id, pane)))
                .collect(),
            Err(_) => return,
        }
    };

    // Forget agents that disappeared.
    last_hashes.retain(|agent_id, _| agents.iter().any(|(id, _)| id == agent_id));
    gap_started.retain(|agent_id, _| agents.iter().any(|(id, _)| id == agent_id));

    for (agent_id, pane_id) in agents {
        check_agent(core, agent_id, &pane_id, last_hashes, gap_started);
    }
}

fn check_agent(
    core: &Arc<Core>,
    agent_id: i64,
    pane_id: &str,
    last_hashes: &mut HashMap<i64, String>,
    gap_started: &mut HashMap<i64, Instant>,
) {
    let content = match core
        .terminal
        .capture_pane(pane_id, core.config.watchdog.capture_lines)
    {
        Ok(content) => content,
        Err(reason) => {
            debug!(agent_id, pane_id, %reason, "pane capture failed; skipping");
            return;
        }
    };
    if content.trim().is_empty() {
        return;
    }

    let pane_hash = content_hash("pane", &content);
    let unchanged = last_hashes.get(&agent_id) == Some(&pane_hash);
    last_hashes.insert(agent_id, pane_hash);
    if unchanged {
        return;
    }

    if recent_turn_overlaps(core, agent_id, &content) {
        gap_started.remove(&agent_id);
        return;
    }

    let started = *gap_started.entry(agent_id).or_insert_with(Instant::now);
    let gap = started.elapsed();
    if gap < Duration::from_secs(core.config.watchdog.gap_threshold_seconds) {
        return;
    }
    gap_started.remove(&agent_id);

    info!(
        agent_id,
        pane_id,
        gap_seconds = gap.as_secs(),
        "unaccounted pane output; triggering reconciliation"
    );
    reconcile_full_session(core, agent_id);
}

/// Does any recent agent-authored turn contain one of the last few
/// substantial pane lines? Presence of one long line is enough.
fn recent_turn_overlaps(core: &Arc<Core>, agent_id: i64, pane_content: &str) -> bool {
    let lines: Vec<&str> = pane_content
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return false;
    }
    let check_lines: Vec<&str> = lines
        .iter()
        .rev()
        .take(OVERLAP_LINE_COUNT)
        .filter(|l| l.len() > OVERLAP_MIN_LINE_LEN)
        .copied()
        .collect();
    if check_lines.is_empty() {
        return false;
    }

    let cutoff = Utc::now() - ChronoDuration::seconds(TURN_MATCH_WINDOW_SECONDS);
    let db = core.db.lock().unwrap_or_else(|e| e.into_inner());
    let Ok(turns) = db.recent_agent_turns(agent_id, cutoff) else {
        return false;
    };
    turns
        .iter()
        .any(|turn| check_lines.iter().any(|line| turn.text.contains(line)))
}
