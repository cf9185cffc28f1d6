use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Every tunable, read once at startup. Section defaults mirror the
/// behavior the daemons were tuned against; a missing file yields the
/// defaults wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bound on blocking per-agent lock acquisition in hook handlers.
    pub lock_timeout_seconds: u64,

    /// Fixed delay schedule for the deferred-stop transcript retry. The
    /// ceiling is what matters here, not average latency.
    pub deferred_stop_delays_ms: Vec<u64>,

    /// Session-id → agent cache TTL in the correlator.
    pub correlator_cache_ttl_seconds: u64,

    /// PROCESSING agents unseen for longer than this render as TIMED_OUT
    /// (display-only).
    pub stale_processing_seconds: u64,

    /// Agents unseen for longer than this are excluded from "active" lists.
    pub active_timeout_minutes: u64,

    /// How long AWAITING_INPUT may sit without a user answer before
    /// pre_tool_use emits a stale-awaiting recovery turn.
    pub stale_awaiting_seconds: u64,

    /// Tool names whose invocation means "the agent is asking the user".
    pub question_tools: Vec<String>,

    /// Reconciler match window for pairing hook turns with JSONL entries.
    pub reconcile_match_window_seconds: u64,

    pub reaper: ReaperConfig,
    pub watchdog: WatchdogConfig,
    pub broadcaster: BroadcasterConfig,
    pub transcript_watch: TranscriptWatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub inactivity_timeout_seconds: u64,
    pub grace_period_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub poll_interval_seconds: u64,
    pub gap_threshold_seconds: u64,
    pub capture_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    pub max_subscribers: usize,
    pub queue_capacity: usize,
    pub idle_timeout_seconds: u64,
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptWatchConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_timeout_seconds: 15,
            deferred_stop_delays_ms: vec![500, 1000, 1500, 2000],
            correlator_cache_ttl_seconds: 3600,
            stale_processing_seconds: 180,
            active_timeout_minutes: 5,
            stale_awaiting_seconds: 60,
            question_tools: vec![
                "AskUserQuestion".to_string(),
                "ExitPlanMode".to_string(),
            ],
            reconcile_match_window_seconds: 120,
            reaper: ReaperConfig::default(),
            watchdog: WatchdogConfig::default(),
            broadcaster: BroadcasterConfig::default(),
            transcript_watch: TranscriptWatchConfig::default(),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 60,
            inactivity_timeout_seconds: 300,
            grace_period_seconds: 300,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: 3,
            gap_threshold_seconds: 5,
            capture_lines: 20,
        }
    }
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            max_subscribers: 100,
            queue_capacity: 256,
            idle_timeout_seconds: 60,
            sweep_interval_seconds: 15,
        }
    }
}

impl Default for TranscriptWatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 1000,
        }
    }
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    pub fn deferred_stop_delays(&self) -> Vec<Duration> {
        self.deferred_stop_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    pub fn is_question_tool(&self, tool_name: &str) -> bool {
        self.question_tools.iter().any(|t| t == tool_name)
    }
}
