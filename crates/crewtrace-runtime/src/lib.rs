//! Runtime layer of crewtrace: the fault-tolerant event funnel.
//!
//! Coordinates four signal sources of differing latency and reliability
//! (push hooks, transcript tails, terminal-pane scans, and process-tree
//! probes) into one canonical per-agent timeline, serialized under
//! per-agent advisory locks and fanned out to subscribers.

pub mod broadcaster;
pub mod collaborators;
pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod hook_state;
pub mod hooks;
pub mod lifecycle;
pub mod projector;
pub mod reaper;
pub mod reconciler;
pub mod runtime;
pub mod summarize;
pub mod transcript_watch;
pub mod watchdog;

pub use broadcaster::{Broadcaster, SubscribeFilters, Subscription};
pub use collaborators::{
    InferenceClient, LogNotifier, Notifier, PaneInfo, ProcessInfo, ProcessProbe, PsProcessProbe,
    TerminalSink, TmuxSink,
};
pub use config::Config;
pub use correlator::{Correlation, CorrelationMethod, SessionCorrelator};
pub use error::{Error, Result};
pub use events::{BroadcastEvent, EventPayload};
pub use hook_state::AgentHookState;
pub use hooks::{HookEvent, HookIngestor, HookOutcome, RespondOutcome};
pub use lifecycle::{
    NotificationRequest, SummarisationRequest, TaskLifecycle, TurnProcessingOutcome,
};
pub use reaper::{reap_once, ReapDetail, ReapResult};
pub use runtime::{Core, HookStats, Runtime, RuntimeBuilder};
