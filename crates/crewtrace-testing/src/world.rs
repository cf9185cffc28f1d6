//! A fully wired runtime against mock collaborators, for end-to-end
//! scenario tests.

use crate::fixtures::TranscriptFixture;
use crate::mocks::{EchoInference, MockProcessProbe, MockTerminalSink, RecordingNotifier};
use crewtrace_runtime::hooks::HookEvent;
use crewtrace_runtime::{Config, Runtime};
use std::sync::Arc;

pub struct TestWorld {
    pub runtime: Runtime,
    pub terminal: Arc<MockTerminalSink>,
    pub probe: Arc<MockProcessProbe>,
    pub notifier: Arc<RecordingNotifier>,
    pub transcript: TranscriptFixture,
}

impl TestWorld {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let terminal = Arc::new(MockTerminalSink::new());
        let probe = Arc::new(MockProcessProbe::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let runtime = Runtime::builder(config)
            .terminal(Arc::clone(&terminal) as Arc<dyn crewtrace_runtime::TerminalSink>)
            .probe(Arc::clone(&probe) as Arc<dyn crewtrace_runtime::ProcessProbe>)
            .notifier(Arc::clone(&notifier) as Arc<dyn crewtrace_runtime::Notifier>)
            .inference(Arc::new(EchoInference))
            .build()
            .expect("build test runtime");

        Self {
            runtime,
            terminal,
            probe,
            notifier,
            transcript: TranscriptFixture::new(),
        }
    }

    /// A hook event for this world's transcript, cwd `/work/demo`.
    pub fn hook(&self, session_id: &str) -> HookEvent {
        HookEvent {
            session_id: session_id.to_string(),
            working_directory: Some("/work/demo".to_string()),
            transcript_path: Some(self.transcript.path_str()),
            ..Default::default()
        }
    }

    pub fn hook_with_text(&self, session_id: &str, text: &str) -> HookEvent {
        let mut event = self.hook(session_id);
        event.text = Some(text.to_string());
        event
    }
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// Config tuned for fast tests: background daemons off, short windows.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.reaper.enabled = false;
    config.watchdog.enabled = false;
    config.transcript_watch.enabled = false;
    config.deferred_stop_delays_ms = vec![20, 30, 50];
    config
}
