//! Mock collaborators backing the runtime's trait seams.

use crewtrace_runtime::collaborators::{
    InferenceClient, Notifier, PaneInfo, ProcessInfo, ProcessProbe, TerminalSink,
};
use std::sync::Mutex;
use std::time::Duration;

/// In-memory terminal: scripted pane content, recorded sends.
#[derive(Default)]
pub struct MockTerminalSink {
    panes: Mutex<Vec<PaneInfo>>,
    captures: Mutex<Vec<(String, String)>>,
    sent: Mutex<Vec<(String, String)>>,
    fail_sends: Mutex<bool>,
}

impl MockTerminalSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pane(&self, pane_id: &str, root_pid: i32) {
        self.panes.lock().unwrap().push(PaneInfo {
            pane_id: pane_id.to_string(),
            root_pid,
        });
    }

    pub fn remove_pane(&self, pane_id: &str) {
        self.panes.lock().unwrap().retain(|p| p.pane_id != pane_id);
    }

    pub fn set_pane_content(&self, pane_id: &str, content: &str) {
        let mut captures = self.captures.lock().unwrap();
        captures.retain(|(id, _)| id != pane_id);
        captures.push((pane_id.to_string(), content.to_string()));
    }

    pub fn fail_sends(&self, fail: bool) {
        *self.fail_sends.lock().unwrap() = fail;
    }

    pub fn sent_texts(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

impl TerminalSink for MockTerminalSink {
    fn send_text(&self, pane_id: &str, text: &str, _timeout: Duration) -> Result<(), String> {
        if *self.fail_sends.lock().unwrap() {
            return Err("mock send failure".to_string());
        }
        self.sent
            .lock()
            .unwrap()
            .push((pane_id.to_string(), text.to_string()));
        Ok(())
    }

    fn capture_pane(&self, pane_id: &str, _lines: usize) -> Result<String, String> {
        self.captures
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id == pane_id)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| format!("no such pane: {}", pane_id))
    }

    fn list_panes(&self) -> Result<Vec<PaneInfo>, String> {
        Ok(self.panes.lock().unwrap().clone())
    }
}

/// Scripted process table.
#[derive(Default)]
pub struct MockProcessProbe {
    processes: Mutex<Vec<ProcessInfo>>,
}

impl MockProcessProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_process(&self, pid: i32, ppid: i32, command: &str) {
        self.processes.lock().unwrap().push(ProcessInfo {
            pid,
            ppid,
            command: command.to_string(),
        });
    }

    pub fn clear(&self) {
        self.processes.lock().unwrap().clear();
    }
}

impl ProcessProbe for MockProcessProbe {
    fn processes(&self) -> Result<Vec<ProcessInfo>, String> {
        Ok(self.processes.lock().unwrap().clone())
    }
}

/// Records every notification instead of showing it.
#[derive(Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<(String, String)> {
        self.notifications.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, _subtitle: Option<&str>, body: &str, _url: Option<&str>) {
        self.notifications
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string()));
    }
}

/// Deterministic summarizer: tags the kind and echoes a prefix.
pub struct EchoInference;

impl InferenceClient for EchoInference {
    fn summarize(&self, kind: &str, text: &str) -> Result<String, String> {
        let head: String = text.chars().take(40).collect();
        Ok(format!("[{}] {}", kind, head))
    }
}
