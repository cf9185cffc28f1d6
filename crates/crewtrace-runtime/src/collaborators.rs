//! Abstract collaborator interfaces consumed by the core, with the
//! process-local tmux/ps/log implementations used in a default deployment.
//! Tests substitute mocks.

use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PaneInfo {
    pub pane_id: String,
    pub root_pid: i32,
}

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: i32,
    pub ppid: i32,
    pub command: String,
}

/// Opaque "send text to agent N" sink plus pane capture.
pub trait TerminalSink: Send + Sync {
    fn send_text(&self, pane_id: &str, text: &str, timeout: Duration) -> Result<(), String>;
    fn capture_pane(&self, pane_id: &str, lines: usize) -> Result<String, String>;
    /// Enumerate panes with their root process ids. `Err` means the
    /// multiplexer itself is unreachable (distinct from an empty list).
    fn list_panes(&self) -> Result<Vec<PaneInfo>, String>;
}

/// Host process table: (pid, ppid, command) triples.
pub trait ProcessProbe: Send + Sync {
    fn processes(&self) -> Result<Vec<ProcessInfo>, String>;
}

/// OS notification surface. Failures are the implementer's problem; the
/// core logs and moves on.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, subtitle: Option<&str>, body: &str, url: Option<&str>);
}

/// Optional post-commit summarization backend. Never on a hot path.
pub trait InferenceClient: Send + Sync {
    /// `kind` is one of "turn", "instruction", "task_completion".
    fn summarize(&self, kind: &str, text: &str) -> Result<String, String>;
}

// ── tmux implementation ──────────────────────────────────────────────

/// Drives a tmux server through its CLI.
pub struct TmuxSink;

impl TerminalSink for TmuxSink {
    fn send_text(&self, pane_id: &str, text: &str, _timeout: Duration) -> Result<(), String> {
        let status = Command::new("tmux")
            .args(["send-keys", "-t", pane_id, text, "Enter"])
            .status()
            .map_err(|e| format!("tmux send-keys failed to spawn: {}", e))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("tmux send-keys exited with {}", status))
        }
    }

    fn capture_pane(&self, pane_id: &str, lines: usize) -> Result<String, String> {
        let start = format!("-{}", lines);
        let output = Command::new("tmux")
            .args(["capture-pane", "-p", "-t", pane_id, "-S", &start])
            .output()
            .map_err(|e| format!("tmux capture-pane failed to spawn: {}", e))?;
        if !output.status.success() {
            return Err(format!("tmux capture-pane exited with {}", output.status));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn list_panes(&self) -> Result<Vec<PaneInfo>, String> {
        let output = Command::new("tmux")
            .args(["list-panes", "-a", "-F", "#{pane_id} #{pane_pid}"])
            .output()
            .map_err(|e| format!("tmux list-panes failed to spawn: {}", e))?;
        if !output.status.success() {
            return Err(format!("tmux list-panes exited with {}", output.status));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut panes = Vec::new();
        for line in stdout.lines() {
            let mut parts = line.split_whitespace();
            let (Some(pane_id), Some(pid)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(root_pid) = pid.parse() else {
                continue;
            };
            panes.push(PaneInfo {
                pane_id: pane_id.to_string(),
                root_pid,
            });
        }
        Ok(panes)
    }
}

// ── ps implementation ────────────────────────────────────────────────

/// Walks the host process table via `ps`. `pgrep` is avoided: it reports
/// argv[0], which for the observed agents is a bare version string rather
/// than the command name.
pub struct PsProcessProbe;

impl ProcessProbe for PsProcessProbe {
    fn processes(&self) -> Result<Vec<ProcessInfo>, String> {
        let output = Command::new("ps")
            .args(["-axo", "pid=,ppid=,comm="])
            .output()
            .map_err(|e| format!("ps failed to spawn: {}", e))?;
        if !output.status.success() {
            return Err(format!("ps exited with {}", output.status));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut processes = Vec::new();
        for line in stdout.lines() {
            let mut parts = line.split_whitespace();
            let (Some(pid), Some(ppid)) = (parts.next(), parts.next()) else {
                continue;
            };
            let (Ok(pid), Ok(ppid)) = (pid.parse(), ppid.parse()) else {
                continue;
            };
            let command = parts.collect::<Vec<_>>().join(" ");
            processes.push(ProcessInfo { pid, ppid, command });
        }
        Ok(processes)
    }
}

// ── log-only notifier ────────────────────────────────────────────────

/// Default notifier: structured log lines instead of desktop popups.
/// Deployments wire a real sink through the same trait.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, subtitle: Option<&str>, body: &str, url: Option<&str>) {
        info!(title, subtitle, body, url, "notification");
    }
}

/// Find whether any descendant of `root_pid` runs a command containing
/// `needle` (case-insensitive). Checks children and grandchildren, which
/// covers the launcher → agent process shape.
pub fn descendant_command_contains(
    processes: &[ProcessInfo],
    root_pid: i32,
    needle: &str,
) -> bool {
    let needle = needle.to_lowercase();
    let children: Vec<&ProcessInfo> = processes.iter().filter(|p| p.ppid == root_pid).collect();
    for child in &children {
        if child.command.to_lowercase().contains(&needle) {
            return true;
        }
        for grandchild in processes.iter().filter(|p| p.ppid == child.pid) {
            if grandchild.command.to_lowercase().contains(&needle) {
                return true;
            }
        }
    }
    debug!(root_pid, needle, "no matching descendant process");
    false
}

/// Guarded notification helper: failures never propagate.
pub fn notify_quietly(
    notifier: &dyn Notifier,
    title: &str,
    subtitle: Option<&str>,
    body: &str,
) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        notifier.notify(title, subtitle, body, None);
    }));
    if result.is_err() {
        warn!(title, "notifier panicked (ignored)");
    }
}
