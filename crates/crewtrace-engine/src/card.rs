//! User-visible projection of an agent ("card").
//!
//! Pure over preloaded rows so pull responses and push events derive the
//! exact same view, with no "reload to see truth" divergence. The TIMED_OUT
//! overlay is display-only and never persisted.

use chrono::{DateTime, Duration, Utc};
use crewtrace_types::{Agent, Task, TaskState, Turn, TurnActor, TurnIntent};
use serde::{Deserialize, Serialize};

/// Display-only overlay for stale PROCESSING agents. Not a TaskState.
pub const TIMED_OUT: &str = "TIMED_OUT";

/// Preloaded rows the projection reads.
pub struct CardInputs<'a> {
    pub agent: &'a Agent,
    pub project_name: Option<&'a str>,
    /// The agent's tasks, most recent first.
    pub tasks: &'a [Task],
    /// Turns of the display task (current task, or the most recent one),
    /// in canonical (timestamp, id) order.
    pub turns: &'a [Turn],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardState {
    pub agent_id: i64,
    pub session_uuid: String,
    pub project_id: i64,
    pub project_name: Option<String>,
    pub is_active: bool,
    pub uptime: String,
    pub last_seen: String,
    pub state: String,
    pub task_summary: String,
    pub task_instruction: Option<String>,
    pub task_completion_summary: Option<String>,
    pub priority: i64,
    pub priority_reason: Option<String>,
}

/// Effective display state: the current task's state, IDLE with no current
/// task, or the TIMED_OUT overlay when a PROCESSING agent has not been seen
/// within `stale_processing`.
pub fn effective_state(
    agent: &Agent,
    current_state: Option<TaskState>,
    now: DateTime<Utc>,
    stale_processing: Duration,
) -> String {
    let state = current_state.unwrap_or(TaskState::Idle);
    if state == TaskState::Processing && agent.ended_at.is_none() {
        let elapsed = now - agent.last_seen_at;
        if elapsed > stale_processing {
            return TIMED_OUT.to_string();
        }
    }
    state.as_str().to_uppercase()
}

pub fn format_uptime(started_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let total_seconds = (now - started_at).num_seconds().max(0);
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    if hours > 0 {
        format!("up {}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("up {}m", minutes)
    } else {
        "up <1m".to_string()
    }
}

pub fn format_last_seen(last_seen_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let total_seconds = (now - last_seen_at).num_seconds().max(0);
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    if hours > 0 {
        format!("{}h {}m ago", hours, minutes)
    } else if minutes > 0 {
        format!("{}m ago", minutes)
    } else {
        "<1m ago".to_string()
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

fn turn_display_text(turn: &Turn) -> Option<String> {
    if let Some(summary) = &turn.summary {
        return Some(summary.clone());
    }
    if !turn.text.is_empty() {
        return Some(truncate(&turn.text, 100));
    }
    None
}

fn completed_task_summary(task: &Task, turns: &[Turn]) -> String {
    if let Some(summary) = &task.completion_summary {
        return summary.clone();
    }
    if let Some(last) = turns.last() {
        if let Some(text) = turn_display_text(last) {
            return text;
        }
    }
    "Summarising...".to_string()
}

fn task_summary(inputs: &CardInputs, current_task: Option<&Task>) -> String {
    let Some(task) = current_task else {
        // No active task: surface the most recent completed one, if any.
        if let Some(latest) = inputs.tasks.first() {
            if latest.state == TaskState::Complete {
                return completed_task_summary(latest, inputs.turns);
            }
        }
        return "No active task".to_string();
    };

    // While awaiting input, the agent's open question is the headline.
    if task.state == TaskState::AwaitingInput {
        for turn in inputs.turns.iter().rev() {
            if turn.actor == TurnActor::Agent && turn.intent == TurnIntent::Question {
                if let Some(text) = turn_display_text(turn) {
                    return text;
                }
                break;
            }
        }
    }

    // Otherwise the latest non-question turn; a stale question must not
    // linger once the agent has resumed.
    let mut saw_turn = false;
    for turn in inputs.turns.iter().rev() {
        saw_turn = true;
        if turn.actor == TurnActor::Agent && turn.intent == TurnIntent::Question {
            continue;
        }
        if let Some(text) = turn_display_text(turn) {
            return text;
        }
    }
    if saw_turn {
        String::new()
    } else {
        "No active task".to_string()
    }
}

fn task_instruction(inputs: &CardInputs, current_task: Option<&Task>) -> Option<String> {
    if let Some(task) = current_task {
        if let Some(instruction) = &task.instruction {
            return Some(instruction.clone());
        }
    }
    if let Some(latest) = inputs.tasks.first() {
        if let Some(instruction) = &latest.instruction {
            return Some(instruction.clone());
        }
    }
    // Fall back to the raw first user command, truncated to 80 chars.
    for turn in inputs.turns {
        if turn.actor == TurnActor::User && turn.intent == TurnIntent::Command {
            let text = turn.text.trim();
            if !text.is_empty() {
                return Some(truncate(text, 80));
            }
        }
    }
    None
}

fn task_completion_summary(inputs: &CardInputs) -> Option<String> {
    for task in inputs.tasks {
        if task.state == TaskState::Complete {
            if let Some(summary) = &task.completion_summary {
                return Some(summary.clone());
            }
            if let Some(last) = inputs.turns.last() {
                if let Some(summary) = &last.summary {
                    return Some(summary.clone());
                }
            }
            return None;
        }
    }
    None
}

/// Build the full card for an agent.
pub fn build_card(
    inputs: &CardInputs,
    now: DateTime<Utc>,
    stale_processing: Duration,
    active_timeout: Duration,
) -> CardState {
    let agent = inputs.agent;
    let current_task = inputs.tasks.iter().find(|t| t.state != TaskState::Complete);
    let state = effective_state(agent, current_task.map(|t| t.state), now, stale_processing);

    let is_active = agent.ended_at.is_none() && (now - agent.last_seen_at) <= active_timeout;
    let uuid = agent.session_uuid.to_string();

    CardState {
        agent_id: agent.id,
        session_uuid: uuid[..8].to_string(),
        project_id: agent.project_id,
        project_name: inputs.project_name.map(|n| n.to_string()),
        is_active,
        uptime: format_uptime(agent.started_at, now),
        last_seen: format_last_seen(agent.last_seen_at, now),
        state,
        task_summary: task_summary(inputs, current_task),
        task_instruction: task_instruction(inputs, current_task),
        task_completion_summary: task_completion_summary(inputs),
        priority: agent.priority_score.unwrap_or(50),
        priority_reason: agent.priority_reason.clone(),
    }
}
