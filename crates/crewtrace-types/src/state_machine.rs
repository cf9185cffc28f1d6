//! Pure validator for task state transitions.
//!
//! This is the single source of truth for permissible mutations. Callers
//! on the normal path reject invalid transitions; forced paths (session
//! end, reaper) validate advisorily and proceed with a logged warning.

use crate::model::{TaskState, TurnActor, TurnIntent};

/// Outcome of a proposed transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionResult {
    pub valid: bool,
    pub from_state: TaskState,
    pub to_state: TaskState,
    pub reason: String,
    pub trigger: String,
}

fn lookup(from: TaskState, actor: TurnActor, intent: TurnIntent) -> Option<TaskState> {
    use TaskState::*;
    use TurnActor::*;
    use TurnIntent::*;

    match (from, actor, intent) {
        // Only user commands can start a task.
        (Idle, User, Command) => Some(Commanded),

        (Commanded, Agent, Progress) => Some(Processing),
        (Commanded, Agent, Question) => Some(AwaitingInput),
        (Commanded, Agent, Completion) | (Commanded, Agent, EndOfTask) => Some(Complete),

        (Processing, Agent, Progress) => Some(Processing),
        (Processing, Agent, Question) => Some(AwaitingInput),
        (Processing, Agent, Completion) | (Processing, Agent, EndOfTask) => Some(Complete),
        // User confirms/approves mid-flight; the task keeps processing.
        (Processing, User, Answer) => Some(Processing),

        (AwaitingInput, User, Answer) => Some(Processing),
        // Follow-up question or background output while the question is open.
        (AwaitingInput, Agent, Question) => Some(AwaitingInput),
        (AwaitingInput, Agent, Progress) => Some(AwaitingInput),
        // Forced completion while awaiting (session end).
        (AwaitingInput, Agent, Completion) | (AwaitingInput, Agent, EndOfTask) => Some(Complete),

        _ => None,
    }
}

/// Validate a proposed state transition. Pure and stateless: the result
/// depends only on the `(from_state, actor, intent)` triple.
pub fn validate_transition(
    from_state: TaskState,
    actor: TurnActor,
    intent: TurnIntent,
) -> TransitionResult {
    let trigger = format!("{}:{}", actor, intent);

    // A user command while awaiting input must open a NEW task rather than
    // mutate the current one. Rejected here; routed by the lifecycle manager.
    if from_state == TaskState::AwaitingInput
        && actor == TurnActor::User
        && intent == TurnIntent::Command
    {
        return TransitionResult {
            valid: false,
            from_state,
            to_state: from_state,
            reason: "user command while awaiting_input - should create new task".to_string(),
            trigger,
        };
    }

    match lookup(from_state, actor, intent) {
        Some(to_state) => TransitionResult {
            valid: true,
            from_state,
            to_state,
            reason: "valid transition".to_string(),
            trigger,
        },
        None => TransitionResult {
            valid: false,
            from_state,
            to_state: from_state,
            reason: format!("invalid transition: {} + {}", from_state, trigger),
            trigger,
        },
    }
}

/// All valid transitions out of a state. Debugging aid.
pub fn valid_transitions_from(state: TaskState) -> Vec<(TurnActor, TurnIntent, TaskState)> {
    let actors = [TurnActor::User, TurnActor::Agent];
    let intents = [
        TurnIntent::Command,
        TurnIntent::Answer,
        TurnIntent::Question,
        TurnIntent::Progress,
        TurnIntent::Completion,
        TurnIntent::EndOfTask,
    ];

    let mut result = Vec::new();
    for actor in actors {
        for intent in intents {
            if let Some(to) = lookup(state, actor, intent) {
                result.push((actor, intent, to));
            }
        }
    }
    result
}

/// COMPLETE has no outgoing transitions in the table. Forced-completion
/// triggers may still override it; that override is the caller's decision.
pub fn is_terminal_state(state: TaskState) -> bool {
    state == TaskState::Complete
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskState::*;
    use TurnActor::*;
    use TurnIntent::*;

    #[test]
    fn test_idle_user_command_starts_task() {
        let result = validate_transition(Idle, User, Command);
        assert!(result.valid);
        assert_eq!(result.to_state, Commanded);
        assert_eq!(result.trigger, "user:command");
    }

    #[test]
    fn test_idle_rejects_agent_turns() {
        for intent in [Progress, Question, Completion, EndOfTask] {
            let result = validate_transition(Idle, Agent, intent);
            assert!(!result.valid, "idle + agent:{} should be invalid", intent);
            assert_eq!(result.to_state, Idle);
        }
    }

    #[test]
    fn test_commanded_agent_responses() {
        assert_eq!(validate_transition(Commanded, Agent, Progress).to_state, Processing);
        assert_eq!(validate_transition(Commanded, Agent, Question).to_state, AwaitingInput);
        assert_eq!(validate_transition(Commanded, Agent, Completion).to_state, Complete);
        assert_eq!(validate_transition(Commanded, Agent, EndOfTask).to_state, Complete);
    }

    #[test]
    fn test_processing_loops_on_progress() {
        let result = validate_transition(Processing, Agent, Progress);
        assert!(result.valid);
        assert_eq!(result.to_state, Processing);
    }

    #[test]
    fn test_processing_user_answer_keeps_processing() {
        let result = validate_transition(Processing, User, Answer);
        assert!(result.valid);
        assert_eq!(result.to_state, Processing);
    }

    #[test]
    fn test_awaiting_input_user_answer_resumes() {
        let result = validate_transition(AwaitingInput, User, Answer);
        assert!(result.valid);
        assert_eq!(result.to_state, Processing);
    }

    #[test]
    fn test_awaiting_input_agent_follow_ups() {
        assert_eq!(validate_transition(AwaitingInput, Agent, Question).to_state, AwaitingInput);
        assert_eq!(validate_transition(AwaitingInput, Agent, Progress).to_state, AwaitingInput);
        assert_eq!(validate_transition(AwaitingInput, Agent, Completion).to_state, Complete);
    }

    #[test]
    fn test_awaiting_input_user_command_signals_new_task() {
        let result = validate_transition(AwaitingInput, User, Command);
        assert!(!result.valid);
        assert_eq!(result.to_state, AwaitingInput);
        assert!(result.reason.contains("new task"));
    }

    #[test]
    fn test_complete_is_terminal() {
        assert!(is_terminal_state(Complete));
        assert!(!is_terminal_state(Processing));
        for actor in [User, Agent] {
            for intent in [Command, Answer, Question, Progress, Completion, EndOfTask] {
                assert!(!validate_transition(Complete, actor, intent).valid);
            }
        }
    }

    #[test]
    fn test_result_depends_only_on_triple() {
        let first = validate_transition(Processing, Agent, Question);
        let second = validate_transition(Processing, Agent, Question);
        assert_eq!(first, second);
    }

    #[test]
    fn test_valid_transitions_from_processing() {
        let transitions = valid_transitions_from(Processing);
        assert!(transitions.contains(&(Agent, Progress, Processing)));
        assert!(transitions.contains(&(Agent, Question, AwaitingInput)));
        assert!(transitions.contains(&(User, Answer, Processing)));
        assert_eq!(valid_transitions_from(Complete).len(), 0);
    }
}
