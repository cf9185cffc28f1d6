//! Regex-based turn intent classification.
//!
//! User intent is determined by the current task state, not text content.
//! Agent intent is pattern-matched: fenced code blocks are stripped, the
//! last up-to-15 non-empty lines ("tail") are checked first at full
//! confidence, then the whole cleaned text at reduced confidence. The
//! pattern families are a fixed heuristic, never the primary correctness
//! mechanism; the state machine is.

use crewtrace_types::{TaskState, TurnActor, TurnIntent};
use once_cell::sync::Lazy;
use regex::Regex;

const TAIL_LINES: usize = 15;

/// Result of intent detection.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentResult {
    pub intent: TurnIntent,
    pub confidence: f64,
    pub matched_pattern: Option<String>,
}

impl IntentResult {
    fn new(intent: TurnIntent, confidence: f64, matched: Option<&str>) -> Self {
        Self {
            intent,
            confidence,
            matched_pattern: matched.map(|m| m.to_string()),
        }
    }
}

static QUESTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        // Common question openers
        r"(?im)^(?:would you like|should i|do you want|can i|shall i|may i)\b",
        r"(?is)\b(?:would you like|should i|do you want|can i|shall i|may i)\b.*\?\s*$",
        // Clarifying questions
        r"(?i)is that correct|does that (?:work|look|sound) (?:okay|good|right)|what do you think",
        r"(?i)let me know|please confirm|could you clarify|could you tell me",
        // Waiting for input without a question mark
        r"(?i)\bwaiting for (?:your|the user'?s?) (?:response|input|answer|reply|decision|choice|feedback)\b",
        r"(?i)\bplease (?:respond|reply|answer|select|choose|provide|specify)\b",
        // Offering choices / seeking preference
        r"(?i)\b(?:want me to|how would you like me to|what'?s your preference)\b",
        r"(?i)\bwhich (?:approach|option|method) would you prefer\b",
        // Implicit waiting
        r"(?i)\bbefore i (?:proceed|continue|start)\b",
        // Needing input
        r"(?i)\bi need (?:to know|your (?:input|decision|confirmation))\b",
        r"(?i)\bdo you have a preference\b",
        // Presenting choices
        r"(?i)here are (?:a few|some|the) options:|there are (?:two|three|several) approaches:",
        r"(?i)\bi have (?:a few|some|several) questions:",
    ])
});

// Blocked/error phrasing is treated as a question: the agent needs help.
static BLOCKED_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)i don'?t have (?:permission|access) to|i can'?t access|this requires (?:authentication|authorization)",
        r"(?im)(?:^error:|\bfailed to\b|permission denied)",
        r"(?i)i'?m unable to|i couldn'?t|i was unable to",
    ])
});

// Summary-style closers that wrap up the whole exchange.
static END_OF_TASK_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)i'?ve made the following changes:",
        r"(?i)here'?s a summary of what was done",
    ])
});

static COMPLETION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?im)^(?:done|complete|finished|all (?:done|set|finished))[.!\s]*$",
        r"(?i)i'?(?:ve|m) (?:finished|completed|done)|task (?:complete|finished|done)",
        r"(?i)successfully (?:completed|finished)|changes (?:have been )?(?:made|applied|committed)",
        r"(?is)(?:that'?s all (?:the changes|i (?:need|have))|all changes (?:have been|are) (?:made|applied|committed|complete)|everything is (?:set|done|ready|in place|complete))[.!\s]*$",
        r"(?i)implementation (?:is )?complete|feature (?:is )?(?:ready|done|complete)",
        r"(?i)all tests are passing",
        r"(?i)the pr is ready for review",
        r"(?i)committed to branch|changes have been pushed",
    ])
});

static CODE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```\w*\n.*?\n```").unwrap());

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("static pattern must compile"))
        .collect()
}

/// Remove fenced code blocks so code content cannot trigger patterns.
fn strip_code_blocks(text: &str) -> String {
    CODE_BLOCK.replace_all(text, "").into_owned()
}

/// The last N non-empty lines; agent output is often hundreds of lines and
/// the actionable intent sits at the tail.
fn extract_tail(text: &str) -> String {
    let lines: Vec<&str> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect();
    let start = lines.len().saturating_sub(TAIL_LINES);
    lines[start..].join("\n")
}

/// A trailing `?` counts as a question unless it closes a code span, a
/// quoted string, or a URL path. The regex crate has no lookbehind, so
/// this check is plain code.
fn ends_with_question_mark(text: &str) -> bool {
    let trimmed = text.trim_end();
    if !trimmed.ends_with('?') {
        return false;
    }
    let mut chars = trimmed.chars().rev();
    chars.next();
    match chars.next() {
        Some('`') | Some('"') | Some('\'') | Some('/') => false,
        _ => true,
    }
}

fn match_family(text: &str, patterns: &[Regex]) -> Option<String> {
    patterns
        .iter()
        .find(|p| p.is_match(text))
        .map(|p| p.as_str().to_string())
}

fn classify(text: &str) -> Option<(TurnIntent, String)> {
    if ends_with_question_mark(text) {
        return Some((TurnIntent::Question, "trailing_question_mark".to_string()));
    }
    if let Some(pattern) = match_family(text, &QUESTION_PATTERNS) {
        return Some((TurnIntent::Question, pattern));
    }
    if let Some(pattern) = match_family(text, &BLOCKED_PATTERNS) {
        return Some((TurnIntent::Question, pattern));
    }
    if let Some(pattern) = match_family(text, &END_OF_TASK_PATTERNS) {
        return Some((TurnIntent::EndOfTask, pattern));
    }
    if let Some(pattern) = match_family(text, &COMPLETION_PATTERNS) {
        return Some((TurnIntent::Completion, pattern));
    }
    None
}

/// Detect the intent of an agent turn.
///
/// Pipeline: empty text defaults to PROGRESS(0.5); otherwise strip code
/// blocks, match the tail (confidence 1.0), then the full cleaned text
/// (confidence 0.8), then default to PROGRESS(0.5).
pub fn detect_agent_intent(text: Option<&str>) -> IntentResult {
    let Some(text) = text else {
        return IntentResult::new(TurnIntent::Progress, 0.5, None);
    };
    if text.trim().is_empty() {
        return IntentResult::new(TurnIntent::Progress, 0.5, None);
    }

    let cleaned = strip_code_blocks(text.trim());
    let tail = extract_tail(&cleaned);

    if let Some((intent, pattern)) = classify(&tail) {
        return IntentResult::new(intent, 1.0, Some(&pattern));
    }
    if let Some((intent, pattern)) = classify(&cleaned) {
        return IntentResult::new(intent, 0.8, Some(&pattern));
    }

    IntentResult::new(TurnIntent::Progress, 0.5, None)
}

/// Detect the intent of a user turn from the current task state: answering
/// while AWAITING_INPUT, commanding otherwise.
pub fn detect_user_intent(_text: Option<&str>, current_state: TaskState) -> IntentResult {
    if current_state == TaskState::AwaitingInput {
        IntentResult::new(TurnIntent::Answer, 1.0, None)
    } else {
        IntentResult::new(TurnIntent::Command, 1.0, None)
    }
}

/// Main entry point: routes to the actor-appropriate detector.
pub fn detect_intent(
    text: Option<&str>,
    actor: TurnActor,
    current_state: TaskState,
) -> IntentResult {
    match actor {
        TurnActor::User => detect_user_intent(text, current_state),
        TurnActor::Agent => detect_agent_intent(text),
    }
}
