//! Detection of machine-to-machine sub-agent protocol chatter.
//!
//! When an observed agent spawns sub-agents, their protocol messages
//! (structured JSON sends, task-notification XML, shutdown requests) leak
//! into the parent transcript. Turns carrying such content are flagged
//! `is_internal` at creation time and hidden from transcripts by default.

use once_cell::sync::Lazy;
use regex::Regex;

// Protocol tags are injected at the very start of the message. Text that
// merely discusses these tags mid-prose must not be flagged.
static XML_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*<(task-notification|system-reminder)\b").unwrap());

// Cheap pre-screen before attempting a JSON parse.
static JSON_TYPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#""type"\s*:\s*"(message|broadcast|shutdown_request|shutdown_response|plan_approval_request|plan_approval_response|idle)""#,
    )
    .unwrap()
});

/// Returns true when the text is sub-agent protocol content that should be
/// hidden from user-facing transcripts.
pub fn is_team_internal_content(text: Option<&str>) -> bool {
    let Some(text) = text else {
        return false;
    };
    let stripped = text.trim();
    if stripped.is_empty() {
        return false;
    }

    if XML_TAG.is_match(stripped) {
        return true;
    }

    if !JSON_TYPE.is_match(stripped) {
        return false;
    }

    // Validate it is actually structured protocol JSON, not user text that
    // happens to contain a type field.
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(stripped) else {
        return false;
    };
    let Some(obj) = parsed.as_object() else {
        return false;
    };
    let Some(msg_type) = obj.get("type").and_then(|v| v.as_str()) else {
        return false;
    };

    match msg_type {
        "message" => obj.contains_key("recipient"),
        "broadcast" => obj.contains_key("content"),
        "idle" | "shutdown_request" | "shutdown_response" | "plan_approval_request"
        | "plan_approval_response" => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_and_none_are_not_internal() {
        assert!(!is_team_internal_content(None));
        assert!(!is_team_internal_content(Some("")));
        assert!(!is_team_internal_content(Some("   ")));
    }

    #[test]
    fn test_task_notification_xml_at_start() {
        assert!(is_team_internal_content(Some(
            "<task-notification from=\"worker\">done</task-notification>"
        )));
        assert!(is_team_internal_content(Some(
            "  <system-reminder>context</system-reminder>"
        )));
    }

    #[test]
    fn test_xml_tag_mid_text_is_not_internal() {
        assert!(!is_team_internal_content(Some(
            "The harness wraps results in a <task-notification> tag."
        )));
    }

    #[test]
    fn test_send_message_json_requires_recipient() {
        assert!(is_team_internal_content(Some(
            r#"{"type": "message", "recipient": "lead", "content": "status?"}"#
        )));
        assert!(!is_team_internal_content(Some(
            r#"{"type": "message", "content": "no recipient field"}"#
        )));
    }

    #[test]
    fn test_shutdown_request_json() {
        assert!(is_team_internal_content(Some(
            r#"{"type": "shutdown_request", "request_id": "abc"}"#
        )));
    }

    #[test]
    fn test_prose_mentioning_type_is_not_internal() {
        assert!(!is_team_internal_content(Some(
            r#"Set "type": "message" in the payload to route it."#
        )));
    }

    #[test]
    fn test_unknown_json_type_is_not_internal() {
        assert!(!is_team_internal_content(Some(
            r#"{"type": "status_report", "content": "hi"}"#
        )));
    }
}
