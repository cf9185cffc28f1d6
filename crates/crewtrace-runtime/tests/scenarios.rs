//! End-to-end scenarios over a fully wired runtime with mock
//! collaborators: the hook funnel, deferred stop, reconciliation, the
//! reaper, and the respond echo suppression.

use chrono::{Duration as ChronoDuration, Utc};
use crewtrace_runtime::reconciler::reconcile_full_session;
use crewtrace_runtime::{reap_once, SubscribeFilters};
use crewtrace_testing::{test_config, TestWorld};
use crewtrace_types::{TaskState, TimestampSource, TurnActor, TurnIntent};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

#[test]
fn s1_normal_command_answer_round_trip() {
    let world = TestWorld::new();

    let start = world
        .runtime
        .ingest_session_start(&world.hook("sess-s1"))
        .unwrap();
    assert!(start.ok);
    assert_eq!(start.new_state, "IDLE");
    let agent_id = start.agent_id;

    let prompt = world
        .runtime
        .ingest_user_prompt_submit(&world.hook_with_text("sess-s1", "fix auth"))
        .unwrap();
    assert!(prompt.ok);
    assert_eq!(prompt.new_state, "PROCESSING");

    world.transcript.append_user("fix auth");
    world.transcript.append_assistant("I've done the refactor.");

    let stop = world.runtime.ingest_stop(&world.hook("sess-s1")).unwrap();
    assert!(stop.ok);
    assert_eq!(stop.new_state, "IDLE");

    let core = world.runtime.core();
    let db = core.db.lock().unwrap();

    // One agent for the project path.
    let project = db.get_project_by_path("/work/demo").unwrap().unwrap();
    assert_eq!(project.name, "demo");

    let tasks = db.tasks_for_agent(agent_id).unwrap();
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.state, TaskState::Complete);
    assert!(task.completed_at.is_some());

    let turns = db.turns_for_task(task.id).unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].actor, TurnActor::User);
    assert_eq!(turns[0].intent, TurnIntent::Command);
    assert_eq!(turns[0].text, "fix auth");
    assert_eq!(turns[1].actor, TurnActor::Agent);
    assert_eq!(turns[1].intent, TurnIntent::Completion);
    assert_eq!(turns[1].text, "I've done the refactor.");

    // IDLE→COMMANDED, COMMANDED→PROCESSING, PROCESSING→COMPLETE.
    assert_eq!(db.count_events("state_transition").unwrap(), 3);
    drop(db);

    let card = world.runtime.get_card(agent_id).unwrap();
    assert_eq!(card.state, "IDLE");
}

#[test]
fn s2_mid_reply_question_and_answer_link() {
    let world = TestWorld::new();
    world
        .runtime
        .ingest_session_start(&world.hook("sess-s2"))
        .unwrap();
    let prompt = world
        .runtime
        .ingest_user_prompt_submit(&world.hook_with_text("sess-s2", "fix auth"))
        .unwrap();
    let agent_id = prompt.agent_id;

    world.transcript.append_user("fix auth");
    world
        .transcript
        .append_assistant("Which database should I use?");

    let stop = world.runtime.ingest_stop(&world.hook("sess-s2")).unwrap();
    assert_eq!(stop.new_state, "AWAITING_INPUT");

    let question_turn_id = {
        let db = world.runtime.core().db.lock().unwrap();
        let task = db.current_task(agent_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::AwaitingInput);
        let turns = db.turns_for_task(task.id).unwrap();
        let last = turns.last().unwrap();
        assert_eq!(last.actor, TurnActor::Agent);
        assert_eq!(last.intent, TurnIntent::Question);
        last.id
    };

    // The awaiting-input OS notification fires once, post-commit.
    let notifier = Arc::clone(&world.notifier);
    assert!(wait_until(Duration::from_secs(2), || {
        !notifier.notifications().is_empty()
    }));
    let notifications = world.notifier.notifications();
    assert_eq!(notifications.len(), 1);
    assert!(notifications[0].0.contains("needs input"));

    // The user answers through the normal prompt hook.
    let answer = world
        .runtime
        .ingest_user_prompt_submit(&world.hook_with_text("sess-s2", "postgres"))
        .unwrap();
    assert!(answer.ok);
    assert_eq!(answer.new_state, "PROCESSING");

    let db = world.runtime.core().db.lock().unwrap();
    let task = db.current_task(agent_id).unwrap().unwrap();
    let turns = db.turns_for_task(task.id).unwrap();
    let answer_turn = turns
        .iter()
        .find(|t| t.intent == TurnIntent::Answer)
        .unwrap();
    assert_eq!(answer_turn.actor, TurnActor::User);
    assert_eq!(answer_turn.answers_turn_id, Some(question_turn_id));
}

#[test]
fn s3_deferred_stop_closes_task_after_late_flush() {
    let world = TestWorld::new();
    world
        .runtime
        .ingest_session_start(&world.hook("sess-s3"))
        .unwrap();
    let prompt = world
        .runtime
        .ingest_user_prompt_submit(&world.hook_with_text("sess-s3", "run the suite"))
        .unwrap();
    let agent_id = prompt.agent_id;

    // Stop fires while the transcript is still empty.
    let stop = world.runtime.ingest_stop(&world.hook("sess-s3")).unwrap();
    assert!(stop.ok);
    assert_eq!(stop.new_state, "PROCESSING");

    // A second stop while the deferred worker is in flight is a no-op.
    let second = world.runtime.ingest_stop(&world.hook("sess-s3")).unwrap();
    assert!(second.ok);

    // The transcript flushes late.
    world.transcript.append_assistant("All tests are passing");

    let core = Arc::clone(world.runtime.core());
    assert!(wait_until(Duration::from_secs(3), || {
        let db = core.db.lock().unwrap();
        db.current_task(agent_id).unwrap().is_none()
    }));

    let db = core.db.lock().unwrap();
    let tasks = db.tasks_for_agent(agent_id).unwrap();
    assert_eq!(tasks.len(), 1, "single-flight must not fork tasks");
    assert_eq!(tasks[0].state, TaskState::Complete);
    assert_eq!(tasks[0].full_output.as_deref(), Some("All tests are passing"));
    // No orphaned empty turns: exactly the command and the completion.
    let turns = db.turns_for_task(tasks[0].id).unwrap();
    assert_eq!(turns.len(), 2);
    assert!(turns.iter().all(|t| !t.text.trim().is_empty()));
}

#[test]
fn s4_reaper_reclaims_inactive_agent() {
    let mut config = test_config();
    config.reaper.grace_period_seconds = 0;
    let world = TestWorld::with_config(config);

    world
        .runtime
        .ingest_session_start(&world.hook("sess-s4"))
        .unwrap();
    let prompt = world
        .runtime
        .ingest_user_prompt_submit(&world.hook_with_text("sess-s4", "long task"))
        .unwrap();
    let agent_id = prompt.agent_id;

    let subscription = world
        .runtime
        .subscribe(SubscribeFilters {
            types: vec!["session_ended".to_string()],
            ..Default::default()
        })
        .unwrap();

    {
        // Ten minutes of silence, no pane to check.
        let db = world.runtime.core().db.lock().unwrap();
        db.touch_agent(agent_id, Utc::now() - ChronoDuration::minutes(10))
            .unwrap();
    }

    let result = reap_once(world.runtime.core());
    assert_eq!(result.reaped, 1);
    assert_eq!(result.details[0].reason, "inactivity_timeout");

    let db = world.runtime.core().db.lock().unwrap();
    let agent = db.get_agent(agent_id).unwrap().unwrap();
    assert!(agent.ended_at.is_some());

    let tasks = db.tasks_for_agent(agent_id).unwrap();
    assert_eq!(tasks[0].state, TaskState::Complete);

    // The forced completion is audited with a reaper trigger.
    let events = db.events_for_agent(agent_id).unwrap();
    let reaper_transition = events.iter().any(|e| {
        e.event_type == "state_transition"
            && e.payload
                .as_ref()
                .and_then(|p| p.get("trigger"))
                .and_then(|t| t.as_str())
                .map(|t| t.starts_with("reaper:"))
                .unwrap_or(false)
    });
    assert!(reaper_transition);
    assert!(events.iter().any(|e| e.event_type == "reaper_ended"));
    drop(db);

    let event = subscription.next(Duration::from_secs(1)).unwrap();
    assert_eq!(event.payload.kind(), "session_ended");
}

#[test]
fn s5_reconciler_recovers_missed_question() {
    let world = TestWorld::new();
    world
        .runtime
        .ingest_session_start(&world.hook("sess-s5"))
        .unwrap();
    let prompt = world
        .runtime
        .ingest_user_prompt_submit(&world.hook_with_text("sess-s5", "fix auth"))
        .unwrap();
    let agent_id = prompt.agent_id;

    let subscription = world
        .runtime
        .subscribe(SubscribeFilters {
            types: vec!["turn_created".to_string()],
            ..Default::default()
        })
        .unwrap();

    // The stop hook that would have carried this question was dropped;
    // only the transcript has it.
    let jsonl_ts = Utc::now() - ChronoDuration::seconds(42);
    world
        .transcript
        .append_assistant_at("Should I also migrate the staging schema?", jsonl_ts);

    reconcile_full_session(world.runtime.core(), agent_id);

    let db = world.runtime.core().db.lock().unwrap();
    let task = db.current_task(agent_id).unwrap().unwrap();
    assert_eq!(task.state, TaskState::AwaitingInput);

    let turns = db.turns_for_task(task.id).unwrap();
    let question = turns
        .iter()
        .find(|t| t.intent == TurnIntent::Question)
        .unwrap();
    assert_eq!(question.timestamp_source, TimestampSource::Jsonl);
    assert!((question.timestamp - jsonl_ts).num_milliseconds().abs() < 1500);
    drop(db);

    let event = subscription.next(Duration::from_secs(1)).unwrap();
    assert_eq!(event.payload.kind(), "turn_created");
}

#[test]
fn s6_respond_pending_suppresses_echo() {
    let world = TestWorld::new();
    world
        .runtime
        .ingest_session_start(&world.hook("sess-s6"))
        .unwrap();
    let prompt = world
        .runtime
        .ingest_user_prompt_submit(&world.hook_with_text("sess-s6", "fix auth"))
        .unwrap();
    let agent_id = prompt.agent_id;

    world.transcript.append_user("fix auth");
    world
        .transcript
        .append_assistant("Which database should I use?");
    world.runtime.ingest_stop(&world.hook("sess-s6")).unwrap();

    {
        let db = world.runtime.core().db.lock().unwrap();
        db.set_agent_pane(agent_id, "%7").unwrap();
    }

    // Answer through the respond path: inflight before send, pending
    // after commit.
    let respond = world
        .runtime
        .ingest_user_answer(agent_id, "postgres", None)
        .unwrap();
    assert!(respond.ok, "respond failed: {:?}", respond.error_kind);
    assert_eq!(respond.new_state, "PROCESSING");
    assert_eq!(world.terminal.sent_texts(), vec![("%7".to_string(), "postgres".to_string())]);

    let user_turns_before = {
        let db = world.runtime.core().db.lock().unwrap();
        let task = db.current_task(agent_id).unwrap().unwrap();
        db.user_turn_count(task.id).unwrap()
    };

    // The external agent echoes the answer as a prompt hook within the
    // TTL; it must not create a duplicate USER turn.
    let echo = world
        .runtime
        .ingest_user_prompt_submit(&world.hook_with_text("sess-s6", "postgres"))
        .unwrap();
    assert!(echo.ok);

    let db = world.runtime.core().db.lock().unwrap();
    let task = db.current_task(agent_id).unwrap().unwrap();
    assert_eq!(db.user_turn_count(task.id).unwrap(), user_turns_before);
    assert_eq!(task.state, TaskState::Processing);
}

#[test]
fn respond_rejected_outside_awaiting_input() {
    let world = TestWorld::new();
    world
        .runtime
        .ingest_session_start(&world.hook("sess-r1"))
        .unwrap();
    let prompt = world
        .runtime
        .ingest_user_prompt_submit(&world.hook_with_text("sess-r1", "go"))
        .unwrap();

    let respond = world
        .runtime
        .ingest_user_answer(prompt.agent_id, "hello?", None)
        .unwrap();
    assert!(!respond.ok);
    assert_eq!(respond.error_kind.as_deref(), Some("wrong_state"));
    assert!(world.terminal.sent_texts().is_empty());
}

#[test]
fn invariant_single_open_task_per_agent() {
    let world = TestWorld::new();
    world
        .runtime
        .ingest_session_start(&world.hook("sess-inv"))
        .unwrap();
    let prompt = world
        .runtime
        .ingest_user_prompt_submit(&world.hook_with_text("sess-inv", "first task"))
        .unwrap();
    let agent_id = prompt.agent_id;

    world.transcript.append_assistant("Done.");
    world.runtime.ingest_stop(&world.hook("sess-inv")).unwrap();

    // Second command opens a second task.
    world
        .runtime
        .ingest_user_prompt_submit(&world.hook_with_text("sess-inv", "second task"))
        .unwrap();

    let db = world.runtime.core().db.lock().unwrap();
    let open: Vec<_> = db
        .tasks_for_agent(agent_id)
        .unwrap()
        .into_iter()
        .filter(|t| t.state != TaskState::Complete)
        .collect();
    assert_eq!(open.len(), 1);
}

#[test]
fn session_end_forces_completion_and_full_reconcile() {
    let world = TestWorld::new();
    world
        .runtime
        .ingest_session_start(&world.hook("sess-end"))
        .unwrap();
    let prompt = world
        .runtime
        .ingest_user_prompt_submit(&world.hook_with_text("sess-end", "fix auth"))
        .unwrap();
    let agent_id = prompt.agent_id;

    // Content only the transcript knows about.
    world.transcript.append_user("fix auth");
    world
        .transcript
        .append_assistant("Committed to branch fix/auth-refresh.");

    let end = world
        .runtime
        .ingest_session_end(&world.hook("sess-end"))
        .unwrap();
    assert!(end.ok);

    let db = world.runtime.core().db.lock().unwrap();
    let agent = db.get_agent(agent_id).unwrap().unwrap();
    assert!(agent.ended_at.is_some());

    let tasks = db.tasks_for_agent(agent_id).unwrap();
    assert!(tasks.iter().all(|t| t.state == TaskState::Complete));

    // Full reconciliation recovered the agent reply dropped by hooks.
    let turns = db.turns_for_task(tasks[0].id).unwrap();
    assert!(turns
        .iter()
        .any(|t| t.text.contains("Committed to branch")));
}

#[test]
fn user_prompt_for_unknown_session_auto_creates_agent() {
    let world = TestWorld::new();
    // No session_start ever fired for this id.
    let outcome = world
        .runtime
        .ingest_user_prompt_submit(&world.hook_with_text("sess-novel", "hello"))
        .unwrap();
    assert!(outcome.ok);

    let db = world.runtime.core().db.lock().unwrap();
    let agent = db.get_agent(outcome.agent_id).unwrap().unwrap();
    assert_eq!(agent.external_session_id.as_deref(), Some("sess-novel"));
}
