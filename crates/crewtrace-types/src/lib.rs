//! Core domain types for crewtrace.
//!
//! Entities (Project, Agent, Task, Turn, EventRecord), the task state
//! machine, content hashing for turn dedup, and the team-internal content
//! detector. This crate holds schemas and pure functions only, no I/O.

pub mod internal;
pub mod model;
pub mod state_machine;
pub mod util;

pub use internal::is_team_internal_content;
pub use model::event_type;
pub use model::{
    Agent, EventRecord, FileMeta, Project, QuestionPayload, QuestionSource, Task, TaskState,
    TimestampSource, TransitionPayload, Turn, TurnActor, TurnIntent,
};
pub use state_machine::{is_terminal_state, valid_transitions_from, validate_transition, TransitionResult};
pub use util::{content_hash, generate_slug, legacy_content_hash};
