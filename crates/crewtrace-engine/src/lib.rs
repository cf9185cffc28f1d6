//! Analysis engine for crewtrace: tolerant JSONL transcript reading,
//! regex-based intent detection, and the user-visible card projection.

pub mod card;
pub mod error;
pub mod intent;
pub mod transcript;

pub use card::{build_card, effective_state, CardInputs, CardState, TIMED_OUT};
pub use error::{Error, Result};
pub use intent::{detect_agent_intent, detect_intent, detect_user_intent, IntentResult};
pub use transcript::{
    last_agent_response, read_entries_from_offset, TranscriptEntry, TranscriptRole,
};
