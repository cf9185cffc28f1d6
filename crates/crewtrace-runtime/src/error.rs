use crewtrace_store::LockError;
use std::fmt;

/// Result type for crewtrace-runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy surfaced by the runtime.
///
/// Retryable kinds (`LockTimeout`, `StoreUnavailable`) map to 5xx in a
/// hosting transport; `InvalidTransition` and `PayloadInvalid` map to 4xx
/// with no mutation performed. `ReentrantLock` is a programmer error.
#[derive(Debug)]
pub enum Error {
    /// The state machine rejected a proposed move; nothing was mutated
    InvalidTransition(String),

    /// Could not acquire the per-agent lock in time; safe to retry
    LockTimeout(String),

    /// The same thread tried to re-enter a held key: a bug, surfaced loudly
    ReentrantLock(String),

    /// Transcript file missing or unreadable; treated as "no new content"
    /// on tolerant paths, surfaced here when the caller required it
    TranscriptUnavailable(String),

    /// Transient store failure; rolled back, safe to retry
    StoreUnavailable(String),

    /// Ingest payload missing required fields; nothing was touched
    PayloadInvalid(String),

    /// Registration for an already-known session identifier
    DuplicateSession { agent_id: i64 },

    /// Referenced entity does not exist
    NotFound(String),

    /// Non-transient store failure
    Store(crewtrace_store::Error),

    /// Configuration error
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidTransition(msg) => write!(f, "Invalid transition: {}", msg),
            Error::LockTimeout(msg) => write!(f, "Lock timeout: {}", msg),
            Error::ReentrantLock(msg) => write!(f, "Reentrant lock: {}", msg),
            Error::TranscriptUnavailable(msg) => write!(f, "Transcript unavailable: {}", msg),
            Error::StoreUnavailable(msg) => write!(f, "Store unavailable: {}", msg),
            Error::PayloadInvalid(msg) => write!(f, "Invalid payload: {}", msg),
            Error::DuplicateSession { agent_id } => {
                write!(f, "Session already registered to agent {}", agent_id)
            }
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Store(err) => write!(f, "Store error: {}", err),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<crewtrace_store::Error> for Error {
    fn from(err: crewtrace_store::Error) -> Self {
        if err.is_retryable() {
            Error::StoreUnavailable(err.to_string())
        } else {
            Error::Store(err)
        }
    }
}

impl From<LockError> for Error {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { .. } => Error::LockTimeout(err.to_string()),
            LockError::Reentrant { .. } => Error::ReentrantLock(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl Error {
    /// Error kind tag for structured results and transport mapping.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidTransition(_) => "invalid_transition",
            Error::LockTimeout(_) => "lock_timeout",
            Error::ReentrantLock(_) => "reentrant_lock",
            Error::TranscriptUnavailable(_) => "transcript_unavailable",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::PayloadInvalid(_) => "payload_invalid",
            Error::DuplicateSession { .. } => "duplicate_session",
            Error::NotFound(_) => "not_found",
            Error::Store(_) => "store_error",
            Error::Config(_) => "config_error",
        }
    }
}
