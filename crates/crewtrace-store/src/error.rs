use std::fmt;

/// Result type for crewtrace-store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types surfaced by the store layer.
///
/// `ConstraintViolated`, `Unavailable`, and `Deadlock` are the retryable
/// kinds callers are expected to handle; everything else indicates a bug
/// or an unusable database.
#[derive(Debug)]
pub enum Error {
    /// A uniqueness or foreign-key constraint rejected the write
    ConstraintViolated(String),

    /// The database is transiently busy; safe to retry
    Unavailable(String),

    /// Lock contention between connections; safe to retry
    Deadlock(String),

    /// The referenced row does not exist
    NotFound(String),

    /// A stored value failed to parse back into its domain type
    Corrupt(String),

    /// Any other SQLite failure
    Sqlite(rusqlite::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConstraintViolated(msg) => write!(f, "Constraint violated: {}", msg),
            Error::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
            Error::Deadlock(msg) => write!(f, "Store lock contention: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Corrupt(msg) => write!(f, "Corrupt row: {}", msg),
            Error::Sqlite(err) => write!(f, "SQLite error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Sqlite(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, ref message) = err {
            let detail = message
                .clone()
                .unwrap_or_else(|| failure.to_string());
            match failure.code {
                rusqlite::ErrorCode::ConstraintViolation => {
                    return Error::ConstraintViolated(detail)
                }
                rusqlite::ErrorCode::DatabaseBusy => return Error::Unavailable(detail),
                rusqlite::ErrorCode::DatabaseLocked => return Error::Deadlock(detail),
                _ => {}
            }
        }
        Error::Sqlite(err)
    }
}

impl Error {
    /// True for the error kinds a caller may retry after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::Deadlock(_))
    }
}
