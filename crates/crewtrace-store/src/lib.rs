//! Persistent timeline store for crewtrace.
//!
//! A lightweight SQLite database holding the Project → Agent → Task → Turn
//! ownership chain plus the append-only audit event log, with upserts,
//! ordered range scans, and an explicit transaction scope. The per-agent
//! advisory lock manager lives here too: it serializes all semantic access
//! to an agent's timeline across threads, independent of the transaction
//! in flight.

pub mod db;
pub mod error;
pub mod lock;
pub mod records;
pub mod schema;

pub use db::{Database, TransactionScope};
pub use error::{Error, Result};
pub use lock::{HeldLock, LockError, LockGuard, LockManager, LockNamespace};
pub use records::{NewAgent, NewEvent, NewTurn};
