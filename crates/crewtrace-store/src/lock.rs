//! Per-agent advisory locks.
//!
//! Serializes semantic access to an agent's timeline across threads,
//! independent of any store transaction in flight: intermediate commits
//! inside a critical section do not release the lock. A single flat
//! keyspace per namespace avoids nested-lock deadlock scenarios, and
//! thread-local reentrancy tracking turns a would-be self-deadlock into an
//! immediate error (blocking path) or a "busy" result (try path).

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Lock namespaces. Agent-timeline mutation and reconciliation use
/// distinct keys so a reconcile sweep can be skipped while a hook holds
/// the agent, and vice versa, without ever nesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockNamespace {
    Agent,
    Reconcile,
}

impl LockNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockNamespace::Agent => "agent",
            LockNamespace::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for LockNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type LockKey = (LockNamespace, i64);

#[derive(Debug)]
pub enum LockError {
    /// The lock could not be acquired within the timeout
    Timeout {
        namespace: LockNamespace,
        entity_id: i64,
        waited: Duration,
    },
    /// The calling thread already holds this key; blocking would deadlock
    Reentrant {
        namespace: LockNamespace,
        entity_id: i64,
    },
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Timeout {
                namespace,
                entity_id,
                waited,
            } => write!(
                f,
                "lock timeout: namespace={}, entity_id={}, waited={:?}",
                namespace, entity_id, waited
            ),
            LockError::Reentrant {
                namespace,
                entity_id,
            } => write!(
                f,
                "reentrant lock: namespace={}, entity_id={} already held by this thread",
                namespace, entity_id
            ),
        }
    }
}

impl std::error::Error for LockError {}

#[derive(Debug, Clone)]
struct Holder {
    thread: String,
    mode: &'static str,
    since: Instant,
}

/// Debug-probe view of one held lock.
#[derive(Debug, Clone)]
pub struct HeldLock {
    pub namespace: LockNamespace,
    pub entity_id: i64,
    pub thread: String,
    pub mode: &'static str,
    pub held_for: Duration,
}

thread_local! {
    static HELD_KEYS: RefCell<HashSet<LockKey>> = RefCell::new(HashSet::new());
}

/// Cross-thread advisory lock registry.
#[derive(Debug)]
pub struct LockManager {
    state: Mutex<HashMap<LockKey, Holder>>,
    cond: Condvar,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    /// Blocking acquire with a bounded wait. Release is guaranteed on any
    /// control-flow exit via the returned guard's Drop.
    pub fn lock(
        &self,
        namespace: LockNamespace,
        entity_id: i64,
        timeout: Duration,
    ) -> Result<LockGuard<'_>, LockError> {
        let key = (namespace, entity_id);

        if Self::thread_holds(key) {
            return Err(LockError::Reentrant {
                namespace,
                entity_id,
            });
        }

        let start = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if !state.contains_key(&key) {
                state.insert(key, self.holder_entry("blocking"));
                drop(state);
                Self::thread_add(key);
                return Ok(LockGuard { manager: self, key });
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                // A grant can race the timeout. One final check: if the
                // holder released while we were timing out, take the lock
                // rather than leaving it dangling.
                if !state.contains_key(&key) {
                    state.insert(key, self.holder_entry("blocking"));
                    drop(state);
                    Self::thread_add(key);
                    return Ok(LockGuard { manager: self, key });
                }
                return Err(LockError::Timeout {
                    namespace,
                    entity_id,
                    waited: elapsed,
                });
            }

            let remaining = timeout - elapsed;
            let (guard, _timed_out) = self
                .cond
                .wait_timeout(state, remaining)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    /// Non-blocking acquire. Returns `None` when the key is busy,
    /// including when the caller itself holds it (reentry is "busy", not
    /// an error, so sweeps simply skip).
    pub fn try_lock(&self, namespace: LockNamespace, entity_id: i64) -> Option<LockGuard<'_>> {
        let key = (namespace, entity_id);
        if Self::thread_holds(key) {
            return None;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.contains_key(&key) {
            return None;
        }
        state.insert(key, self.holder_entry("try"));
        drop(state);
        Self::thread_add(key);
        Some(LockGuard { manager: self, key })
    }

    /// Enumerate currently held locks for the debug probe.
    pub fn held_locks(&self) -> Vec<HeldLock> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut held: Vec<HeldLock> = state
            .iter()
            .map(|(key, holder)| HeldLock {
                namespace: key.0,
                entity_id: key.1,
                thread: holder.thread.clone(),
                mode: holder.mode,
                held_for: holder.since.elapsed(),
            })
            .collect();
        held.sort_by(|a, b| b.held_for.cmp(&a.held_for));
        held
    }

    fn holder_entry(&self, mode: &'static str) -> Holder {
        Holder {
            thread: std::thread::current()
                .name()
                .unwrap_or("unnamed")
                .to_string(),
            mode,
            since: Instant::now(),
        }
    }

    fn release(&self, key: LockKey) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.remove(&key);
        drop(state);
        Self::thread_remove(key);
        self.cond.notify_all();
    }

    fn thread_holds(key: LockKey) -> bool {
        HELD_KEYS.with(|held| held.borrow().contains(&key))
    }

    fn thread_add(key: LockKey) {
        HELD_KEYS.with(|held| {
            held.borrow_mut().insert(key);
        });
    }

    fn thread_remove(key: LockKey) {
        HELD_KEYS.with(|held| {
            held.borrow_mut().remove(&key);
        });
    }
}

/// Scoped lock handle; releases on drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    key: LockKey,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(self.key);
    }
}
