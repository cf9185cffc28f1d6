//! Maps externally-issued session identifiers (and working directories)
//! onto Agent rows, creating projects and agents for novel sessions.
//!
//! The session-id cache is process-local with TTL eviction; the store's
//! unique-path constraint is the final authority when deployments race.

use crate::error::Result;
use chrono::Utc;
use crewtrace_store::{Database, NewAgent};
use crewtrace_types::Agent;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationMethod {
    Cached,
    ByWorkingDirectory,
    Created,
}

impl CorrelationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrelationMethod::Cached => "cached",
            CorrelationMethod::ByWorkingDirectory => "by-working-directory",
            CorrelationMethod::Created => "created",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Correlation {
    pub agent: Agent,
    pub is_new: bool,
    pub method: CorrelationMethod,
}

struct CacheEntry {
    agent_id: i64,
    cached_at: Instant,
}

pub struct SessionCorrelator {
    cache: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl SessionCorrelator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Resolve a session id to an agent. Strategy, in order: cached
    /// mapping, then most-recent agent of the project at the working
    /// directory, then create.
    pub fn correlate(
        &self,
        db: &Database,
        external_session_id: &str,
        working_directory: Option<&str>,
    ) -> Result<Correlation> {
        self.purge_stale();

        // Strategy 1: cache, then persistent external-session match.
        if let Some(agent_id) = self.cached_agent_id(external_session_id) {
            if let Some(agent) = db.get_agent(agent_id)? {
                debug!(session = external_session_id, agent_id, "correlated via cache");
                return Ok(Correlation {
                    agent,
                    is_new: false,
                    method: CorrelationMethod::Cached,
                });
            }
            self.evict(external_session_id);
        }
        if let Some(agent) = db.find_agent_by_external_session(external_session_id)? {
            self.cache_mapping(external_session_id, agent.id);
            return Ok(Correlation {
                agent,
                is_new: false,
                method: CorrelationMethod::Cached,
            });
        }

        // Strategy 2: working directory → project → most recent agent.
        if let Some(cwd) = working_directory {
            if let Some(project) = db.get_project_by_path(cwd)? {
                if let Some(agent) = db.latest_agent_for_project(project.id)? {
                    if agent.is_live() {
                        self.cache_mapping(external_session_id, agent.id);
                        db.set_agent_external_session(agent.id, external_session_id)?;
                        debug!(
                            session = external_session_id,
                            agent_id = agent.id,
                            cwd,
                            "correlated via working directory"
                        );
                        return Ok(Correlation {
                            agent,
                            is_new: false,
                            method: CorrelationMethod::ByWorkingDirectory,
                        });
                    }
                }
            }
        }

        // Strategy 3: create, auto-creating the project when needed.
        let agent = self.create_agent(db, external_session_id, working_directory)?;
        self.cache_mapping(external_session_id, agent.id);
        info!(
            session = external_session_id,
            agent_id = agent.id,
            "created agent for novel session"
        );
        Ok(Correlation {
            agent,
            is_new: true,
            method: CorrelationMethod::Created,
        })
    }

    fn create_agent(
        &self,
        db: &Database,
        external_session_id: &str,
        working_directory: Option<&str>,
    ) -> Result<Agent> {
        let project = match working_directory {
            Some(cwd) => match db.get_project_by_path(cwd)? {
                Some(project) => project,
                None => {
                    let name = Path::new(cwd)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "project".to_string());
                    db.create_project(&name, cwd)?
                }
            },
            None => {
                // Placeholder project with a unique synthetic path.
                let prefix: String = external_session_id.chars().take(8).collect();
                let path = format!("__unknown__/{}", external_session_id);
                match db.get_project_by_path(&path)? {
                    Some(project) => project,
                    None => db.create_project(&format!("unknown-{}", prefix), &path)?,
                }
            }
        };

        let now = Utc::now();
        let agent = db.create_agent(&NewAgent {
            session_uuid: Uuid::new_v4(),
            external_session_id: Some(external_session_id.to_string()),
            project_id: project.id,
            pane_id: None,
            transcript_path: None,
            started_at: now,
            last_seen_at: now,
        })?;
        Ok(agent)
    }

    pub fn cache_mapping(&self, external_session_id: &str, agent_id: i64) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            external_session_id.to_string(),
            CacheEntry {
                agent_id,
                cached_at: Instant::now(),
            },
        );
    }

    pub fn cached_agent_id(&self, external_session_id: &str) -> Option<i64> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .get(external_session_id)
            .filter(|entry| entry.cached_at.elapsed() < self.ttl)
            .map(|entry| entry.agent_id)
    }

    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn evict(&self, external_session_id: &str) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(external_session_id);
    }

    fn purge_stale(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let ttl = self.ttl;
        cache.retain(|_, entry| entry.cached_at.elapsed() < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlator() -> SessionCorrelator {
        SessionCorrelator::new(Duration::from_secs(3600))
    }

    #[test]
    fn test_novel_session_creates_project_and_agent() {
        let db = Database::open_in_memory().unwrap();
        let correlator = correlator();

        let result = correlator
            .correlate(&db, "sess-1", Some("/home/dev/api-server"))
            .unwrap();
        assert!(result.is_new);
        assert_eq!(result.method, CorrelationMethod::Created);

        let project = db.get_project(result.agent.project_id).unwrap().unwrap();
        assert_eq!(project.name, "api-server");
        assert_eq!(project.path, "/home/dev/api-server");
    }

    #[test]
    fn test_second_call_hits_cache() {
        let db = Database::open_in_memory().unwrap();
        let correlator = correlator();

        let first = correlator
            .correlate(&db, "sess-1", Some("/home/dev/api"))
            .unwrap();
        let second = correlator
            .correlate(&db, "sess-1", Some("/home/dev/api"))
            .unwrap();
        assert!(!second.is_new);
        assert_eq!(second.method, CorrelationMethod::Cached);
        assert_eq!(second.agent.id, first.agent.id);
    }

    #[test]
    fn test_new_session_in_known_directory_reuses_latest_agent() {
        let db = Database::open_in_memory().unwrap();
        let correlator = correlator();

        let first = correlator
            .correlate(&db, "sess-1", Some("/home/dev/api"))
            .unwrap();
        let second = correlator
            .correlate(&db, "sess-2", Some("/home/dev/api"))
            .unwrap();
        assert!(!second.is_new);
        assert_eq!(second.method, CorrelationMethod::ByWorkingDirectory);
        assert_eq!(second.agent.id, first.agent.id);
    }

    #[test]
    fn test_ended_agent_is_not_reused() {
        let db = Database::open_in_memory().unwrap();
        let correlator = correlator();

        let first = correlator
            .correlate(&db, "sess-1", Some("/home/dev/api"))
            .unwrap();
        db.set_agent_ended(first.agent.id, Utc::now()).unwrap();

        let second = correlator
            .correlate(&db, "sess-2", Some("/home/dev/api"))
            .unwrap();
        assert!(second.is_new);
        assert_ne!(second.agent.id, first.agent.id);
    }

    #[test]
    fn test_no_working_directory_gets_placeholder_project() {
        let db = Database::open_in_memory().unwrap();
        let correlator = correlator();

        let result = correlator.correlate(&db, "sess-xyz", None).unwrap();
        let project = db.get_project(result.agent.project_id).unwrap().unwrap();
        assert!(project.name.starts_with("unknown-"));
        assert!(project.path.starts_with("__unknown__/"));
    }

    #[test]
    fn test_expired_cache_falls_through_to_store() {
        let db = Database::open_in_memory().unwrap();
        let correlator = SessionCorrelator::new(Duration::from_millis(0));

        let first = correlator
            .correlate(&db, "sess-1", Some("/home/dev/api"))
            .unwrap();
        // Cache TTL is zero, but the persistent external-session mapping
        // still resolves to the same agent.
        let second = correlator
            .correlate(&db, "sess-1", Some("/home/dev/api"))
            .unwrap();
        assert_eq!(second.agent.id, first.agent.id);
        assert!(!second.is_new);
    }
}
