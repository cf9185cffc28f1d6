//! Database schema.
//!
//! Ownership cascades downward: deleting a project deletes its agents,
//! tasks, and turns. Events reference entities with SET NULL so the audit
//! trail outlives the rows it describes. Timestamps are RFC 3339 text with
//! fixed microsecond precision so lexicographic order equals time order.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    slug TEXT NOT NULL UNIQUE,
    path TEXT NOT NULL UNIQUE,
    repo_url TEXT,
    description TEXT,
    paused INTEGER NOT NULL DEFAULT 0,
    paused_at TEXT,
    paused_reason TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agents (
    id INTEGER PRIMARY KEY,
    session_uuid TEXT NOT NULL UNIQUE,
    external_session_id TEXT,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    pane_id TEXT,
    transcript_path TEXT,
    started_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    ended_at TEXT,
    priority_score INTEGER,
    priority_reason TEXT
);

CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY,
    agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
    state TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    full_command TEXT,
    full_output TEXT,
    instruction TEXT,
    instruction_generated_at TEXT,
    completion_summary TEXT,
    completion_summary_generated_at TEXT
);

CREATE TABLE IF NOT EXISTS turns (
    id INTEGER PRIMARY KEY,
    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    actor TEXT NOT NULL,
    intent TEXT NOT NULL,
    text TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    timestamp_source TEXT NOT NULL,
    content_hash TEXT,
    answers_turn_id INTEGER REFERENCES turns(id) ON DELETE SET NULL,
    question_json TEXT,
    file_meta_json TEXT,
    is_internal INTEGER NOT NULL DEFAULT 0,
    summary TEXT,
    summary_generated_at TEXT
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY,
    timestamp TEXT NOT NULL,
    project_id INTEGER REFERENCES projects(id) ON DELETE SET NULL,
    agent_id INTEGER REFERENCES agents(id) ON DELETE SET NULL,
    task_id INTEGER REFERENCES tasks(id) ON DELETE SET NULL,
    turn_id INTEGER REFERENCES turns(id) ON DELETE SET NULL,
    event_type TEXT NOT NULL,
    payload TEXT
);

CREATE INDEX IF NOT EXISTS idx_agents_project ON agents(project_id, last_seen_at DESC);
CREATE INDEX IF NOT EXISTS idx_agents_external ON agents(external_session_id);
CREATE INDEX IF NOT EXISTS idx_tasks_agent_state ON tasks(agent_id, state);
CREATE INDEX IF NOT EXISTS idx_tasks_agent_started ON tasks(agent_id, started_at DESC);
CREATE INDEX IF NOT EXISTS idx_turns_task_ts ON turns(task_id, timestamp, id);
CREATE INDEX IF NOT EXISTS idx_turns_hash ON turns(content_hash);
CREATE INDEX IF NOT EXISTS idx_events_agent_ts ON events(agent_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_type_ts ON events(event_type, timestamp);
"#;
