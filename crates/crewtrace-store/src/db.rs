use crate::error::{Error, Result};
use crate::records::{NewAgent, NewEvent, NewTurn};
use crate::schema::SCHEMA;
use chrono::{DateTime, SecondsFormat, Utc};
use crewtrace_types::{
    Agent, EventRecord, FileMeta, Project, QuestionPayload, Task, TaskState, TimestampSource,
    Turn, TurnActor, TurnIntent,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use uuid::Uuid;

// NOTE: Store Design Rationale
//
// Why a single shared connection (behind the runtime's Mutex)?
// - SQLite is the embedded realization of the "transactional store"
//   contract; one writer connection sidesteps writer-lock churn
// - Per-agent serialization is the LockManager's job, not the pool's
// - Keeps transactions explicit: BEGIN IMMEDIATE scope + guaranteed
//   rollback on early exit
//
// Why RFC 3339 text timestamps at fixed microsecond width?
// - Lexicographic order == chronological order, so ordered scans are
//   plain ORDER BY on the text column
// - Round-trips through chrono without a custom codec

fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts_to_sql(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref().map(ts_to_sql)
}

fn conversion_err(what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("bad {}: {}", what, value).into(),
    )
}

fn ts_from_sql(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| conversion_err("timestamp", value))
}

fn opt_ts_from_sql(value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match value {
        Some(s) => Ok(Some(ts_from_sql(&s)?)),
        None => Ok(None),
    }
}

fn project_from_row(row: &Row) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        path: row.get(3)?,
        repo_url: row.get(4)?,
        description: row.get(5)?,
        paused: row.get(6)?,
        paused_at: opt_ts_from_sql(row.get(7)?)?,
        paused_reason: row.get(8)?,
        created_at: ts_from_sql(&row.get::<_, String>(9)?)?,
    })
}

const PROJECT_COLS: &str =
    "id, name, slug, path, repo_url, description, paused, paused_at, paused_reason, created_at";

fn agent_from_row(row: &Row) -> rusqlite::Result<Agent> {
    let uuid_text: String = row.get(1)?;
    Ok(Agent {
        id: row.get(0)?,
        session_uuid: Uuid::parse_str(&uuid_text)
            .map_err(|_| conversion_err("session_uuid", &uuid_text))?,
        external_session_id: row.get(2)?,
        project_id: row.get(3)?,
        pane_id: row.get(4)?,
        transcript_path: row.get(5)?,
        started_at: ts_from_sql(&row.get::<_, String>(6)?)?,
        last_seen_at: ts_from_sql(&row.get::<_, String>(7)?)?,
        ended_at: opt_ts_from_sql(row.get(8)?)?,
        priority_score: row.get(9)?,
        priority_reason: row.get(10)?,
    })
}

const AGENT_COLS: &str = "id, session_uuid, external_session_id, project_id, pane_id, \
     transcript_path, started_at, last_seen_at, ended_at, priority_score, priority_reason";

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    let state_text: String = row.get(2)?;
    Ok(Task {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        state: TaskState::parse(&state_text).ok_or_else(|| conversion_err("state", &state_text))?,
        started_at: ts_from_sql(&row.get::<_, String>(3)?)?,
        completed_at: opt_ts_from_sql(row.get(4)?)?,
        full_command: row.get(5)?,
        full_output: row.get(6)?,
        instruction: row.get(7)?,
        instruction_generated_at: opt_ts_from_sql(row.get(8)?)?,
        completion_summary: row.get(9)?,
        completion_summary_generated_at: opt_ts_from_sql(row.get(10)?)?,
    })
}

const TASK_COLS: &str = "id, agent_id, state, started_at, completed_at, full_command, \
     full_output, instruction, instruction_generated_at, completion_summary, \
     completion_summary_generated_at";

fn turn_from_row(row: &Row) -> rusqlite::Result<Turn> {
    let actor_text: String = row.get(2)?;
    let intent_text: String = row.get(3)?;
    let source_text: String = row.get(6)?;
    let question_json: Option<String> = row.get(9)?;
    let file_meta_json: Option<String> = row.get(10)?;

    let question = match question_json {
        Some(json) => Some(
            serde_json::from_str::<QuestionPayload>(&json)
                .map_err(|_| conversion_err("question_json", &json))?,
        ),
        None => None,
    };
    let file_meta = match file_meta_json {
        Some(json) => Some(
            serde_json::from_str::<FileMeta>(&json)
                .map_err(|_| conversion_err("file_meta_json", &json))?,
        ),
        None => None,
    };

    Ok(Turn {
        id: row.get(0)?,
        task_id: row.get(1)?,
        actor: TurnActor::parse(&actor_text)
            .ok_or_else(|| conversion_err("actor", &actor_text))?,
        intent: TurnIntent::parse(&intent_text)
            .ok_or_else(|| conversion_err("intent", &intent_text))?,
        text: row.get(4)?,
        timestamp: ts_from_sql(&row.get::<_, String>(5)?)?,
        timestamp_source: TimestampSource::parse(&source_text)
            .ok_or_else(|| conversion_err("timestamp_source", &source_text))?,
        content_hash: row.get(7)?,
        answers_turn_id: row.get(8)?,
        question,
        file_meta,
        is_internal: row.get(11)?,
        summary: row.get(12)?,
        summary_generated_at: opt_ts_from_sql(row.get(13)?)?,
    })
}

const TURN_COLS: &str = "id, task_id, actor, intent, text, timestamp, timestamp_source, \
     content_hash, answers_turn_id, question_json, file_meta_json, is_internal, summary, \
     summary_generated_at";

fn event_from_row(row: &Row) -> rusqlite::Result<EventRecord> {
    let payload_json: Option<String> = row.get(7)?;
    let payload = match payload_json {
        Some(json) => Some(
            serde_json::from_str(&json).map_err(|_| conversion_err("event payload", &json))?,
        ),
        None => None,
    };
    Ok(EventRecord {
        id: row.get(0)?,
        timestamp: ts_from_sql(&row.get::<_, String>(1)?)?,
        project_id: row.get(2)?,
        agent_id: row.get(3)?,
        task_id: row.get(4)?,
        turn_id: row.get(5)?,
        event_type: row.get(6)?,
        payload,
    })
}

const EVENT_COLS: &str =
    "id, timestamp, project_id, agent_id, task_id, turn_id, event_type, payload";

/// Explicit transaction scope. Commit consumes the scope; dropping an
/// uncommitted scope rolls back.
pub struct TransactionScope<'a> {
    conn: &'a Connection,
    committed: bool,
}

impl<'a> TransactionScope<'a> {
    pub fn commit(mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Begin an immediate (write) transaction covering a sequence of row
    /// mutations produced by one hook invocation.
    pub fn begin(&self) -> Result<TransactionScope<'_>> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(TransactionScope {
            conn: &self.conn,
            committed: false,
        })
    }

    // ── Projects ─────────────────────────────────────────────────────

    /// Create a project, deriving a unique slug from the name (numeric
    /// suffix on collision).
    pub fn create_project(&self, name: &str, path: &str) -> Result<Project> {
        let base_slug = crewtrace_types::generate_slug(name);
        let mut slug = base_slug.clone();
        let mut suffix = 2;
        while self.get_project_by_slug(&slug)?.is_some() {
            slug = format!("{}-{}", base_slug, suffix);
            suffix += 1;
        }

        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO projects (name, slug, path, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, slug, path, ts_to_sql(&now)],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?
            .ok_or_else(|| Error::NotFound(format!("project {}", id)))
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let result = self
            .conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLS),
                [id],
                project_from_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn get_project_by_path(&self, path: &str) -> Result<Option<Project>> {
        let result = self
            .conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE path = ?1", PROJECT_COLS),
                [path],
                project_from_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn get_project_by_slug(&self, slug: &str) -> Result<Option<Project>> {
        let result = self
            .conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE slug = ?1", PROJECT_COLS),
                [slug],
                project_from_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM projects ORDER BY name", PROJECT_COLS))?;
        let projects = stmt
            .query_map([], project_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(projects)
    }

    pub fn update_project(
        &self,
        id: i64,
        name: Option<&str>,
        description: Option<&str>,
        repo_url: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE projects SET name = COALESCE(?2, name), \
             description = COALESCE(?3, description), repo_url = COALESCE(?4, repo_url) \
             WHERE id = ?1",
            params![id, name, description, repo_url],
        )?;
        Ok(())
    }

    pub fn set_project_paused(
        &self,
        id: i64,
        paused: bool,
        at: Option<DateTime<Utc>>,
        reason: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE projects SET paused = ?2, paused_at = ?3, paused_reason = ?4 WHERE id = ?1",
            params![id, paused, opt_ts_to_sql(&at), reason],
        )?;
        Ok(())
    }

    /// Delete a project. Agents, tasks, and turns cascade; events keep
    /// their rows with nulled foreign keys.
    pub fn delete_project(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM projects WHERE id = ?1", [id])?;
        Ok(())
    }

    // ── Agents ───────────────────────────────────────────────────────

    pub fn create_agent(&self, new: &NewAgent) -> Result<Agent> {
        self.conn.execute(
            "INSERT INTO agents (session_uuid, external_session_id, project_id, pane_id, \
             transcript_path, started_at, last_seen_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                new.session_uuid.to_string(),
                new.external_session_id,
                new.project_id,
                new.pane_id,
                new.transcript_path,
                ts_to_sql(&new.started_at),
                ts_to_sql(&new.last_seen_at),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_agent(id)?
            .ok_or_else(|| Error::NotFound(format!("agent {}", id)))
    }

    pub fn get_agent(&self, id: i64) -> Result<Option<Agent>> {
        let result = self
            .conn
            .query_row(
                &format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLS),
                [id],
                agent_from_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn find_agent_by_external_session(&self, external_id: &str) -> Result<Option<Agent>> {
        let result = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM agents WHERE external_session_id = ?1 \
                     ORDER BY id DESC LIMIT 1",
                    AGENT_COLS
                ),
                [external_id],
                agent_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Most recently seen agent of a project.
    pub fn latest_agent_for_project(&self, project_id: i64) -> Result<Option<Agent>> {
        let result = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM agents WHERE project_id = ?1 \
                     ORDER BY last_seen_at DESC, id DESC LIMIT 1",
                    AGENT_COLS
                ),
                [project_id],
                agent_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Agents with no ended_at.
    pub fn list_live_agents(&self) -> Result<Vec<Agent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM agents WHERE ended_at IS NULL ORDER BY id",
            AGENT_COLS
        ))?;
        let agents = stmt
            .query_map([], agent_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(agents)
    }

    /// Live agents seen since the cutoff.
    pub fn list_active_agents(&self, seen_since: DateTime<Utc>) -> Result<Vec<Agent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM agents WHERE ended_at IS NULL AND last_seen_at >= ?1 \
             ORDER BY last_seen_at DESC",
            AGENT_COLS
        ))?;
        let agents = stmt
            .query_map([ts_to_sql(&seen_since)], agent_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(agents)
    }

    pub fn touch_agent(&self, id: i64, seen_at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE agents SET last_seen_at = ?2 WHERE id = ?1",
            params![id, ts_to_sql(&seen_at)],
        )?;
        Ok(())
    }

    /// Mark an agent ended. Monotone: an already-ended agent keeps its
    /// original ended_at.
    pub fn set_agent_ended(&self, id: i64, ended_at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE agents SET ended_at = COALESCE(ended_at, ?2), last_seen_at = ?2 \
             WHERE id = ?1",
            params![id, ts_to_sql(&ended_at)],
        )?;
        Ok(())
    }

    pub fn set_agent_transcript_path(&self, id: i64, path: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE agents SET transcript_path = ?2 WHERE id = ?1",
            params![id, path],
        )?;
        Ok(())
    }

    pub fn set_agent_pane(&self, id: i64, pane_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE agents SET pane_id = ?2 WHERE id = ?1",
            params![id, pane_id],
        )?;
        Ok(())
    }

    pub fn set_agent_external_session(&self, id: i64, external_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE agents SET external_session_id = ?2 WHERE id = ?1",
            params![id, external_id],
        )?;
        Ok(())
    }

    pub fn set_agent_priority(&self, id: i64, score: i64, reason: Option<&str>) -> Result<()> {
        self.conn.execute(
            "UPDATE agents SET priority_score = ?2, priority_reason = ?3 WHERE id = ?1",
            params![id, score, reason],
        )?;
        Ok(())
    }

    // ── Tasks ────────────────────────────────────────────────────────

    pub fn create_task(
        &self,
        agent_id: i64,
        state: TaskState,
        started_at: DateTime<Utc>,
    ) -> Result<Task> {
        self.conn.execute(
            "INSERT INTO tasks (agent_id, state, started_at) VALUES (?1, ?2, ?3)",
            params![agent_id, state.as_str(), ts_to_sql(&started_at)],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_task(id)?
            .ok_or_else(|| Error::NotFound(format!("task {}", id)))
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let result = self
            .conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLS),
                [id],
                task_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// The current task: most recent non-COMPLETE task for the agent.
    pub fn current_task(&self, agent_id: i64) -> Result<Option<Task>> {
        let result = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM tasks WHERE agent_id = ?1 AND state != 'complete' \
                     ORDER BY started_at DESC, id DESC LIMIT 1",
                    TASK_COLS
                ),
                [agent_id],
                task_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// All tasks of an agent by started_at ascending.
    pub fn tasks_for_agent(&self, agent_id: i64) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE agent_id = ?1 ORDER BY started_at ASC, id ASC",
            TASK_COLS
        ))?;
        let tasks = stmt
            .query_map([agent_id], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// All tasks of an agent, most recent first (card projection order).
    pub fn tasks_for_agent_desc(&self, agent_id: i64) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE agent_id = ?1 ORDER BY started_at DESC, id DESC",
            TASK_COLS
        ))?;
        let tasks = stmt
            .query_map([agent_id], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Orphan candidates for the reaper: neither COMPLETE nor IDLE.
    pub fn open_tasks_for_agent(&self, agent_id: i64) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE agent_id = ?1 \
             AND state NOT IN ('complete', 'idle') ORDER BY id DESC",
            TASK_COLS
        ))?;
        let tasks = stmt
            .query_map([agent_id], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    pub fn set_task_state(&self, id: i64, state: TaskState) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET state = ?2 WHERE id = ?1",
            params![id, state.as_str()],
        )?;
        Ok(())
    }

    pub fn set_task_completed(&self, id: i64, completed_at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET state = 'complete', completed_at = ?2 WHERE id = ?1",
            params![id, ts_to_sql(&completed_at)],
        )?;
        Ok(())
    }

    pub fn set_task_full_command(&self, id: i64, text: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET full_command = ?2 WHERE id = ?1",
            params![id, text],
        )?;
        Ok(())
    }

    pub fn set_task_full_output(&self, id: i64, text: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET full_output = ?2 WHERE id = ?1",
            params![id, text],
        )?;
        Ok(())
    }

    pub fn set_task_instruction(
        &self,
        id: i64,
        text: &str,
        generated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET instruction = ?2, instruction_generated_at = ?3 WHERE id = ?1",
            params![id, text, ts_to_sql(&generated_at)],
        )?;
        Ok(())
    }

    pub fn set_task_completion_summary(
        &self,
        id: i64,
        text: &str,
        generated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET completion_summary = ?2, completion_summary_generated_at = ?3 \
             WHERE id = ?1",
            params![id, text, ts_to_sql(&generated_at)],
        )?;
        Ok(())
    }

    // ── Turns ────────────────────────────────────────────────────────

    pub fn create_turn(&self, new: &NewTurn) -> Result<Turn> {
        let question_json = match &new.question {
            Some(q) => Some(
                serde_json::to_string(q).map_err(|e| Error::Corrupt(e.to_string()))?,
            ),
            None => None,
        };
        let file_meta_json = match &new.file_meta {
            Some(m) => Some(
                serde_json::to_string(m).map_err(|e| Error::Corrupt(e.to_string()))?,
            ),
            None => None,
        };

        self.conn.execute(
            "INSERT INTO turns (task_id, actor, intent, text, timestamp, timestamp_source, \
             content_hash, answers_turn_id, question_json, file_meta_json, is_internal) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                new.task_id,
                new.actor.as_str(),
                new.intent.as_str(),
                new.text,
                ts_to_sql(&new.timestamp),
                new.timestamp_source.as_str(),
                new.content_hash,
                new.answers_turn_id,
                question_json,
                file_meta_json,
                new.is_internal,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_turn(id)?
            .ok_or_else(|| Error::NotFound(format!("turn {}", id)))
    }

    pub fn get_turn(&self, id: i64) -> Result<Option<Turn>> {
        let result = self
            .conn
            .query_row(
                &format!("SELECT {} FROM turns WHERE id = ?1", TURN_COLS),
                [id],
                turn_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Canonical order within a task: (timestamp, id) ascending.
    pub fn turns_for_task(&self, task_id: i64) -> Result<Vec<Turn>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM turns WHERE task_id = ?1 ORDER BY timestamp ASC, id ASC",
            TURN_COLS
        ))?;
        let turns = stmt
            .query_map([task_id], turn_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(turns)
    }

    /// Turns of a task stamped at or after the cutoff (reconciler match
    /// window).
    pub fn recent_turns_for_task(
        &self,
        task_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Turn>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM turns WHERE task_id = ?1 AND timestamp >= ?2 \
             ORDER BY timestamp ASC, id ASC",
            TURN_COLS
        ))?;
        let turns = stmt
            .query_map(params![task_id, ts_to_sql(&cutoff)], turn_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(turns)
    }

    /// Recent agent-authored turns across all of an agent's tasks
    /// (watchdog overlap check).
    pub fn recent_agent_turns(
        &self,
        agent_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Turn>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM turns t WHERE t.actor = 'agent' AND t.timestamp >= ?2 \
             AND t.task_id IN (SELECT id FROM tasks WHERE agent_id = ?1) \
             ORDER BY t.timestamp ASC, t.id ASC",
            turn_cols_qualified()
        ))?;
        let turns = stmt
            .query_map(params![agent_id, ts_to_sql(&cutoff)], turn_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(turns)
    }

    /// Every turn of every task the agent owns (full-session
    /// reconciliation).
    pub fn turns_for_agent(&self, agent_id: i64) -> Result<Vec<Turn>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM turns t \
             WHERE t.task_id IN (SELECT id FROM tasks WHERE agent_id = ?1) \
             ORDER BY t.timestamp ASC, t.id ASC",
            turn_cols_qualified()
        ))?;
        let turns = stmt
            .query_map([agent_id], turn_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(turns)
    }

    /// Page of an agent's turns for transcript reads: newest first,
    /// strictly before `before_turn_id` when given, internal turns
    /// excluded unless requested.
    pub fn turn_page_for_agent(
        &self,
        agent_id: i64,
        before_turn_id: Option<i64>,
        limit: usize,
        include_internal: bool,
    ) -> Result<Vec<Turn>> {
        let before = before_turn_id.unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM turns t \
             WHERE t.task_id IN (SELECT id FROM tasks WHERE agent_id = ?1) \
             AND t.id < ?2 AND (?3 OR t.is_internal = 0) \
             ORDER BY t.timestamp DESC, t.id DESC LIMIT ?4",
            turn_cols_qualified()
        ))?;
        let mut turns = stmt
            .query_map(
                params![agent_id, before, include_internal, limit as i64],
                turn_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        turns.reverse();
        Ok(turns)
    }

    pub fn user_turn_count(&self, task_id: i64) -> Result<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM turns WHERE task_id = ?1 AND actor = 'user'",
            [task_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn set_turn_timestamp(
        &self,
        id: i64,
        timestamp: DateTime<Utc>,
        source: TimestampSource,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE turns SET timestamp = ?2, timestamp_source = ?3 WHERE id = ?1",
            params![id, ts_to_sql(&timestamp), source.as_str()],
        )?;
        Ok(())
    }

    pub fn set_turn_hash(&self, id: i64, content_hash: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE turns SET content_hash = ?2 WHERE id = ?1",
            params![id, content_hash],
        )?;
        Ok(())
    }

    /// In-place upgrade of a placeholder turn (text, intent, and question
    /// payload together).
    pub fn upgrade_turn(
        &self,
        id: i64,
        text: &str,
        intent: TurnIntent,
        question: Option<&QuestionPayload>,
    ) -> Result<()> {
        let question_json = match question {
            Some(q) => Some(
                serde_json::to_string(q).map_err(|e| Error::Corrupt(e.to_string()))?,
            ),
            None => None,
        };
        self.conn.execute(
            "UPDATE turns SET text = ?2, intent = ?3, question_json = ?4 WHERE id = ?1",
            params![id, text, intent.as_str(), question_json],
        )?;
        Ok(())
    }

    pub fn set_turn_summary(
        &self,
        id: i64,
        summary: &str,
        generated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE turns SET summary = ?2, summary_generated_at = ?3 WHERE id = ?1",
            params![id, summary, ts_to_sql(&generated_at)],
        )?;
        Ok(())
    }

    // ── Events ───────────────────────────────────────────────────────

    pub fn record_event(&self, new: &NewEvent) -> Result<i64> {
        let payload_json = match &new.payload {
            Some(p) => Some(
                serde_json::to_string(p).map_err(|e| Error::Corrupt(e.to_string()))?,
            ),
            None => None,
        };
        self.conn.execute(
            "INSERT INTO events (timestamp, project_id, agent_id, task_id, turn_id, \
             event_type, payload) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                ts_to_sql(&new.timestamp),
                new.project_id,
                new.agent_id,
                new.task_id,
                new.turn_id,
                new.event_type,
                payload_json,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn events_for_agent(&self, agent_id: i64) -> Result<Vec<EventRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM events WHERE agent_id = ?1 ORDER BY id ASC",
            EVENT_COLS
        ))?;
        let events = stmt
            .query_map([agent_id], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    pub fn count_events(&self, event_type: &str) -> Result<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE event_type = ?1",
            [event_type],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn turn_cols_qualified() -> String {
    TURN_COLS
        .split(", ")
        .map(|c| format!("t.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_agent(project_id: i64) -> NewAgent {
        NewAgent {
            session_uuid: Uuid::new_v4(),
            external_session_id: Some("sess-abc".to_string()),
            project_id,
            pane_id: None,
            transcript_path: None,
            started_at: Utc::now(),
            last_seen_at: Utc::now(),
        }
    }

    #[test]
    fn test_schema_initialization() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.list_projects().unwrap().len(), 0);
    }

    #[test]
    fn test_project_slug_collisions_get_suffixes() {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_project("My App", "/code/a").unwrap();
        let b = db.create_project("My App", "/code/b").unwrap();
        let c = db.create_project("My App", "/code/c").unwrap();
        assert_eq!(a.slug, "my-app");
        assert_eq!(b.slug, "my-app-2");
        assert_eq!(c.slug, "my-app-3");
    }

    #[test]
    fn test_project_mutable_fields() {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("api", "/api").unwrap();

        db.update_project(
            project.id,
            Some("api-server"),
            Some("the billing API"),
            Some("git@example.com:team/api.git"),
        )
        .unwrap();
        let paused_at = Utc::now();
        db.set_project_paused(project.id, true, Some(paused_at), Some("migration freeze"))
            .unwrap();

        let reloaded = db.get_project(project.id).unwrap().unwrap();
        assert_eq!(reloaded.name, "api-server");
        assert_eq!(reloaded.description.as_deref(), Some("the billing API"));
        assert!(reloaded.paused);
        assert_eq!(reloaded.paused_reason.as_deref(), Some("migration freeze"));
        // Identity fields are untouched.
        assert_eq!(reloaded.slug, "api");
        assert_eq!(reloaded.path, "/api");

        db.set_project_paused(project.id, false, None, None).unwrap();
        assert!(!db.get_project(project.id).unwrap().unwrap().paused);
    }

    #[test]
    fn test_duplicate_project_path_is_constraint_violation() {
        let db = Database::open_in_memory().unwrap();
        db.create_project("a", "/same/path").unwrap();
        let err = db.create_project("b", "/same/path").unwrap_err();
        assert!(matches!(err, Error::ConstraintViolated(_)));
    }

    #[test]
    fn test_agent_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("p", "/p").unwrap();
        let agent = db.create_agent(&new_agent(project.id)).unwrap();

        let found = db
            .find_agent_by_external_session("sess-abc")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, agent.id);
        assert_eq!(found.project_id, project.id);
        assert!(found.is_live());
    }

    #[test]
    fn test_agent_ended_is_monotone() {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("p", "/p").unwrap();
        let agent = db.create_agent(&new_agent(project.id)).unwrap();

        let first = Utc::now();
        db.set_agent_ended(agent.id, first).unwrap();
        db.set_agent_ended(agent.id, first + Duration::minutes(5))
            .unwrap();

        let reloaded = db.get_agent(agent.id).unwrap().unwrap();
        let delta = (reloaded.ended_at.unwrap() - first).num_milliseconds().abs();
        assert!(delta < 10, "ended_at moved after being set");
    }

    #[test]
    fn test_current_task_is_most_recent_incomplete() {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("p", "/p").unwrap();
        let agent = db.create_agent(&new_agent(project.id)).unwrap();

        let now = Utc::now();
        let old = db
            .create_task(agent.id, TaskState::Complete, now - Duration::minutes(10))
            .unwrap();
        let current = db
            .create_task(agent.id, TaskState::Processing, now)
            .unwrap();

        let found = db.current_task(agent.id).unwrap().unwrap();
        assert_eq!(found.id, current.id);
        assert_ne!(found.id, old.id);

        db.set_task_completed(current.id, now).unwrap();
        assert!(db.current_task(agent.id).unwrap().is_none());
    }

    #[test]
    fn test_turn_ordering_by_timestamp_then_id() {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("p", "/p").unwrap();
        let agent = db.create_agent(&new_agent(project.id)).unwrap();
        let task = db
            .create_task(agent.id, TaskState::Processing, Utc::now())
            .unwrap();

        let base = Utc::now();
        let mut late = NewTurn::basic(task.id, TurnActor::Agent, TurnIntent::Progress, "late");
        late.timestamp = base + Duration::seconds(10);
        let late = db.create_turn(&late).unwrap();

        let mut early = NewTurn::basic(task.id, TurnActor::User, TurnIntent::Command, "early");
        early.timestamp = base;
        let early = db.create_turn(&early).unwrap();

        let turns = db.turns_for_task(task.id).unwrap();
        assert_eq!(turns[0].id, early.id);
        assert_eq!(turns[1].id, late.id);

        // Timestamp correction re-orders.
        db.set_turn_timestamp(late.id, base - Duration::seconds(5), TimestampSource::Jsonl)
            .unwrap();
        let turns = db.turns_for_task(task.id).unwrap();
        assert_eq!(turns[0].id, late.id);
        assert_eq!(turns[0].timestamp_source, TimestampSource::Jsonl);
    }

    #[test]
    fn test_turn_question_payload_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("p", "/p").unwrap();
        let agent = db.create_agent(&new_agent(project.id)).unwrap();
        let task = db
            .create_task(agent.id, TaskState::Processing, Utc::now())
            .unwrap();

        let mut new = NewTurn::basic(task.id, TurnActor::Agent, TurnIntent::Question, "Pick one");
        new.question = Some(QuestionPayload {
            text: "Pick one".to_string(),
            options: vec!["a".to_string(), "b".to_string()],
            source: crewtrace_types::QuestionSource::ToolInput,
        });
        let turn = db.create_turn(&new).unwrap();

        let reloaded = db.get_turn(turn.id).unwrap().unwrap();
        let question = reloaded.question.unwrap();
        assert_eq!(question.options, vec!["a", "b"]);
    }

    #[test]
    fn test_turn_page_excludes_internal_by_default() {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("p", "/p").unwrap();
        let agent = db.create_agent(&new_agent(project.id)).unwrap();
        let task = db
            .create_task(agent.id, TaskState::Processing, Utc::now())
            .unwrap();

        db.create_turn(&NewTurn::basic(task.id, TurnActor::User, TurnIntent::Command, "go"))
            .unwrap();
        let mut internal = NewTurn::basic(
            task.id,
            TurnActor::Agent,
            TurnIntent::Progress,
            "{\"type\": \"idle\"}",
        );
        internal.is_internal = true;
        db.create_turn(&internal).unwrap();

        let page = db.turn_page_for_agent(agent.id, None, 10, false).unwrap();
        assert_eq!(page.len(), 1);
        let all = db.turn_page_for_agent(agent.id, None, 10, true).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_events_survive_entity_deletion() {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("p", "/p").unwrap();
        let agent = db.create_agent(&new_agent(project.id)).unwrap();

        let mut event = NewEvent::now("state_transition");
        event.project_id = Some(project.id);
        event.agent_id = Some(agent.id);
        event.payload = Some(serde_json::json!({"from_state": "idle"}));
        db.record_event(&event).unwrap();

        db.delete_project(project.id).unwrap();

        assert!(db.get_agent(agent.id).unwrap().is_none());
        assert_eq!(db.count_events("state_transition").unwrap(), 1);
    }

    #[test]
    fn test_transaction_rollback_on_drop() {
        let db = Database::open_in_memory().unwrap();
        {
            let _tx = db.begin().unwrap();
            db.create_project("doomed", "/doomed").unwrap();
            // dropped without commit
        }
        assert!(db.get_project_by_path("/doomed").unwrap().is_none());

        let tx = db.begin().unwrap();
        db.create_project("kept", "/kept").unwrap();
        tx.commit().unwrap();
        assert!(db.get_project_by_path("/kept").unwrap().is_some());
    }

    #[test]
    fn test_open_tasks_excludes_idle_and_complete() {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("p", "/p").unwrap();
        let agent = db.create_agent(&new_agent(project.id)).unwrap();

        db.create_task(agent.id, TaskState::Complete, Utc::now())
            .unwrap();
        db.create_task(agent.id, TaskState::Idle, Utc::now())
            .unwrap();
        let open = db
            .create_task(agent.id, TaskState::AwaitingInput, Utc::now())
            .unwrap();

        let found = db.open_tasks_for_agent(agent.id).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, open.id);
    }
}
