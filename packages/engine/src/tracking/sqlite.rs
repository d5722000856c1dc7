// packages/engine/src/tracking/sqlite.rs
//! SQLite-backed execution store
//!
//! Values and errors are stored as JSON text, timestamps as RFC 3339.
//! All access goes through one connection behind a mutex, which also makes
//! every read-check-write transition atomic.

use crate::codec::Value;
use crate::tracking::model::*;
use crate::tracking::storage::{step_not_running, transition_error, ExecutionStore};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY,
    function_ref TEXT NOT NULL,
    status TEXT NOT NULL,
    input TEXT NOT NULL,
    output TEXT,
    error TEXT,
    started_at TEXT,
    ended_at TEXT,
    created_at TEXT NOT NULL,
    trigger_context TEXT NOT NULL,
    worker_id TEXT,
    duration_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_executions_function
    ON executions(function_ref, created_at);

CREATE TABLE IF NOT EXISTS step_executions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    execution_id TEXT NOT NULL,
    parent_step_id TEXT,
    function_ref TEXT NOT NULL,
    args TEXT NOT NULL,
    result TEXT,
    error TEXT,
    status TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    depth INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_steps_execution
    ON step_executions(execution_id, seq);
"#;

const EXECUTION_COLUMNS: &str = "id, function_ref, status, input, output, error, started_at, \
     ended_at, created_at, trigger_context, worker_id, duration_ms";

const STEP_COLUMNS: &str = "id, execution_id, parent_step_id, function_ref, args, result, \
     error, status, ordinal, depth, started_at, ended_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Storage(format!("Failed to create directory: {}", e))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| EngineError::Storage(format!("Failed to open database: {}", e)))?;
        let store = Self::with_connection(conn)?;

        info!("Execution store initialized at {:?}", path);
        Ok(store)
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::Storage(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| EngineError::Storage(format!("Failed to enable WAL: {}", e)))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| EngineError::Storage(format!("Schema creation failed: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn status_of(conn: &Connection, id: &str) -> Result<ExecutionStatus> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM executions WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        status
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", id)))?
            .parse()
            .map_err(EngineError::Storage)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn opt_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value.as_ref().map(to_json).transpose()
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text)
        .map_err(|e| EngineError::Storage(format!("Corrupt stored value: {}", e)))
}

fn opt_from_json<T: serde::de::DeserializeOwned>(text: Option<String>) -> Result<Option<T>> {
    text.as_deref().map(from_json).transpose()
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EngineError::Storage(format!("Corrupt timestamp '{}': {}", text, e)))
}

fn opt_time(text: Option<String>) -> Result<Option<DateTime<Utc>>> {
    text.as_deref().map(parse_time).transpose()
}

/// Raw columns of an `executions` row
struct ExecutionRow {
    id: String,
    function_ref: String,
    status: String,
    input: String,
    output: Option<String>,
    error: Option<String>,
    started_at: Option<String>,
    ended_at: Option<String>,
    created_at: String,
    trigger_context: String,
    worker_id: Option<String>,
    duration_ms: Option<i64>,
}

impl ExecutionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            function_ref: row.get(1)?,
            status: row.get(2)?,
            input: row.get(3)?,
            output: row.get(4)?,
            error: row.get(5)?,
            started_at: row.get(6)?,
            ended_at: row.get(7)?,
            created_at: row.get(8)?,
            trigger_context: row.get(9)?,
            worker_id: row.get(10)?,
            duration_ms: row.get(11)?,
        })
    }

    fn decode(self) -> Result<Execution> {
        Ok(Execution {
            id: self.id,
            function_ref: self.function_ref,
            status: self.status.parse().map_err(EngineError::Storage)?,
            input: from_json::<Value>(&self.input)?,
            output: opt_from_json(self.output)?,
            error: opt_from_json(self.error)?,
            started_at: opt_time(self.started_at)?,
            ended_at: opt_time(self.ended_at)?,
            created_at: parse_time(&self.created_at)?,
            trigger: from_json(&self.trigger_context)?,
            worker_id: self.worker_id,
            duration_ms: self.duration_ms.map(|d| d.max(0) as u64),
        })
    }
}

/// Raw columns of a `step_executions` row
struct StepRow {
    id: String,
    execution_id: String,
    parent_step_id: Option<String>,
    function_ref: String,
    args: String,
    result: Option<String>,
    error: Option<String>,
    status: String,
    ordinal: i64,
    depth: i64,
    started_at: String,
    ended_at: Option<String>,
}

impl StepRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            execution_id: row.get(1)?,
            parent_step_id: row.get(2)?,
            function_ref: row.get(3)?,
            args: row.get(4)?,
            result: row.get(5)?,
            error: row.get(6)?,
            status: row.get(7)?,
            ordinal: row.get(8)?,
            depth: row.get(9)?,
            started_at: row.get(10)?,
            ended_at: row.get(11)?,
        })
    }

    fn decode(self) -> Result<StepExecution> {
        Ok(StepExecution {
            id: self.id,
            execution_id: self.execution_id,
            parent_step_id: self.parent_step_id,
            function_ref: self.function_ref,
            args: from_json(&self.args)?,
            result: opt_from_json(self.result)?,
            error: opt_from_json(self.error)?,
            status: self.status.parse().map_err(EngineError::Storage)?,
            ordinal: self.ordinal as u32,
            depth: self.depth as u32,
            started_at: parse_time(&self.started_at)?,
            ended_at: opt_time(self.ended_at)?,
        })
    }
}

impl ExecutionStore for SqliteStore {
    fn insert_execution(&self, execution: &Execution) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO executions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                EXECUTION_COLUMNS
            ),
            params![
                execution.id,
                execution.function_ref,
                execution.status.as_str(),
                to_json(&execution.input)?,
                opt_json(&execution.output)?,
                opt_json(&execution.error)?,
                execution.started_at.map(|t| t.to_rfc3339()),
                execution.ended_at.map(|t| t.to_rfc3339()),
                execution.created_at.to_rfc3339(),
                to_json(&execution.trigger)?,
                execution.worker_id,
                execution.duration_ms.map(|d| d as i64),
            ],
        )
        .map_err(|e| EngineError::Storage(format!("Failed to insert execution: {}", e)))?;
        Ok(())
    }

    fn mark_running(&self, id: &str, started_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        let status = Self::status_of(&conn, id)?;
        if !status.can_transition_to(ExecutionStatus::Running) {
            return Err(transition_error(id, status, ExecutionStatus::Running));
        }

        conn.execute(
            "UPDATE executions SET status = ?, started_at = ? WHERE id = ?",
            params![ExecutionStatus::Running.as_str(), started_at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    fn set_worker(&self, id: &str, worker_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE executions SET worker_id = ? WHERE id = ?",
            params![worker_id, id],
        )?;
        if updated == 0 {
            return Err(EngineError::NotFound(format!("execution {}", id)));
        }
        Ok(())
    }

    fn complete_execution(&self, id: &str, completion: &Completion) -> Result<()> {
        let conn = self.conn.lock();
        let status = Self::status_of(&conn, id)?;
        if !status.can_transition_to(completion.status) {
            return Err(transition_error(id, status, completion.status));
        }

        conn.execute(
            "UPDATE executions SET status = ?, output = ?, error = ?, ended_at = ?, duration_ms = ? \
             WHERE id = ?",
            params![
                completion.status.as_str(),
                opt_json(&completion.output)?,
                opt_json(&completion.error)?,
                completion.ended_at.to_rfc3339(),
                completion.duration_ms.map(|d| d as i64),
                id,
            ],
        )?;
        Ok(())
    }

    fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM executions WHERE id = ?", EXECUTION_COLUMNS),
                params![id],
                ExecutionRow::read,
            )
            .optional()?;
        row.map(ExecutionRow::decode).transpose()
    }

    fn list_executions(&self, function_ref: Option<&str>, limit: usize) -> Result<Vec<Execution>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM executions WHERE (?1 IS NULL OR function_ref = ?1) \
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
                EXECUTION_COLUMNS
            ))
            .map_err(|e| EngineError::Storage(format!("Query preparation failed: {}", e)))?;

        let rows = stmt
            .query_map(params![function_ref, limit as i64], ExecutionRow::read)
            .map_err(|e| EngineError::Storage(format!("Query execution failed: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EngineError::Storage(format!("Result collection failed: {}", e)))?;

        rows.into_iter().map(ExecutionRow::decode).collect()
    }

    fn insert_step(&self, step: &StepExecution) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO step_executions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                STEP_COLUMNS
            ),
            params![
                step.id,
                step.execution_id,
                step.parent_step_id,
                step.function_ref,
                to_json(&step.args)?,
                opt_json(&step.result)?,
                opt_json(&step.error)?,
                step.status.as_str(),
                step.ordinal as i64,
                step.depth as i64,
                step.started_at.to_rfc3339(),
                step.ended_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| EngineError::Storage(format!("Failed to insert step: {}", e)))?;
        Ok(())
    }

    fn finish_step(
        &self,
        execution_id: &str,
        step_id: &str,
        outcome: &StepOutcome,
        ended_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM step_executions WHERE id = ? AND execution_id = ?",
                    STEP_COLUMNS
                ),
                params![step_id, execution_id],
                StepRow::read,
            )
            .optional()?
            .ok_or_else(|| EngineError::NotFound(format!("step {}", step_id)))?;

        let mut step = row.decode()?;
        if step.status != StepStatus::Running {
            return Err(step_not_running(step_id, step.status));
        }
        outcome.apply(&mut step, ended_at);

        conn.execute(
            "UPDATE step_executions SET status = ?, result = ?, error = ?, ended_at = ? WHERE id = ?",
            params![
                step.status.as_str(),
                opt_json(&step.result)?,
                opt_json(&step.error)?,
                ended_at.to_rfc3339(),
                step_id,
            ],
        )?;
        Ok(())
    }

    fn steps(&self, execution_id: &str) -> Result<Vec<StepExecution>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM step_executions WHERE execution_id = ? ORDER BY seq",
                STEP_COLUMNS
            ))
            .map_err(|e| EngineError::Storage(format!("Query preparation failed: {}", e)))?;

        let rows = stmt
            .query_map(params![execution_id], StepRow::read)
            .map_err(|e| EngineError::Storage(format!("Query execution failed: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EngineError::Storage(format!("Result collection failed: {}", e)))?;

        rows.into_iter().map(StepRow::decode).collect()
    }

    fn delete_steps(&self, execution_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM step_executions WHERE execution_id = ?",
            params![execution_id],
        )?)
    }
}
