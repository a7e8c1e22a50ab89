use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::core::agent::state::{
    MessageRole, RunStatus, ToolCallStatus, TurnStatus, TurnStopReason,
};
use crate::core::error::LedgerError;
use crate::core::ports::store::{
    LedgerStore, MessageRecord, MessageRow, ProgressRecord, RunFinishRecord, RunHistory, RunRow,
    RunStartRecord, ToolCallFinishRecord, ToolCallOutcome, ToolCallRow, ToolCallStartRecord,
    TurnFinishRecord, TurnHistory, TurnRow, TurnStartRecord,
};


const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        agent_name TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        turns_total INTEGER NOT NULL,
        turns_completed INTEGER NOT NULL DEFAULT 0,
        input_tokens INTEGER NOT NULL DEFAULT 0,
        output_tokens INTEGER NOT NULL DEFAULT 0,
        cost_usd REAL NOT NULL DEFAULT 0,
        model TEXT NOT NULL,
        error TEXT
    );

    CREATE TABLE IF NOT EXISTS turns (
        turn_id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL,
        turn_number INTEGER NOT NULL,
        name TEXT NOT NULL,
        model TEXT NOT NULL,
        status TEXT NOT NULL,
        stop_reason TEXT,
        input_tokens INTEGER NOT NULL DEFAULT 0,
        output_tokens INTEGER NOT NULL DEFAULT 0,
        cost_usd REAL NOT NULL DEFAULT 0,
        tool_call_count INTEGER NOT NULL DEFAULT 0,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        duration_ms INTEGER,
        error TEXT,
        UNIQUE(run_id, turn_number),
        FOREIGN KEY (run_id) REFERENCES runs(run_id)
    );

    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        turn_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        input_tokens INTEGER,
        output_tokens INTEGER,
        created_at TEXT NOT NULL,
        FOREIGN KEY (turn_id) REFERENCES turns(turn_id)
    );

    CREATE TABLE IF NOT EXISTS tool_calls (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        turn_id TEXT NOT NULL,
        call_id TEXT NOT NULL,
        tool_name TEXT NOT NULL,
        input TEXT NOT NULL,
        status TEXT NOT NULL,
        output TEXT,
        error TEXT,
        duration_ms INTEGER,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        UNIQUE(run_id, call_id),
        FOREIGN KEY (turn_id) REFERENCES turns(turn_id)
    );

    CREATE INDEX IF NOT EXISTS idx_turns_run ON turns(run_id);
    CREATE INDEX IF NOT EXISTS idx_messages_turn ON messages(turn_id);
    CREATE INDEX IF NOT EXISTS idx_tool_calls_turn ON tool_calls(turn_id);
    CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);
";

/// SQLite-backed run ledger. One connection guarded by a mutex; every write
/// is a single statement keyed by run/turn/call ids.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn get_u64(row: &Row<'_>, index: usize) -> rusqlite::Result<u64> {
    Ok(row.get::<_, i64>(index)?.max(0) as u64)
}

fn get_opt_u64(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<u64>> {
    Ok(row
        .get::<_, Option<i64>>(index)?
        .map(|value| value.max(0) as u64))
}

fn parse_json_field(raw: Option<String>) -> Option<JsonValue> {
    raw.and_then(|value| serde_json::from_str(&value).ok())
}

fn decode_error(index: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        format!("unexpected enum value '{value}'").into(),
    )
}

fn elapsed_ms_since(started_at: &str) -> u64 {
    chrono::DateTime::parse_from_rfc3339(started_at)
        .map(|started| {
            let elapsed = chrono::Utc::now().signed_duration_since(started);
            elapsed.num_milliseconds().max(0) as u64
        })
        .unwrap_or(0)
}

impl SqliteLedger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| LedgerError::Directory {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn ensure_running(conn: &Connection, run_id: &str) -> Result<(), LedgerError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM runs WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()?;
    match status.as_deref().map(RunStatus::parse) {
        None => Err(LedgerError::RunNotFound(run_id.to_string())),
        Some(Some(RunStatus::Running)) => Ok(()),
        Some(_) => Err(LedgerError::RunFinalized(run_id.to_string())),
    }
}

/// A guarded UPDATE touched no row: tell "missing" apart from "already terminal".
fn explain_stale_run(conn: &Connection, run_id: &str) -> LedgerError {
    match ensure_running(conn, run_id) {
        Err(err) => err,
        Ok(()) => LedgerError::RunNotFound(run_id.to_string()),
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRow> {
    let status: String = row.get(2)?;
    Ok(RunRow {
        run_id: row.get(0)?,
        agent_name: row.get(1)?,
        status: RunStatus::parse(&status).ok_or_else(|| decode_error(2, &status))?,
        started_at: row.get(3)?,
        finished_at: row.get(4)?,
        turns_total: get_u64(row, 5)? as u32,
        turns_completed: get_u64(row, 6)? as u32,
        input_tokens: get_u64(row, 7)?,
        output_tokens: get_u64(row, 8)?,
        cost_usd: row.get(9)?,
        model: row.get(10)?,
        error: row.get(11)?,
    })
}

const RUN_COLUMNS: &str = "run_id, agent_name, status, started_at, finished_at, turns_total,
    turns_completed, input_tokens, output_tokens, cost_usd, model, error";

fn turn_from_row(row: &Row<'_>) -> rusqlite::Result<TurnRow> {
    let status: String = row.get(5)?;
    let stop_reason: Option<String> = row.get(6)?;
    Ok(TurnRow {
        turn_id: row.get(0)?,
        run_id: row.get(1)?,
        turn_number: get_u64(row, 2)? as u32,
        name: row.get(3)?,
        model: row.get(4)?,
        status: TurnStatus::parse(&status).ok_or_else(|| decode_error(5, &status))?,
        stop_reason: stop_reason.as_deref().and_then(TurnStopReason::parse),
        input_tokens: get_u64(row, 7)?,
        output_tokens: get_u64(row, 8)?,
        cost_usd: row.get(9)?,
        tool_call_count: get_u64(row, 10)? as u32,
        started_at: row.get(11)?,
        finished_at: row.get(12)?,
        duration_ms: get_opt_u64(row, 13)?,
        error: row.get(14)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    let role: String = row.get(2)?;
    Ok(MessageRow {
        id: row.get(0)?,
        turn_id: row.get(1)?,
        role: MessageRole::parse(&role).ok_or_else(|| decode_error(2, &role))?,
        content: row.get(3)?,
        input_tokens: get_opt_u64(row, 4)?,
        output_tokens: get_opt_u64(row, 5)?,
        created_at: row.get(6)?,
    })
}

fn tool_call_from_row(row: &Row<'_>) -> rusqlite::Result<ToolCallRow> {
    let input_raw: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(ToolCallRow {
        call_id: row.get(0)?,
        turn_id: row.get(1)?,
        tool_name: row.get(2)?,
        input: serde_json::from_str(&input_raw).unwrap_or(JsonValue::Null),
        status: ToolCallStatus::parse(&status).ok_or_else(|| decode_error(4, &status))?,
        output: parse_json_field(row.get(5)?),
        error: row.get(6)?,
        duration_ms: get_opt_u64(row, 7)?,
        started_at: row.get(8)?,
        finished_at: row.get(9)?,
    })
}

impl LedgerStore for SqliteLedger {
    fn start_run(&self, record: RunStartRecord<'_>) -> Result<(), LedgerError> {
        self.conn().execute(
            "INSERT INTO runs (run_id, agent_name, status, started_at, turns_total, model)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.run_id,
                record.agent_name,
                RunStatus::Running.as_str(),
                now_iso(),
                record.turns_total as i64,
                record.model
            ],
        )?;
        Ok(())
    }

    fn start_turn(&self, record: TurnStartRecord<'_>) -> Result<(), LedgerError> {
        let conn = self.conn();
        ensure_running(&conn, record.run_id)?;

        let last: i64 = conn.query_row(
            "SELECT COALESCE(MAX(turn_number), 0) FROM turns WHERE run_id = ?1",
            params![record.run_id],
            |row| row.get(0),
        )?;
        let expected = last as u32 + 1;
        if record.turn_number != expected {
            return Err(LedgerError::TurnOutOfOrder {
                expected,
                got: record.turn_number,
            });
        }

        conn.execute(
            "INSERT INTO turns (turn_id, run_id, turn_number, name, model, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.turn_id,
                record.run_id,
                record.turn_number as i64,
                record.name,
                record.model,
                TurnStatus::Pending.as_str(),
                now_iso()
            ],
        )?;
        Ok(())
    }

    fn append_message(&self, record: MessageRecord<'_>) -> Result<i64, LedgerError> {
        let conn = self.conn();
        ensure_running(&conn, record.run_id)?;
        conn.execute(
            "INSERT INTO messages (run_id, turn_id, role, content, input_tokens, output_tokens, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.run_id,
                record.turn_id,
                record.role.as_str(),
                record.content,
                record.input_tokens.map(to_i64),
                record.output_tokens.map(to_i64),
                now_iso()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn start_tool_call(&self, record: ToolCallStartRecord<'_>) -> Result<(), LedgerError> {
        let conn = self.conn();
        ensure_running(&conn, record.run_id)?;

        let exists = conn
            .query_row(
                "SELECT 1 FROM tool_calls WHERE run_id = ?1 AND call_id = ?2",
                params![record.run_id, record.call_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Err(LedgerError::DuplicateToolCall(record.call_id.to_string()));
        }

        let input_json = serde_json::to_string(record.input)?;
        conn.execute(
            "INSERT INTO tool_calls (run_id, turn_id, call_id, tool_name, input, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.run_id,
                record.turn_id,
                record.call_id,
                record.tool_name,
                input_json,
                ToolCallStatus::Pending.as_str(),
                now_iso()
            ],
        )?;
        Ok(())
    }

    fn complete_tool_call(&self, record: ToolCallFinishRecord<'_>) -> Result<(), LedgerError> {
        let conn = self.conn();
        ensure_running(&conn, record.run_id)?;

        let (status, output, error) = match record.outcome {
            ToolCallOutcome::Success(value) => (
                ToolCallStatus::Success,
                Some(serde_json::to_string(value)?),
                None,
            ),
            ToolCallOutcome::Error(message) => {
                (ToolCallStatus::Error, None, Some(message.to_string()))
            }
        };

        let updated = conn.execute(
            "UPDATE tool_calls
             SET status = ?3, output = ?4, error = ?5, duration_ms = ?6, finished_at = ?7
             WHERE run_id = ?1 AND call_id = ?2 AND status = ?8",
            params![
                record.run_id,
                record.call_id,
                status.as_str(),
                output,
                error,
                to_i64(record.duration_ms),
                now_iso(),
                ToolCallStatus::Pending.as_str()
            ],
        )?;
        if updated == 1 {
            return Ok(());
        }

        let exists = conn
            .query_row(
                "SELECT 1 FROM tool_calls WHERE run_id = ?1 AND call_id = ?2",
                params![record.run_id, record.call_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            Err(LedgerError::ToolCallAlreadyCompleted(
                record.call_id.to_string(),
            ))
        } else {
            Err(LedgerError::ToolCallNotFound(record.call_id.to_string()))
        }
    }

    fn complete_turn(&self, record: TurnFinishRecord<'_>) -> Result<u64, LedgerError> {
        let conn = self.conn();
        let existing: Option<(String, String, String)> = conn
            .query_row(
                "SELECT run_id, status, started_at FROM turns WHERE turn_id = ?1",
                params![record.turn_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((run_id, status, started_at)) = existing else {
            return Err(LedgerError::TurnNotFound(record.turn_id.to_string()));
        };
        if TurnStatus::parse(&status) != Some(TurnStatus::Pending) {
            return Err(LedgerError::TurnAlreadyCompleted(record.turn_id.to_string()));
        }
        ensure_running(&conn, &run_id)?;

        let duration_ms = elapsed_ms_since(&started_at);
        conn.execute(
            "UPDATE turns
             SET status = ?2, stop_reason = ?3, input_tokens = ?4, output_tokens = ?5,
                 cost_usd = ?6, tool_call_count = ?7, finished_at = ?8, duration_ms = ?9,
                 error = ?10
             WHERE turn_id = ?1 AND status = ?11",
            params![
                record.turn_id,
                record.status.as_str(),
                record.stop_reason.as_str(),
                to_i64(record.input_tokens),
                to_i64(record.output_tokens),
                record.cost_usd,
                record.tool_call_count as i64,
                now_iso(),
                to_i64(duration_ms),
                record.error,
                TurnStatus::Pending.as_str()
            ],
        )?;
        Ok(duration_ms)
    }

    fn record_progress(&self, record: ProgressRecord<'_>) -> Result<(), LedgerError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE runs
             SET turns_completed = MIN(turns_total, MAX(turns_completed, ?2)),
                 input_tokens = MAX(input_tokens, ?3),
                 output_tokens = MAX(output_tokens, ?4),
                 cost_usd = MAX(cost_usd, ?5)
             WHERE run_id = ?1 AND status = ?6",
            params![
                record.run_id,
                record.turns_completed as i64,
                to_i64(record.input_tokens),
                to_i64(record.output_tokens),
                record.cost_usd,
                RunStatus::Running.as_str()
            ],
        )?;
        if updated == 1 {
            Ok(())
        } else {
            Err(explain_stale_run(&conn, record.run_id))
        }
    }

    /// Terminal write. Turns and tool calls still pending (a panic or an
    /// abandoned future skipped their completion) are closed as errors in the
    /// same transaction, so no child stays open under a finished run.
    fn finish_run(&self, record: RunFinishRecord<'_>) -> Result<(), LedgerError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let finished_at = now_iso();
        let interrupted = format!(
            "interrupted: {}",
            record.error.unwrap_or("run finished before completion")
        );

        let orphaned_calls = tx.execute(
            "UPDATE tool_calls
             SET status = ?2, error = ?3, finished_at = ?4,
                 duration_ms = MAX(0, CAST((julianday(?4) - julianday(started_at)) * 86400000 AS INTEGER))
             WHERE run_id = ?1 AND status = ?5
               AND EXISTS (SELECT 1 FROM runs WHERE run_id = ?1 AND status = ?6)",
            params![
                record.run_id,
                ToolCallStatus::Error.as_str(),
                interrupted,
                finished_at,
                ToolCallStatus::Pending.as_str(),
                RunStatus::Running.as_str()
            ],
        )?;
        let orphaned_turns = tx.execute(
            "UPDATE turns
             SET status = ?2, stop_reason = ?3, error = ?4, finished_at = ?5,
                 duration_ms = MAX(0, CAST((julianday(?5) - julianday(started_at)) * 86400000 AS INTEGER))
             WHERE run_id = ?1 AND status = ?6
               AND EXISTS (SELECT 1 FROM runs WHERE run_id = ?1 AND status = ?7)",
            params![
                record.run_id,
                TurnStatus::Error.as_str(),
                TurnStopReason::Error.as_str(),
                interrupted,
                finished_at,
                TurnStatus::Pending.as_str(),
                RunStatus::Running.as_str()
            ],
        )?;
        if orphaned_calls + orphaned_turns > 0 {
            log::warn!(
                "[ledger] run {}: closed {orphaned_turns} pending turn(s) and {orphaned_calls} pending tool call(s)",
                record.run_id
            );
        }

        let updated = tx.execute(
            "UPDATE runs
             SET status = ?2,
                 finished_at = ?3,
                 turns_completed = MIN(turns_total, MAX(turns_completed, ?4)),
                 input_tokens = MAX(input_tokens, ?5),
                 output_tokens = MAX(output_tokens, ?6),
                 cost_usd = MAX(cost_usd, ?7),
                 error = ?8
             WHERE run_id = ?1 AND status = ?9",
            params![
                record.run_id,
                record.status.as_str(),
                finished_at,
                record.turns_completed as i64,
                to_i64(record.input_tokens),
                to_i64(record.output_tokens),
                record.cost_usd,
                record.error,
                RunStatus::Running.as_str()
            ],
        )?;
        if updated == 1 {
            tx.commit()?;
            Ok(())
        } else {
            drop(tx);
            Err(explain_stale_run(&conn, record.run_id))
        }
    }

    fn load_history(&self, run_id: &str) -> Result<RunHistory, LedgerError> {
        let conn = self.conn();
        let run = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
                params![run_id],
                run_from_row,
            )
            .optional()?
            .ok_or_else(|| LedgerError::RunNotFound(run_id.to_string()))?;

        let turn_rows = {
            let mut stmt = conn.prepare(
                "SELECT turn_id, run_id, turn_number, name, model, status, stop_reason,
                        input_tokens, output_tokens, cost_usd, tool_call_count, started_at,
                        finished_at, duration_ms, error
                 FROM turns WHERE run_id = ?1 ORDER BY turn_number ASC",
            )?;
            let rows = stmt.query_map(params![run_id], turn_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut message_stmt = conn.prepare(
            "SELECT id, turn_id, role, content, input_tokens, output_tokens, created_at
             FROM messages WHERE turn_id = ?1 ORDER BY id ASC",
        )?;
        let mut tool_stmt = conn.prepare(
            "SELECT call_id, turn_id, tool_name, input, status, output, error, duration_ms,
                    started_at, finished_at
             FROM tool_calls WHERE turn_id = ?1 ORDER BY id ASC",
        )?;

        let mut turns = Vec::with_capacity(turn_rows.len());
        for turn in turn_rows {
            let messages = message_stmt
                .query_map(params![turn.turn_id], message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            let tool_calls = tool_stmt
                .query_map(params![turn.turn_id], tool_call_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            turns.push(TurnHistory {
                turn,
                messages,
                tool_calls,
            });
        }

        Ok(RunHistory { run, turns })
    }

    fn list_runs(&self, limit: usize) -> Result<Vec<RunRow>, LedgerError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs
             ORDER BY datetime(started_at) DESC, run_id DESC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], run_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
