//! State Store (C1): durable, single-writer, transactional persistence for
//! Runs, Step Attempts, Patches and Ledger Entries, plus an append-only
//! event log with monotonic per-run sequence numbers (spec §4.1, §6).
//!
//! Grounded on the teacher's `factory/db.rs`: a `rusqlite::Connection`
//! wrapper, `CREATE TABLE IF NOT EXISTS` migrations run once at open,
//! row-struct + `into_x()` conversion for enum/JSON columns, and
//! `last_insert_rowid()`-then-refetch for inserts that need the full row
//! back.

use crate::errors::StorageError;
use crate::model::{
    AttemptState, LedgerEntry, LedgerState, LedgerTransition, Patch, Run, RunId, RunState,
    RunStats, StepAttempt,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;

/// Single-writer persistence handle. A per-store mutex serializes
/// transactions (spec §5: "single-writer per Run via a per-Run mutex...
/// Cross-Run updates use a single global writer mutex" — collapsed here to
/// one writer mutex per store handle, since SQLite itself serializes
/// writers at the file level regardless).
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL,
                state TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                stats_json TEXT NOT NULL,
                cancel_requested INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS step_attempts (
                attempt_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                task_id TEXT NOT NULL,
                attempt_index INTEGER NOT NULL,
                tool_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                exit_code INTEGER,
                stdout TEXT NOT NULL,
                stderr TEXT NOT NULL,
                output_patch_id TEXT,
                state TEXT NOT NULL,
                failure_reason TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_step_attempts_run ON step_attempts(run_id);

            CREATE TABLE IF NOT EXISTS patches (
                patch_id TEXT PRIMARY KEY,
                step_attempt_id TEXT NOT NULL REFERENCES step_attempts(attempt_id) ON DELETE CASCADE,
                diff TEXT NOT NULL,
                paths_json TEXT NOT NULL,
                diff_stats_json TEXT NOT NULL,
                diff_hash TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ledger_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                patch_id TEXT NOT NULL REFERENCES patches(patch_id) ON DELETE CASCADE,
                to_state TEXT NOT NULL,
                reason TEXT NOT NULL,
                actor TEXT NOT NULL,
                at TEXT NOT NULL,
                review_metadata TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_ledger_patch ON ledger_transitions(patch_id);

            CREATE TABLE IF NOT EXISTS events (
                run_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                PRIMARY KEY (run_id, seq)
            );
            "#,
        )?;
        Ok(())
    }

    pub fn create_run(&self, run: &Run) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO runs (run_id, plan_id, state, started_at, finished_at, stats_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.run_id,
                run.plan_id,
                run.state.as_str(),
                run.started_at.map(|t| t.to_rfc3339()),
                run.finished_at.map(|t| t.to_rfc3339()),
                serde_json::to_string(&run.stats).map_err(|e| anyhow::anyhow!(e))?,
            ],
        )?;
        Ok(())
    }

    pub fn update_run_state(
        &self,
        run_id: &str,
        state: RunState,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE runs SET state = ?1, finished_at = COALESCE(?2, finished_at) WHERE run_id = ?3",
            params![state.as_str(), finished_at.map(|t| t.to_rfc3339()), run_id],
        )?;
        Ok(())
    }

    pub fn update_run_stats(&self, run_id: &str, stats: &RunStats) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE runs SET stats_json = ?1 WHERE run_id = ?2",
            params![
                serde_json::to_string(stats).map_err(|e| anyhow::anyhow!(e))?,
                run_id
            ],
        )?;
        Ok(())
    }

    /// Records an out-of-process cancellation request against a Run
    /// (spec §4.12, §6 `cancel-run`): a separate CLI invocation sets
    /// this flag, and the process actually driving the Run polls it via
    /// `is_cancel_requested` before every ready-dispatch.
    pub fn request_cancel(&self, run_id: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE runs SET cancel_requested = 1 WHERE run_id = ?1",
            params![run_id],
        )?;
        Ok(())
    }

    pub fn is_cancel_requested(&self, run_id: &str) -> Result<bool, StorageError> {
        let conn = self.conn.lock().unwrap();
        let flag: Option<i64> = conn
            .query_row(
                "SELECT cancel_requested FROM runs WHERE run_id = ?1",
                params![run_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(0) != 0)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT run_id, plan_id, state, started_at, finished_at, stats_json
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                row_to_run,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_runs(&self, state_filter: Option<RunState>) -> Result<Vec<Run>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT run_id, plan_id, state, started_at, finished_at, stats_json
             FROM runs ORDER BY run_id",
        )?;
        let rows = stmt.query_map([], row_to_run)?;
        let mut out = Vec::new();
        for row in rows {
            let run = row?;
            if state_filter.is_none_or(|f| f == run.state) {
                out.push(run);
            }
        }
        Ok(out)
    }

    pub fn append_step_attempt(&self, attempt: &StepAttempt) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO step_attempts
                (attempt_id, run_id, task_id, attempt_index, tool_id, started_at, finished_at,
                 exit_code, stdout, stderr, output_patch_id, state, failure_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                attempt.attempt_id,
                attempt.run_id,
                attempt.task_id,
                attempt.attempt_index,
                attempt.tool_id,
                attempt.started_at.to_rfc3339(),
                attempt.finished_at.map(|t| t.to_rfc3339()),
                attempt.exit_code,
                attempt.stdout,
                attempt.stderr,
                attempt.output_patch_id,
                attempt.state.as_str(),
                attempt.failure_reason,
            ],
        )?;
        Ok(())
    }

    pub fn finalize_step_attempt(&self, attempt: &StepAttempt) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE step_attempts SET
                finished_at = ?1, exit_code = ?2, stdout = ?3, stderr = ?4,
                output_patch_id = ?5, state = ?6, failure_reason = ?7
             WHERE attempt_id = ?8",
            params![
                attempt.finished_at.map(|t| t.to_rfc3339()),
                attempt.exit_code,
                attempt.stdout,
                attempt.stderr,
                attempt.output_patch_id,
                attempt.state.as_str(),
                attempt.failure_reason,
                attempt.attempt_id,
            ],
        )?;
        Ok(())
    }

    pub fn list_step_attempts(&self, run_id: &str) -> Result<Vec<StepAttempt>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT attempt_id, run_id, task_id, attempt_index, tool_id, started_at, finished_at,
                    exit_code, stdout, stderr, output_patch_id, state, failure_reason
             FROM step_attempts WHERE run_id = ?1 ORDER BY task_id, attempt_index",
        )?;
        let rows = stmt.query_map(params![run_id], row_to_attempt)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)
    }

    pub fn store_patch(&self, patch: &Patch) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO patches (patch_id, step_attempt_id, diff, paths_json, diff_stats_json, diff_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                patch.patch_id,
                patch.step_attempt_id,
                patch.diff,
                serde_json::to_string(&patch.paths).map_err(|e| anyhow::anyhow!(e))?,
                serde_json::to_string(&patch.diff_stats).map_err(|e| anyhow::anyhow!(e))?,
                patch.diff_hash,
            ],
        )?;

        conn.execute(
            "INSERT INTO ledger_transitions (patch_id, to_state, reason, actor, at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                patch.patch_id,
                LedgerState::Created.as_str(),
                "patch produced",
                "executor",
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_patch(&self, patch_id: &str) -> Result<Option<Patch>, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT patch_id, step_attempt_id, diff, paths_json, diff_stats_json, diff_hash
             FROM patches WHERE patch_id = ?1",
            params![patch_id],
            row_to_patch,
        )
        .optional()
        .map_err(StorageError::from)
    }

    /// Append-only ledger transition (spec §4.10); the full history for a
    /// patch is reconstructed by `get_ledger_entry`.
    pub fn append_ledger_transition(
        &self,
        patch_id: &str,
        transition: &LedgerTransition,
        review_metadata: Option<&str>,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO ledger_transitions (patch_id, to_state, reason, actor, at, review_metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                patch_id,
                transition.to_state.as_str(),
                transition.reason,
                transition.actor,
                transition.at.to_rfc3339(),
                review_metadata,
            ],
        )?;
        Ok(())
    }

    pub fn get_ledger_entry(&self, patch_id: &str) -> Result<Option<LedgerEntry>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT to_state, reason, actor, at, review_metadata
             FROM ledger_transitions WHERE patch_id = ?1 ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![patch_id])?;

        let mut transitions = Vec::new();
        let mut last_review_metadata = None;
        while let Some(row) = rows.next()? {
            let to_state: String = row.get(0)?;
            let reason: String = row.get(1)?;
            let actor: String = row.get(2)?;
            let at: String = row.get(3)?;
            let review_metadata: Option<String> = row.get(4)?;
            if review_metadata.is_some() {
                last_review_metadata = review_metadata;
            }
            transitions.push(LedgerTransition {
                to_state: to_state.parse().map_err(anyhow::Error::from)?,
                reason,
                actor,
                at: DateTime::parse_from_rfc3339(&at)
                    .map_err(|e| anyhow::anyhow!(e))?
                    .with_timezone(&Utc),
            });
        }

        if transitions.is_empty() {
            return Ok(None);
        }
        let state = transitions.last().unwrap().to_state;
        Ok(Some(LedgerEntry {
            patch_id: patch_id.to_string(),
            state,
            transitions,
            review_metadata: last_review_metadata,
        }))
    }

    /// Monotonic, per-run append-only event log, backing `stream_events_since`.
    pub fn append_event(
        &self,
        run_id: &str,
        kind: &str,
        payload_json: &str,
    ) -> Result<i64, StorageError> {
        let conn = self.conn.lock().unwrap();
        let next_seq: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(seq), -1) + 1 FROM events WHERE run_id = ?1",
                params![run_id],
                |r| r.get(0),
            )
            .unwrap_or(0);
        conn.execute(
            "INSERT INTO events (run_id, seq, kind, payload_json) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, next_seq, kind, payload_json],
        )?;
        Ok(next_seq)
    }

    pub fn stream_events_since(
        &self,
        run_id: &str,
        offset: i64,
    ) -> Result<Vec<(i64, String, String)>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT seq, kind, payload_json FROM events
             WHERE run_id = ?1 AND seq > ?2 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![run_id, offset], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)
    }
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<Run> {
    let state: String = row.get(2)?;
    let started_at: Option<String> = row.get(3)?;
    let finished_at: Option<String> = row.get(4)?;
    let stats_json: String = row.get(5)?;

    Ok(Run {
        run_id: row.get(0)?,
        plan_id: row.get(1)?,
        state: state
            .parse()
            .map_err(|e: anyhow::Error| rusqlite::Error::ToSqlConversionFailure(e.into()))?,
        started_at: started_at.map(|s| parse_rfc3339(&s)).transpose()?,
        finished_at: finished_at.map(|s| parse_rfc3339(&s)).transpose()?,
        stats: serde_json::from_str(&stats_json)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
    })
}

fn row_to_attempt(row: &rusqlite::Row) -> rusqlite::Result<StepAttempt> {
    let started_at: String = row.get(5)?;
    let finished_at: Option<String> = row.get(6)?;
    let state: String = row.get(11)?;

    Ok(StepAttempt {
        attempt_id: row.get(0)?,
        run_id: row.get(1)?,
        task_id: row.get(2)?,
        attempt_index: row.get(3)?,
        tool_id: row.get(4)?,
        started_at: parse_rfc3339(&started_at)?,
        finished_at: finished_at.map(|s| parse_rfc3339(&s)).transpose()?,
        exit_code: row.get(7)?,
        stdout: row.get(8)?,
        stderr: row.get(9)?,
        output_patch_id: row.get(10)?,
        state: state
            .parse::<AttemptState>()
            .map_err(|e: anyhow::Error| rusqlite::Error::ToSqlConversionFailure(e.into()))?,
        failure_reason: row.get(12)?,
    })
}

fn row_to_patch(row: &rusqlite::Row) -> rusqlite::Result<Patch> {
    let paths_json: String = row.get(3)?;
    let diff_stats_json: String = row.get(4)?;
    Ok(Patch {
        patch_id: row.get(0)?,
        step_attempt_id: row.get(1)?,
        diff: row.get(2)?,
        paths: serde_json::from_str(&paths_json)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        diff_stats: serde_json::from_str(&diff_stats_json)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        diff_hash: row.get(5)?,
    })
}

fn parse_rfc3339(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}
