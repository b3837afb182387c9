// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! SQLite persistence for crawl runs, check results and the retry queue.
//!
//! Timestamps are stored as RFC 3339 strings with microsecond precision in
//! UTC, so lexical order equals chronological order.

use crate::error::{FailureReason, StoreError, StoreResult};
use crate::model::{
    CheckResult, CheckStatus, CrawlRun, Phase, RetryEntry, RetryStatus, RunCounters, RunStatus,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS crawl_runs (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    total_properties INTEGER NOT NULL DEFAULT 0,
    completed_properties INTEGER NOT NULL DEFAULT 0,
    failed_properties INTEGER NOT NULL DEFAULT 0,
    message TEXT,
    warning TEXT
);

CREATE TABLE IF NOT EXISTS check_results (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES crawl_runs(id),
    target_id TEXT NOT NULL,
    phase INTEGER NOT NULL,
    status TEXT NOT NULL,
    failure TEXT,
    observed_tag_ids TEXT NOT NULL DEFAULT '[]',
    observed_container_ids TEXT NOT NULL DEFAULT '[]',
    primary_event_seen INTEGER NOT NULL DEFAULT 0,
    event_count INTEGER NOT NULL DEFAULT 0,
    issues TEXT NOT NULL DEFAULT '[]',
    duration_ms INTEGER NOT NULL DEFAULT 0,
    screenshot TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_check_results_run ON check_results(run_id, target_id);

CREATE TABLE IF NOT EXISTS retry_queue (
    id TEXT PRIMARY KEY,
    target_id TEXT NOT NULL,
    run_id TEXT NOT NULL,
    reason TEXT NOT NULL,
    status TEXT NOT NULL,
    failure_count INTEGER NOT NULL DEFAULT 0,
    next_retry_at TEXT NOT NULL,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_retry_queue_open
    ON retry_queue(target_id, run_id) WHERE status IN ('pending', 'retrying');
CREATE INDEX IF NOT EXISTS idx_retry_queue_due ON retry_queue(status, next_retry_at);
";

const RUN_COLUMNS: &str = "id, status, started_at, ended_at, total_properties, \
     completed_properties, failed_properties, message, warning";

const RESULT_COLUMNS: &str = "id, run_id, target_id, phase, status, failure, observed_tag_ids, \
     observed_container_ids, primary_event_seen, event_count, issues, duration_ms, screenshot, \
     created_at";

const RETRY_COLUMNS: &str = "id, target_id, run_id, reason, status, failure_count, \
     next_retry_at, last_error, created_at, updated_at";

/// Result store backed by a single SQLite connection.
pub struct Store {
    db: Mutex<Connection>,
}

impl Store {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(path)?;
        db.busy_timeout(Duration::from_secs(5))?;
        db.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::init(db)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> StoreResult<Self> {
        db.execute_batch(SCHEMA)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── crawl runs ──────────────────────────────────────────────

    pub fn create_run(&self, run: &CrawlRun) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO crawl_runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        );
        self.conn().execute(
            &sql,
            params![
                run.id,
                run.status.as_str(),
                ts(&run.started_at),
                run.ended_at.as_ref().map(ts),
                run.counters.total_properties,
                run.counters.completed_properties,
                run.counters.failed_properties,
                run.message,
                run.warning,
            ],
        )?;
        Ok(())
    }

    pub fn update_run_counters(&self, run_id: &str, counters: &RunCounters) -> StoreResult<()> {
        let changed = self.conn().execute(
            "UPDATE crawl_runs SET total_properties = ?2, completed_properties = ?3,
                 failed_properties = ?4 WHERE id = ?1",
            params![
                run_id,
                counters.total_properties,
                counters.completed_properties,
                counters.failed_properties,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        Ok(())
    }

    /// Move a run to a terminal status with its final counters.
    pub fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        counters: &RunCounters,
        message: Option<&str>,
        warning: Option<&str>,
    ) -> StoreResult<()> {
        let db = self.conn();
        finish_run_on(&db, run_id, status, counters, message, warning)
    }

    /// Delete superseded results and finish the run in one transaction.
    pub fn finish_run_replacing(
        &self,
        run_id: &str,
        stale_result_ids: &[String],
        status: RunStatus,
        counters: &RunCounters,
        message: Option<&str>,
        warning: Option<&str>,
    ) -> StoreResult<usize> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM check_results WHERE id = ?1 AND run_id = ?2")?;
            for id in stale_result_ids {
                deleted += stmt.execute(params![id, run_id])?;
            }
        }
        finish_run_on(&tx, run_id, status, counters, message, warning)?;
        tx.commit()?;
        Ok(deleted)
    }

    pub fn get_run(&self, run_id: &str) -> StoreResult<Option<CrawlRun>> {
        let db = self.conn();
        let run = db
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM crawl_runs WHERE id = ?1"),
                params![run_id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: usize) -> StoreResult<Vec<CrawlRun>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM crawl_runs ORDER BY started_at DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], run_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn runs_with_status(&self, status: RunStatus) -> StoreResult<Vec<CrawlRun>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM crawl_runs WHERE status = ?1 ORDER BY started_at"
        ))?;
        let rows = stmt.query_map(params![status.as_str()], run_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── check results ───────────────────────────────────────────

    pub fn insert_result(&self, result: &CheckResult) -> StoreResult<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO check_results ({RESULT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                result.id,
                result.run_id,
                result.target_id,
                result.phase.as_u8(),
                result.status.as_str(),
                result.failure.map(FailureReason::as_str),
                serde_json::to_string(&result.observed_tag_ids)?,
                serde_json::to_string(&result.observed_container_ids)?,
                result.primary_event_seen,
                result.event_count,
                serde_json::to_string(&result.issues)?,
                result.duration_ms as i64,
                result.screenshot,
                ts(&result.created_at),
            ],
        )?;
        Ok(())
    }

    /// Every result of a run in insertion order, duplicates included.
    pub fn results_for_run(&self, run_id: &str) -> StoreResult<Vec<CheckResult>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {RESULT_COLUMNS} FROM check_results WHERE run_id = ?1
             ORDER BY created_at, rowid"
        ))?;
        let rows = stmt.query_map(params![run_id], result_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// One result per target: phase 2 over phase 1, then the newest.
    pub fn authoritative_results(&self, run_id: &str) -> StoreResult<Vec<CheckResult>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {RESULT_COLUMNS} FROM check_results WHERE run_id = ?1
             ORDER BY target_id, phase DESC, created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![run_id], result_from_row)?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for row in rows {
            let result = row?;
            if seen.insert(result.target_id.clone()) {
                out.push(result);
            }
        }
        Ok(out)
    }

    // ── retry queue ─────────────────────────────────────────────

    /// Insert an entry unless an open one already exists for the same
    /// target and run. Returns whether a row was inserted.
    pub fn enqueue_retry(&self, entry: &RetryEntry) -> StoreResult<bool> {
        let inserted = self.conn().execute(
            &format!(
                "INSERT OR IGNORE INTO retry_queue ({RETRY_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                entry.id,
                entry.target_id,
                entry.run_id,
                entry.reason.as_str(),
                entry.status.as_str(),
                entry.failure_count,
                ts(&entry.next_retry_at),
                entry.last_error,
                ts(&entry.created_at),
                ts(&entry.updated_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Pending entries whose next attempt is due, oldest first.
    pub fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<RetryEntry>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {RETRY_COLUMNS} FROM retry_queue
             WHERE status = 'pending' AND next_retry_at <= ?1
             ORDER BY next_retry_at LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![ts(&now), limit as i64], retry_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update_retry(&self, entry: &RetryEntry) -> StoreResult<()> {
        self.conn().execute(
            "UPDATE retry_queue SET reason = ?2, status = ?3, failure_count = ?4,
                 next_retry_at = ?5, last_error = ?6, updated_at = ?7 WHERE id = ?1",
            params![
                entry.id,
                entry.reason.as_str(),
                entry.status.as_str(),
                entry.failure_count,
                ts(&entry.next_retry_at),
                entry.last_error,
                ts(&entry.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn retries_for_run(&self, run_id: &str) -> StoreResult<Vec<RetryEntry>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {RETRY_COLUMNS} FROM retry_queue WHERE run_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![run_id], retry_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Return entries left `retrying` by an interrupted process to `pending`.
    pub fn reset_interrupted_retries(&self) -> StoreResult<usize> {
        Ok(self.conn().execute(
            "UPDATE retry_queue SET status = 'pending', updated_at = ?1 WHERE status = 'retrying'",
            params![ts(&Utc::now())],
        )?)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> StoreResult<()> {
        self.conn().execute_batch(sql)?;
        Ok(())
    }

    /// Entry count per status.
    pub fn retry_status_counts(&self) -> StoreResult<Vec<(RetryStatus, u32)>> {
        let db = self.conn();
        let mut stmt =
            db.prepare("SELECT status, COUNT(*) FROM retry_queue GROUP BY status ORDER BY status")?;
        let rows = stmt.query_map([], |row| {
            let status = parse_col::<RetryStatus>(row, 0)?;
            let count: u32 = row.get(1)?;
            Ok((status, count))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn finish_run_on(
    db: &Connection,
    run_id: &str,
    status: RunStatus,
    counters: &RunCounters,
    message: Option<&str>,
    warning: Option<&str>,
) -> StoreResult<()> {
    let changed = db.execute(
        "UPDATE crawl_runs SET status = ?2, ended_at = ?3, total_properties = ?4,
             completed_properties = ?5, failed_properties = ?6,
             message = COALESCE(?7, message), warning = COALESCE(?8, warning)
         WHERE id = ?1",
        params![
            run_id,
            status.as_str(),
            ts(&Utc::now()),
            counters.total_properties,
            counters.completed_properties,
            counters.failed_properties,
            message,
            warning,
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::RunNotFound(run_id.to_string()));
    }
    Ok(())
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<CrawlRun> {
    let ended_at: Option<String> = row.get(3)?;
    Ok(CrawlRun {
        id: row.get(0)?,
        status: parse_col(row, 1)?,
        started_at: time_col(row, 2)?,
        ended_at: match ended_at {
            Some(_) => Some(time_col(row, 3)?),
            None => None,
        },
        counters: RunCounters {
            total_properties: row.get(4)?,
            completed_properties: row.get(5)?,
            failed_properties: row.get(6)?,
        },
        message: row.get(7)?,
        warning: row.get(8)?,
    })
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<CheckResult> {
    let phase: u8 = row.get(3)?;
    let failure: Option<String> = row.get(5)?;
    let duration_ms: i64 = row.get(11)?;
    Ok(CheckResult {
        id: row.get(0)?,
        run_id: row.get(1)?,
        target_id: row.get(2)?,
        phase: Phase::from_u8(phase).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                Type::Integer,
                format!("invalid phase {phase}").into(),
            )
        })?,
        status: parse_col::<CheckStatus>(row, 4)?,
        failure: match failure {
            Some(_) => Some(parse_col::<FailureReason>(row, 5)?),
            None => None,
        },
        observed_tag_ids: json_col(row, 6)?,
        observed_container_ids: json_col(row, 7)?,
        primary_event_seen: row.get(8)?,
        event_count: row.get(9)?,
        issues: json_col(row, 10)?,
        duration_ms: duration_ms.max(0) as u64,
        screenshot: row.get(12)?,
        created_at: time_col(row, 13)?,
    })
}

fn retry_from_row(row: &Row<'_>) -> rusqlite::Result<RetryEntry> {
    Ok(RetryEntry {
        id: row.get(0)?,
        target_id: row.get(1)?,
        run_id: row.get(2)?,
        reason: parse_col(row, 3)?,
        status: parse_col(row, 4)?,
        failure_count: row.get(5)?,
        next_retry_at: time_col(row, 6)?,
        last_error: row.get(7)?,
        created_at: time_col(row, 8)?,
        updated_at: time_col(row, 9)?,
    })
}
