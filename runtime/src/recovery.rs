// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Startup recovery of runs interrupted by a restart.
//!
//! Must complete before the orchestrator accepts work. Every run still marked
//! `running` is closed: `failed` if it produced nothing, otherwise
//! `completed` from its deduplicated results.

use crate::error::StoreResult;
use crate::model::{CheckResult, CrawlRun, Phase, RunCounters, RunStatus};
use crate::store::Store;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

pub const RECOVERED_NOTE: &str = "recovered after restart";
const EMPTY_RUN_NOTE: &str = "interrupted by restart before any check finished";

/// How one interrupted run was closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveredRun {
    pub run_id: String,
    pub status: RunStatus,
    pub counters: RunCounters,
    /// Older duplicate results deleted.
    pub removed_duplicates: usize,
    /// Targets that timed out in phase 1 and never got their phase-2 check.
    pub lost_escalations: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub runs: Vec<RecoveredRun>,
    /// Runs that could not be recovered, with the reason.
    pub errors: Vec<(String, String)>,
    /// Retry entries put back to `pending`.
    pub requeued_retries: usize,
}

impl RecoveryReport {
    pub fn warnings(&self) -> impl Iterator<Item = &RecoveredRun> {
        self.runs.iter().filter(|r| !r.lost_escalations.is_empty())
    }
}

/// Close every run left `running`. A run whose results cannot be read is
/// closed as `failed` with the error as its message.
pub fn recover(store: &Store) -> StoreResult<RecoveryReport> {
    let mut report = RecoveryReport::default();

    match store.reset_interrupted_retries() {
        Ok(n) => report.requeued_retries = n,
        Err(e) => tracing::error!("failed to reset interrupted retries: {e}"),
    }

    let interrupted = store.runs_with_status(RunStatus::Running)?;
    if interrupted.is_empty() {
        tracing::debug!("no interrupted runs");
        return Ok(report);
    }
    tracing::info!(runs = interrupted.len(), "recovering interrupted runs");

    for run in interrupted {
        match recover_run(store, &run) {
            Ok(recovered) => {
                if recovered.lost_escalations.is_empty() {
                    tracing::info!(
                        run_id = %run.id,
                        status = %recovered.status,
                        total = recovered.counters.total_properties,
                        removed_duplicates = recovered.removed_duplicates,
                        "run recovered"
                    );
                } else {
                    tracing::warn!(
                        run_id = %run.id,
                        lost = recovered.lost_escalations.len(),
                        "run recovered with unresolved phase-1 timeouts"
                    );
                }
                report.runs.push(recovered);
            }
            Err(e) => {
                tracing::error!(run_id = %run.id, "run recovery failed: {e}");
                let message = format!("recovery failed: {e}");
                if let Err(close_err) = store.finish_run(
                    &run.id,
                    RunStatus::Failed,
                    &RunCounters::default(),
                    Some(&message),
                    None,
                ) {
                    tracing::error!(
                        run_id = %run.id,
                        "failed to close unrecoverable run: {close_err}"
                    );
                }
                report.errors.push((run.id.clone(), e.to_string()));
            }
        }
    }
    Ok(report)
}

fn recover_run(store: &Store, run: &CrawlRun) -> StoreResult<RecoveredRun> {
    let results = store.results_for_run(&run.id)?;
    if results.is_empty() {
        let counters = RunCounters::default();
        store.finish_run(
            &run.id,
            RunStatus::Failed,
            &counters,
            Some(EMPTY_RUN_NOTE),
            None,
        )?;
        return Ok(RecoveredRun {
            run_id: run.id.clone(),
            status: RunStatus::Failed,
            counters,
            removed_duplicates: 0,
            lost_escalations: Vec::new(),
        });
    }

    // Checked on the raw rows: dedup would hide a phase-1 timeout behind a
    // newer phase-1 duplicate.
    let lost_escalations = lost_escalations(&results);
    let (kept, stale) = newest_per_target(results);
    let counters = RunCounters::tally(&kept);
    let warning = (!lost_escalations.is_empty()).then(|| {
        format!(
            "{} target(s) timed out in phase 1 and were not re-checked before the restart: {}",
            lost_escalations.len(),
            lost_escalations.join(", ")
        )
    });

    let removed = store.finish_run_replacing(
        &run.id,
        &stale,
        RunStatus::Completed,
        &counters,
        Some(RECOVERED_NOTE),
        warning.as_deref(),
    )?;

    Ok(RecoveredRun {
        run_id: run.id.clone(),
        status: RunStatus::Completed,
        counters,
        removed_duplicates: removed,
        lost_escalations,
    })
}

/// Targets with an escalating phase-1 failure and no phase-2 result.
fn lost_escalations(results: &[CheckResult]) -> Vec<String> {
    let escalated: BTreeSet<&str> = results
        .iter()
        .filter(|r| r.phase == Phase::One && r.failure.is_some_and(|f| f.escalates()))
        .map(|r| r.target_id.as_str())
        .collect();
    let rechecked: BTreeSet<&str> = results
        .iter()
        .filter(|r| r.phase == Phase::Two)
        .map(|r| r.target_id.as_str())
        .collect();
    escalated
        .difference(&rechecked)
        .map(|s| s.to_string())
        .collect()
}

/// Keep the newest result per target. `results` must be in insertion order.
fn newest_per_target(results: Vec<CheckResult>) -> (Vec<CheckResult>, Vec<String>) {
    let mut newest: HashMap<String, CheckResult> = HashMap::new();
    let mut stale = Vec::new();
    for result in results {
        match newest.get(&result.target_id) {
            Some(current) if current.created_at > result.created_at => stale.push(result.id),
            _ => {
                if let Some(older) = newest.insert(result.target_id.clone(), result) {
                    stale.push(older.id);
                }
            }
        }
    }
    let mut kept: Vec<CheckResult> = newest.into_values().collect();
    kept.sort_by(|a, b| a.target_id.cmp(&b.target_id));
    (kept, stale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use crate::model::CheckStatus;

    fn result(run: &str, target: &str, phase: Phase, status: CheckStatus) -> CheckResult {
        let failure = match status {
            CheckStatus::Passed => None,
            CheckStatus::Timeout => Some(FailureReason::EventWaitTimeout),
            _ => Some(FailureReason::ConfigMismatch),
        };
        let mut r = CheckResult::failed(
            run,
            target,
            phase,
            status,
            FailureReason::Internal,
            "",
        );
        r.failure = failure;
        r.issues.clear();
        r
    }

    #[test]
    fn test_empty_run_marked_failed() {
        let store = Store::open_in_memory().unwrap();
        store.create_run(&CrawlRun::start("r", 10)).unwrap();

        let report = recover(&store).unwrap();
        assert_eq!(report.runs.len(), 1);
        let run = store.get_run("r").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.message.is_some());
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn test_duplicates_removed_newest_kept() {
        let store = Store::open_in_memory().unwrap();
        store.create_run(&CrawlRun::start("r", 7)).unwrap();
        for i in 0..7 {
            store
                .insert_result(&result("r", &format!("t{i}"), Phase::One, CheckStatus::Timeout))
                .unwrap();
        }
        let mut newest = Vec::new();
        for i in 0..3 {
            let mut dup = result("r", &format!("t{i}"), Phase::One, CheckStatus::Passed);
            dup.created_at += chrono::Duration::seconds(1);
            store.insert_result(&dup).unwrap();
            newest.push(dup.id);
        }

        let report = recover(&store).unwrap();
        let recovered = &report.runs[0];
        assert_eq!(recovered.removed_duplicates, 3);
        assert_eq!(recovered.counters.total_properties, 7);
        assert_eq!(recovered.counters.failed_properties, 4);

        let left = store.results_for_run("r").unwrap();
        assert_eq!(left.len(), 7);
        for id in newest {
            assert!(left.iter().any(|r| r.id == id));
        }
        let run = store.get_run("r").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.message.as_deref(), Some(RECOVERED_NOTE));
    }

    #[test]
    fn test_lost_escalations_detected_before_dedup() {
        let results = vec![
            result("r", "a", Phase::One, CheckStatus::Timeout),
            result("r", "a", Phase::One, CheckStatus::Passed),
            result("r", "b", Phase::One, CheckStatus::Timeout),
            result("r", "b", Phase::Two, CheckStatus::Passed),
            result("r", "c", Phase::One, CheckStatus::Failed),
        ];
        assert_eq!(lost_escalations(&results), vec!["a"]);
    }

    #[test]
    fn test_warning_persisted() {
        let store = Store::open_in_memory().unwrap();
        store.create_run(&CrawlRun::start("r", 2)).unwrap();
        store
            .insert_result(&result("r", "slow", Phase::One, CheckStatus::Timeout))
            .unwrap();
        store
            .insert_result(&result("r", "fast", Phase::One, CheckStatus::Passed))
            .unwrap();

        let report = recover(&store).unwrap();
        assert_eq!(report.warnings().count(), 1);
        let run = store.get_run("r").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.warning.unwrap().contains("slow"));
    }

    #[test]
    fn test_bad_run_does_not_block_others() {
        let store = Store::open_in_memory().unwrap();
        store.create_run(&CrawlRun::start("bad", 1)).unwrap();
        store.create_run(&CrawlRun::start("good", 1)).unwrap();
        store
            .insert_result(&result("good", "a", Phase::One, CheckStatus::Passed))
            .unwrap();
        store
            .execute_raw(
                "INSERT INTO check_results (id, run_id, target_id, phase, status, created_at)
                 VALUES ('x', 'bad', 'a', 1, 'exploded', '2026-01-01T00:00:00.000000Z')",
            )
            .unwrap();

        let report = recover(&store).unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, "bad");
        assert_eq!(
            store.get_run("good").unwrap().unwrap().status,
            RunStatus::Completed
        );
        let bad = store.get_run("bad").unwrap().unwrap();
        assert_eq!(bad.status, RunStatus::Failed);
        assert!(bad.ended_at.is_some());
        assert!(
            bad.message.as_deref().is_some_and(|m| m.starts_with("recovery failed:")),
            "{:?}",
            bad.message
        );

        // Closed for good: a second pass finds nothing left to recover
        let again = recover(&store).unwrap();
        assert!(again.runs.is_empty());
        assert!(again.errors.is_empty());
        assert_eq!(
            store.get_run("bad").unwrap().unwrap().status,
            RunStatus::Failed
        );
    }

    #[test]
    fn test_no_running_runs_is_noop() {
        let store = Store::open_in_memory().unwrap();
        let report = recover(&store).unwrap();
        assert!(report.runs.is_empty());
        assert!(report.errors.is_empty());
    }
}
