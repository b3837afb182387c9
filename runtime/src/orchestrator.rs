// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-phase crawl orchestration.
//!
//! Phase 1 fans every target out across the browser pool with a short
//! budget. Targets whose check timed out or failed to navigate are re-run in
//! phase 2 with a longer budget once phase 1 has drained. Phase-2 failures
//! with a transient reason go to the retry queue.

use crate::config::CrawlSettings;
use crate::error::{FailureReason, PoolError, StoreError};
use crate::model::{
    timestamp, CheckResult, CheckStatus, CrawlRun, Phase, RetryEntry, RetryStatus, RunCounters,
    RunStatus, Target,
};
use crate::pool::BrowserPool;
use crate::progress::{self, ProgressEventKind, ProgressSender};
use crate::retry;
use crate::runner::CheckRunner;
use crate::store::Store;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Final report of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub escalated: u32,
    pub enqueued_for_retry: u32,
}

/// Live state of a run owned by this process.
struct RunHandle {
    planned: u32,
    cancelled: AtomicBool,
    seq: AtomicU64,
    started: Instant,
    /// Latest status per target; phase-2 results overwrite phase-1 ones.
    latest: Mutex<HashMap<String, CheckStatus>>,
}

impl RunHandle {
    fn new(planned: u32) -> Self {
        Self {
            planned,
            cancelled: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            started: Instant::now(),
            latest: Mutex::new(HashMap::new()),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn record(&self, result: &CheckResult) -> RunCounters {
        let mut latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        latest.insert(result.target_id.clone(), result.status);
        RunCounters {
            total_properties: self.planned,
            completed_properties: latest.len() as u32,
            failed_properties: latest
                .values()
                .filter(|s| **s != CheckStatus::Passed)
                .count() as u32,
        }
    }
}

pub struct Orchestrator {
    pool: Arc<BrowserPool>,
    runner: Arc<CheckRunner>,
    store: Arc<Store>,
    settings: CrawlSettings,
    progress: Option<ProgressSender>,
    runs: DashMap<String, Arc<RunHandle>>,
}

impl Orchestrator {
    pub fn new(
        pool: Arc<BrowserPool>,
        runner: Arc<CheckRunner>,
        store: Arc<Store>,
        settings: CrawlSettings,
        progress: Option<ProgressSender>,
    ) -> Self {
        Self {
            pool,
            runner,
            store,
            settings,
            progress,
            runs: DashMap::new(),
        }
    }

    /// Persist a new run and execute it in the background. Returns its ID.
    pub fn start_run(self: &Arc<Self>, targets: Vec<Target>) -> Result<String, StoreError> {
        let (run_id, handle) = self.register(&targets)?;
        let this = Arc::clone(self);
        let id = run_id.clone();
        tokio::spawn(async move {
            // Failures are logged and persisted by `drive`
            let _ = this.drive(&id, targets, handle).await;
        });
        Ok(run_id)
    }

    /// Persist a new run and execute it on the current task.
    pub async fn run_to_completion(
        self: &Arc<Self>,
        targets: Vec<Target>,
    ) -> Result<RunSummary, StoreError> {
        let (run_id, handle) = self.register(&targets)?;
        self.drive(&run_id, targets, handle).await
    }

    /// Request cancellation. Checks already running finish; nothing new is
    /// dispatched. Returns `false` for runs not live in this process.
    pub fn stop(&self, run_id: &str) -> bool {
        match self.runs.get(run_id) {
            Some(handle) => {
                handle.cancelled.store(true, Ordering::SeqCst);
                tracing::info!(run_id, "run cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_live(&self, run_id: &str) -> bool {
        self.runs.contains_key(run_id)
    }

    pub fn live_runs(&self) -> Vec<String> {
        self.runs.iter().map(|e| e.key().clone()).collect()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn register(&self, targets: &[Target]) -> Result<(String, Arc<RunHandle>), StoreError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let planned = targets.len() as u32;
        self.store.create_run(&CrawlRun::start(&run_id, planned))?;
        let handle = Arc::new(RunHandle::new(planned));
        self.runs.insert(run_id.clone(), Arc::clone(&handle));
        Ok((run_id, handle))
    }

    async fn drive(
        self: &Arc<Self>,
        run_id: &str,
        targets: Vec<Target>,
        handle: Arc<RunHandle>,
    ) -> Result<RunSummary, StoreError> {
        let outcome = self.execute(run_id, targets, &handle).await;
        self.runs.remove(run_id);
        match outcome {
            Ok(summary) => Ok(summary),
            Err(e) => {
                tracing::error!(run_id, "run aborted: {e}");
                let counters = self
                    .store
                    .authoritative_results(run_id)
                    .map(|r| RunCounters::tally(&r))
                    .unwrap_or_default();
                let message = format!("run aborted: {e}");
                if let Err(finish_err) = self.store.finish_run(
                    run_id,
                    RunStatus::Failed,
                    &counters,
                    Some(&message),
                    None,
                ) {
                    tracing::error!(run_id, "failed to mark run failed: {finish_err}");
                }
                self.emit(
                    run_id,
                    &handle,
                    ProgressEventKind::RunFinished {
                        status: RunStatus::Failed,
                        counters,
                    },
                );
                Err(e)
            }
        }
    }

    async fn execute(
        self: &Arc<Self>,
        run_id: &str,
        targets: Vec<Target>,
        handle: &Arc<RunHandle>,
    ) -> Result<RunSummary, StoreError> {
        tracing::info!(run_id, targets = targets.len(), pool = self.pool.size(), "run started");
        self.emit(
            run_id,
            handle,
            ProgressEventKind::RunStarted {
                planned: handle.planned,
            },
        );

        let phase1 = self
            .run_phase(run_id, handle, Phase::One, &targets, self.settings.phase1_budget)
            .await?;

        let escalate: Vec<Target> = targets
            .iter()
            .filter(|t| {
                phase1
                    .get(&t.id)
                    .and_then(|r| r.failure)
                    .is_some_and(FailureReason::escalates)
            })
            .cloned()
            .collect();
        let escalated = escalate.len() as u32;

        let mut enqueued = 0;
        let mut warning = None;
        if !escalate.is_empty() && handle.is_cancelled() {
            let ids: Vec<&str> = escalate.iter().map(|t| t.id.as_str()).collect();
            let message = format!(
                "cancelled before phase 2; {escalated} timed-out target(s) not re-checked: {}",
                ids.join(", ")
            );
            tracing::warn!(run_id, escalated, "phase 2 skipped after cancellation");
            self.emit(
                run_id,
                handle,
                ProgressEventKind::Warning {
                    message: message.clone(),
                },
            );
            warning = Some(message);
        } else if !escalate.is_empty() {
            tracing::info!(run_id, escalated, "escalating to phase 2");
            let phase2 = self
                .run_phase(run_id, handle, Phase::Two, &escalate, self.settings.phase2_budget)
                .await?;
            for result in phase2.values() {
                if result.failure.is_some_and(FailureReason::is_retryable)
                    && self.enqueue_retry(result)?
                {
                    enqueued += 1;
                }
            }
        }

        let status = if handle.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        let authoritative = self.store.authoritative_results(run_id)?;
        let mut counters = RunCounters::tally(&authoritative);
        counters.total_properties = counters.total_properties.max(handle.planned);
        self.store
            .finish_run(run_id, status, &counters, None, warning.as_deref())?;

        tracing::info!(
            run_id,
            %status,
            total = counters.total_properties,
            completed = counters.completed_properties,
            failed = counters.failed_properties,
            escalated,
            enqueued,
            elapsed_ms = handle.started.elapsed().as_millis() as u64,
            "run finished"
        );
        self.emit(
            run_id,
            handle,
            ProgressEventKind::RunFinished { status, counters },
        );
        Ok(RunSummary {
            run_id: run_id.to_string(),
            status,
            counters,
            escalated,
            enqueued_for_retry: enqueued,
        })
    }

    /// Run one phase over `targets`. Results are persisted as they complete.
    async fn run_phase(
        self: &Arc<Self>,
        run_id: &str,
        handle: &Arc<RunHandle>,
        phase: Phase,
        targets: &[Target],
        budget: Duration,
    ) -> Result<HashMap<String, CheckResult>, StoreError> {
        let total = targets.len() as u32;
        self.emit(run_id, handle, ProgressEventKind::PhaseStarted { phase, total });

        let concurrency = self.pool.size().max(1);
        let mut checks = stream::iter(targets.iter().cloned())
            .map(|target| self.spawn_check(run_id, handle, target, phase, budget))
            .buffer_unordered(concurrency);

        let mut ticker = tokio::time::interval(self.settings.progress_interval);
        ticker.tick().await;

        let mut results = HashMap::new();
        let mut completed = 0u32;
        let mut failed = 0u32;
        loop {
            tokio::select! {
                next = checks.next() => {
                    let Some(result) = next else { break };
                    let Some(result) = result else { continue };
                    completed += 1;
                    if result.status != CheckStatus::Passed {
                        failed += 1;
                    }
                    self.store.insert_result(&result)?;
                    let counters = handle.record(&result);
                    if let Err(e) = self.store.update_run_counters(run_id, &counters) {
                        tracing::warn!(run_id, "failed to persist counters: {e}");
                        self.emit(run_id, handle, ProgressEventKind::Warning {
                            message: format!("failed to persist counters: {e}"),
                        });
                    }
                    self.emit(run_id, handle, ProgressEventKind::CheckFinished {
                        target_id: result.target_id.clone(),
                        phase,
                        status: result.status,
                    });
                    self.emit(run_id, handle, ProgressEventKind::Snapshot {
                        phase,
                        completed,
                        total,
                        failed,
                        elapsed_ms: handle.started.elapsed().as_millis() as u64,
                    });
                    results.insert(result.target_id.clone(), result);
                }
                _ = ticker.tick() => {
                    tracing::info!(run_id, %phase, completed, total, failed, "progress");
                    self.emit(run_id, handle, ProgressEventKind::Snapshot {
                        phase,
                        completed,
                        total,
                        failed,
                        elapsed_ms: handle.started.elapsed().as_millis() as u64,
                    });
                }
            }
        }
        Ok(results)
    }

    /// Run one check on its own task so a panic becomes an error result
    /// instead of tearing down the phase. `None` when the run was cancelled
    /// before dispatch.
    async fn spawn_check(
        self: &Arc<Self>,
        run_id: &str,
        handle: &Arc<RunHandle>,
        target: Target,
        phase: Phase,
        budget: Duration,
    ) -> Option<CheckResult> {
        if handle.is_cancelled() {
            return None;
        }
        let this = Arc::clone(self);
        let id = run_id.to_string();
        let target_id = target.id.clone();
        let task = tokio::spawn(async move { this.check_one(&id, &target, phase, budget).await });
        match task.await {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::error!(run_id, target_id = %target_id, "check task failed: {e}");
                Some(CheckResult::failed(
                    run_id,
                    &target_id,
                    phase,
                    CheckStatus::Error,
                    FailureReason::Internal,
                    format!("check task failed: {e}"),
                ))
            }
        }
    }

    async fn check_one(
        &self,
        run_id: &str,
        target: &Target,
        phase: Phase,
        budget: Duration,
    ) -> CheckResult {
        let (renderer, index) = match self.pool.acquire(self.settings.pool_acquire_timeout).await {
            Ok(slot) => slot,
            Err(e) => {
                let reason = match e {
                    PoolError::Timeout { .. } => FailureReason::PoolTimeout,
                    _ => FailureReason::Internal,
                };
                tracing::warn!(run_id, target_id = %target.id, %phase, "no browser: {e}");
                return CheckResult::failed(
                    run_id,
                    &target.id,
                    phase,
                    CheckStatus::Error,
                    reason,
                    e.to_string(),
                );
            }
        };
        let result = self
            .runner
            .run(renderer.as_ref(), run_id, target, phase, budget)
            .await;
        if let Err(e) = self.pool.release(index) {
            tracing::error!(run_id, index, "browser release failed: {e}");
        }
        result
    }

    fn enqueue_retry(&self, result: &CheckResult) -> Result<bool, StoreError> {
        let Some(reason) = result.failure else {
            return Ok(false);
        };
        let now = timestamp();
        let entry = RetryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            target_id: result.target_id.clone(),
            run_id: result.run_id.clone(),
            reason,
            status: RetryStatus::Pending,
            failure_count: 0,
            next_retry_at: now + retry::backoff(0),
            last_error: result.issues.first().cloned(),
            created_at: now,
            updated_at: now,
        };
        let inserted = self.store.enqueue_retry(&entry)?;
        if inserted {
            tracing::info!(
                run_id = %result.run_id,
                target_id = %result.target_id,
                %reason,
                "queued for retry"
            );
        }
        Ok(inserted)
    }

    fn emit(&self, run_id: &str, handle: &RunHandle, event: ProgressEventKind) {
        progress::emit(&self.progress, run_id, &handle.seq, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckSettings;
    use crate::renderer::scripted::{PageScript, ScriptBook, ScriptedLauncher};
    use crate::screenshots::NoScreenshots;
    use crate::validate::IdMatchValidator;

    fn target(id: &str) -> Target {
        Target {
            id: id.into(),
            url: format!("https://{id}.test/"),
            expected_tag_id: "G-ABC123".into(),
            expected_container_id: None,
            tolerate_blocked_first_party: false,
            active: true,
        }
    }

    fn page_view_after(secs: u64) -> PageScript {
        PageScript::loads().with_hit(
            "https://www.google-analytics.com/g/collect?tid=G-ABC123&en=page_view",
            Duration::from_secs(secs),
        )
    }

    async fn orchestrator(book: Arc<ScriptBook>, size: usize) -> Arc<Orchestrator> {
        let pool = BrowserPool::initialize(&ScriptedLauncher::new(book), size)
            .await
            .unwrap();
        let runner = CheckRunner::new(
            CheckSettings::default(),
            Arc::new(IdMatchValidator),
            Arc::new(NoScreenshots),
        );
        Arc::new(Orchestrator::new(
            Arc::new(pool),
            Arc::new(runner),
            Arc::new(Store::open_in_memory().unwrap()),
            CrawlSettings::default(),
            None,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_timeouts_escalate() {
        let book = ScriptBook::new();
        book.script("https://fast.test/", vec![page_view_after(1)]);
        book.script("https://slow.test/", vec![page_view_after(30)]);
        book.script(
            "https://wrong.test/",
            vec![PageScript::loads().with_hit(
                "https://www.google-analytics.com/g/collect?tid=G-NOPE&en=page_view",
                Duration::from_secs(1),
            )],
        );
        let orch = orchestrator(Arc::clone(&book), 2).await;
        let summary = orch
            .run_to_completion(vec![target("fast"), target("slow"), target("wrong")])
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.escalated, 1);
        assert_eq!(summary.enqueued_for_retry, 0);
        assert_eq!(summary.counters.total_properties, 3);
        assert_eq!(summary.counters.failed_properties, 1);

        let all = orch.store().results_for_run(&summary.run_id).unwrap();
        assert_eq!(all.len(), 4);
        let p2: Vec<_> = all.iter().filter(|r| r.phase == Phase::Two).collect();
        assert_eq!(p2.len(), 1);
        assert_eq!(p2[0].target_id, "slow");
        assert_eq!(p2[0].status, CheckStatus::Passed);
        assert!(!orch.is_live(&summary.run_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_timeout_is_not_escalated() {
        let book = ScriptBook::new();
        book.script("https://a.test/", vec![PageScript::hangs()]);
        book.script("https://b.test/", vec![PageScript::hangs()]);
        let pool = BrowserPool::initialize(&ScriptedLauncher::new(book), 1)
            .await
            .unwrap();
        let runner = CheckRunner::new(
            CheckSettings::default(),
            Arc::new(IdMatchValidator),
            Arc::new(NoScreenshots),
        );
        let settings = CrawlSettings {
            pool_acquire_timeout: Duration::from_secs(5),
            ..CrawlSettings::default()
        };
        let pool = Arc::new(pool);
        // Hold the only browser for the whole run
        let _held = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let orch = Arc::new(Orchestrator::new(
            Arc::clone(&pool),
            Arc::new(runner),
            Arc::new(Store::open_in_memory().unwrap()),
            settings,
            None,
        ));

        let summary = orch
            .run_to_completion(vec![target("a"), target("b")])
            .await
            .unwrap();
        assert_eq!(summary.escalated, 0);
        let results = orch.store().results_for_run(&summary.run_id).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| r.failure == Some(FailureReason::PoolTimeout) && r.phase == Phase::One));
        assert!(orch.store().retries_for_run(&summary.run_id).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_events_are_ordered() {
        let book = ScriptBook::new();
        book.script("https://a.test/", vec![page_view_after(1)]);
        let pool = BrowserPool::initialize(&ScriptedLauncher::new(book), 1)
            .await
            .unwrap();
        let runner = CheckRunner::new(
            CheckSettings::default(),
            Arc::new(IdMatchValidator),
            Arc::new(NoScreenshots),
        );
        let (tx, mut rx) = progress::channel();
        let orch = Arc::new(Orchestrator::new(
            Arc::new(pool),
            Arc::new(runner),
            Arc::new(Store::open_in_memory().unwrap()),
            CrawlSettings::default(),
            Some(tx),
        ));
        orch.run_to_completion(vec![target("a")]).await.unwrap();

        let mut kinds = Vec::new();
        let mut last_seq = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(event.seq > last_seq);
            last_seq = event.seq;
            kinds.push(event.event);
        }
        assert!(matches!(kinds.first(), Some(ProgressEventKind::RunStarted { planned: 1 })));
        assert!(matches!(
            kinds.last(),
            Some(ProgressEventKind::RunFinished {
                status: RunStatus::Completed,
                ..
            })
        ));
        assert!(kinds.iter().any(|k| matches!(
            k,
            ProgressEventKind::CheckFinished {
                status: CheckStatus::Passed,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_undispatched_checks() {
        let book = ScriptBook::new();
        for id in ["a", "b", "c"] {
            book.script(&format!("https://{id}.test/"), vec![page_view_after(3)]);
        }
        let orch = orchestrator(book, 1).await;
        let run_id = orch
            .start_run(vec![target("a"), target("b"), target("c")])
            .unwrap();
        assert!(orch.is_live(&run_id));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(orch.stop(&run_id));

        while orch.is_live(&run_id) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let run = orch.store().get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.counters.total_properties, 3);
        assert_eq!(run.counters.completed_properties, 1);
        assert!(!orch.stop("unknown-run"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_with_pending_escalation_warns() {
        let book = ScriptBook::new();
        book.script("https://slow.test/", vec![page_view_after(30)]);
        book.script("https://later.test/", vec![page_view_after(1)]);
        let pool = BrowserPool::initialize(&ScriptedLauncher::new(book), 1)
            .await
            .unwrap();
        let runner = CheckRunner::new(
            CheckSettings::default(),
            Arc::new(IdMatchValidator),
            Arc::new(NoScreenshots),
        );
        let (tx, mut rx) = progress::channel();
        let orch = Arc::new(Orchestrator::new(
            Arc::new(pool),
            Arc::new(runner),
            Arc::new(Store::open_in_memory().unwrap()),
            CrawlSettings::default(),
            Some(tx),
        ));
        let run_id = orch
            .start_run(vec![target("slow"), target("later")])
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(orch.stop(&run_id));
        while orch.is_live(&run_id) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let run = orch.store().get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(
            run.warning.as_deref().is_some_and(|w| w.contains("slow")),
            "{:?}",
            run.warning
        );
        let results = orch.store().results_for_run(&run_id).unwrap();
        assert!(results.iter().all(|r| r.phase == Phase::One));

        let mut warnings = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProgressEventKind::Warning { message } = event.event {
                warnings.push(message);
            }
        }
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("slow"));
    }
}
