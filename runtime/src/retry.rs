// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Persistent retry queue for checks that failed for transient reasons.
//!
//! Entries outlive the run that created them. A batch of due entries is
//! re-checked on a schedule; at most one batch is processed at a time.

use crate::config::CrawlSettings;
use crate::error::{FailureReason, StoreError};
use crate::model::{timestamp, CheckStatus, Phase, RetryEntry, RetryStatus};
use crate::pool::BrowserPool;
use crate::runner::CheckRunner;
use crate::store::Store;
use crate::targets::TargetSource;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Failed attempts after which an entry is abandoned.
pub const MAX_ATTEMPTS: u32 = 3;

const BASE_BACKOFF_MINUTES: i64 = 30;

/// Wait before the next attempt of an entry with `failure_count` failures.
///
/// 30, 60 and 120 minutes before attempts 1, 2 and 3.
pub fn backoff(failure_count: u32) -> chrono::Duration {
    chrono::Duration::minutes(BASE_BACKOFF_MINUTES << failure_count.min(16))
}

/// Outcome of one `process_queue` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    /// Another batch was already in progress; nothing was done.
    pub skipped: bool,
    pub attempted: u32,
    pub resolved: u32,
    pub rescheduled: u32,
    pub permanent_failures: u32,
    /// Put back unchanged because no browser was free.
    pub deferred: u32,
}

enum Attempt {
    Resolved,
    Rescheduled,
    Permanent,
    Deferred,
}

pub struct RetryQueue {
    store: Arc<Store>,
    pool: Arc<BrowserPool>,
    runner: Arc<CheckRunner>,
    targets: Arc<dyn TargetSource>,
    settings: CrawlSettings,
    processing: tokio::sync::Mutex<()>,
}

impl RetryQueue {
    pub fn new(
        store: Arc<Store>,
        pool: Arc<BrowserPool>,
        runner: Arc<CheckRunner>,
        targets: Arc<dyn TargetSource>,
        settings: CrawlSettings,
    ) -> Self {
        Self {
            store,
            pool,
            runner,
            targets,
            settings,
            processing: tokio::sync::Mutex::new(()),
        }
    }

    /// Re-check up to one batch of due `pending` entries.
    pub async fn process_queue(&self) -> Result<RetryReport, StoreError> {
        let Ok(_guard) = self.processing.try_lock() else {
            tracing::info!("retry processing already in progress, skipping");
            return Ok(RetryReport {
                skipped: true,
                ..RetryReport::default()
            });
        };

        let due = self
            .store
            .due_retries(timestamp(), self.settings.retry_batch)?;
        if due.is_empty() {
            tracing::debug!("no retries due");
            return Ok(RetryReport::default());
        }
        tracing::info!(due = due.len(), "processing retry queue");

        let attempts: Vec<Result<Attempt, StoreError>> = stream::iter(due)
            .map(|entry| self.attempt(entry))
            .buffer_unordered(self.pool.size().max(1))
            .collect()
            .await;

        let mut report = RetryReport::default();
        for attempt in attempts {
            report.attempted += 1;
            match attempt? {
                Attempt::Resolved => report.resolved += 1,
                Attempt::Rescheduled => report.rescheduled += 1,
                Attempt::Permanent => report.permanent_failures += 1,
                Attempt::Deferred => report.deferred += 1,
            }
        }
        tracing::info!(
            attempted = report.attempted,
            resolved = report.resolved,
            rescheduled = report.rescheduled,
            permanent = report.permanent_failures,
            deferred = report.deferred,
            "retry batch finished"
        );
        Ok(report)
    }

    /// Process the queue every `interval` until `shutdown` flips.
    pub async fn run_every(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.process_queue().await {
                        tracing::error!("retry processing failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    tracing::debug!("retry scheduler stopping");
                    break;
                }
            }
        }
    }

    async fn attempt(&self, mut entry: RetryEntry) -> Result<Attempt, StoreError> {
        entry.status = RetryStatus::Retrying;
        entry.updated_at = timestamp();
        self.store.update_retry(&entry)?;

        let target = match self.targets.target(&entry.target_id).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                entry.status = RetryStatus::PermanentFailure;
                entry.reason = FailureReason::PermanentFailure;
                entry.last_error = Some("target no longer configured".to_string());
                entry.updated_at = timestamp();
                self.store.update_retry(&entry)?;
                return Ok(Attempt::Permanent);
            }
            Err(e) => {
                tracing::warn!(target_id = %entry.target_id, "target lookup failed: {e:#}");
                return self.defer(entry, format!("target lookup failed: {e:#}"));
            }
        };

        let (renderer, index) = match self.pool.acquire(self.settings.pool_acquire_timeout).await {
            Ok(slot) => slot,
            Err(e) => {
                tracing::warn!(target_id = %entry.target_id, "retry deferred: {e}");
                return self.defer(entry, e.to_string());
            }
        };
        let result = self
            .runner
            .run(
                renderer.as_ref(),
                &entry.run_id,
                &target,
                Phase::Two,
                self.settings.phase2_budget,
            )
            .await;
        if let Err(e) = self.pool.release(index) {
            tracing::error!(index, "browser release failed: {e}");
        }

        let now = timestamp();
        entry.updated_at = now;
        if result.status == CheckStatus::Passed {
            entry.status = RetryStatus::Resolved;
            entry.last_error = None;
            self.store.update_retry(&entry)?;
            tracing::info!(target_id = %entry.target_id, "retry resolved");
            return Ok(Attempt::Resolved);
        }

        let reason = result.failure.unwrap_or(FailureReason::Internal);
        entry.failure_count += 1;
        entry.last_error = Some(match result.issues.first() {
            Some(issue) => format!("{reason}: {issue}"),
            None => reason.to_string(),
        });

        if entry.failure_count >= MAX_ATTEMPTS || !reason.is_retryable() {
            entry.status = RetryStatus::PermanentFailure;
            entry.reason = FailureReason::PermanentFailure;
            self.store.update_retry(&entry)?;
            tracing::warn!(
                target_id = %entry.target_id,
                failures = entry.failure_count,
                "retry abandoned"
            );
            return Ok(Attempt::Permanent);
        }

        entry.status = RetryStatus::Pending;
        entry.reason = reason;
        entry.next_retry_at = now + backoff(entry.failure_count);
        self.store.update_retry(&entry)?;
        tracing::info!(
            target_id = %entry.target_id,
            failures = entry.failure_count,
            next_retry_at = %entry.next_retry_at,
            "retry rescheduled"
        );
        Ok(Attempt::Rescheduled)
    }

    /// Put an entry back without counting the attempt.
    fn defer(&self, mut entry: RetryEntry, why: String) -> Result<Attempt, StoreError> {
        entry.status = RetryStatus::Pending;
        entry.last_error = Some(why);
        entry.updated_at = timestamp();
        self.store.update_retry(&entry)?;
        Ok(Attempt::Deferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckSettings;
    use crate::error::{NavigationErrorKind, NavigationFailure};
    use crate::model::Target;
    use crate::renderer::scripted::{PageScript, ScriptBook, ScriptedLauncher};
    use crate::screenshots::NoScreenshots;
    use crate::targets::StaticTargets;
    use crate::validate::IdMatchValidator;

    const URL: &str = "https://acme.test/";

    fn target() -> Target {
        Target {
            id: "acme".into(),
            url: URL.into(),
            expected_tag_id: "G-ABC123".into(),
            expected_container_id: None,
            tolerate_blocked_first_party: false,
            active: true,
        }
    }

    fn entry(target_id: &str) -> RetryEntry {
        let now = timestamp();
        RetryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            target_id: target_id.into(),
            run_id: "run-1".into(),
            reason: FailureReason::NavigationError(NavigationErrorKind::Dns),
            status: RetryStatus::Pending,
            failure_count: 0,
            next_retry_at: now - chrono::Duration::minutes(1),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn queue(book: Arc<ScriptBook>) -> (RetryQueue, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let pool = BrowserPool::initialize(&ScriptedLauncher::new(book), 2)
            .await
            .unwrap();
        let runner = CheckRunner::new(
            CheckSettings::default(),
            Arc::new(IdMatchValidator),
            Arc::new(NoScreenshots),
        );
        let queue = RetryQueue::new(
            Arc::clone(&store),
            Arc::new(pool),
            Arc::new(runner),
            Arc::new(StaticTargets(vec![target()])),
            CrawlSettings::default(),
        );
        (queue, store)
    }

    fn make_due(store: &Store, mut entry: RetryEntry) {
        entry.next_retry_at = timestamp() - chrono::Duration::seconds(1);
        store.update_retry(&entry).unwrap();
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff(0), chrono::Duration::minutes(30));
        assert_eq!(backoff(1), chrono::Duration::minutes(60));
        assert_eq!(backoff(2), chrono::Duration::minutes(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_progress_to_permanent() {
        let book = ScriptBook::new();
        book.script(
            URL,
            vec![PageScript::fails(NavigationFailure::Dns(
                "net::ERR_NAME_NOT_RESOLVED".into(),
            ))],
        );
        let (queue, store) = queue(book).await;
        store.enqueue_retry(&entry("acme")).unwrap();

        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.rescheduled, 1);
        let e = store.retries_for_run("run-1").unwrap().remove(0);
        assert_eq!(e.status, RetryStatus::Pending);
        assert_eq!(e.failure_count, 1);
        let wait = e.next_retry_at - e.updated_at;
        assert_eq!(wait, chrono::Duration::minutes(60));

        // Not due yet
        assert_eq!(queue.process_queue().await.unwrap().attempted, 0);

        make_due(&store, e);
        queue.process_queue().await.unwrap();
        let e = store.retries_for_run("run-1").unwrap().remove(0);
        assert_eq!(e.failure_count, 2);
        assert_eq!(e.next_retry_at - e.updated_at, chrono::Duration::minutes(120));

        make_due(&store, e);
        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.permanent_failures, 1);
        let e = store.retries_for_run("run-1").unwrap().remove(0);
        assert_eq!(e.status, RetryStatus::PermanentFailure);
        assert_eq!(e.failure_count, 3);
        assert!(e.last_error.unwrap().contains("navigation_error:dns"));

        // Terminal entries are never picked up again
        make_due(&store, store.retries_for_run("run-1").unwrap().remove(0));
        assert_eq!(queue.process_queue().await.unwrap().attempted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resolves() {
        let book = ScriptBook::new();
        book.script(
            URL,
            vec![PageScript::loads().with_hit(
                "https://www.google-analytics.com/g/collect?tid=G-ABC123&en=page_view",
                Duration::from_secs(2),
            )],
        );
        let (queue, store) = queue(book).await;
        store.enqueue_retry(&entry("acme")).unwrap();

        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.resolved, 1);
        let e = store.retries_for_run("run-1").unwrap().remove(0);
        assert_eq!(e.status, RetryStatus::Resolved);
        assert_eq!(e.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_target_is_permanent() {
        let (queue, store) = queue(ScriptBook::new()).await;
        store.enqueue_retry(&entry("gone")).unwrap();
        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.permanent_failures, 1);
        let e = store.retries_for_run("run-1").unwrap().remove(0);
        assert_eq!(e.status, RetryStatus::PermanentFailure);
    }

    #[tokio::test]
    async fn test_concurrent_processing_skips() {
        let (queue, store) = queue(ScriptBook::new()).await;
        store.enqueue_retry(&entry("acme")).unwrap();
        let _busy = queue.processing.try_lock().unwrap();
        let report = queue.process_queue().await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.attempted, 0);
        let e = store.retries_for_run("run-1").unwrap().remove(0);
        assert_eq!(e.status, RetryStatus::Pending);
    }
}
