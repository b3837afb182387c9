// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Single-check runner.
//!
//! Drives one page session through
//! `Navigating → Interacting → AwaitingContainer → AwaitingPrimaryEvent → Done`
//! under a fixed time budget. Every failure is folded into the returned
//! [`CheckResult`]; nothing here aborts the caller's batch.

use crate::capture::{EventCapturer, CONTAINER_PROBE_SCRIPT};
use crate::config::CheckSettings;
use crate::error::{FailureReason, NavigationFailure};
use crate::model::{CheckResult, CheckStatus, Phase, Target};
use crate::renderer::{RenderContext, Renderer};
use crate::screenshots::ScreenshotSink;
use crate::validate::{observed_container_ids, observed_tag_ids, Validator, Verdict};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Where a check currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Navigating,
    Interacting,
    AwaitingContainer,
    AwaitingPrimaryEvent,
    Done,
    Failed,
}

/// How a check ended, before it is turned into a [`CheckResult`].
#[derive(Debug)]
struct Outcome {
    status: CheckStatus,
    failure: Option<FailureReason>,
    issues: Vec<String>,
    containers: Vec<String>,
}

impl Outcome {
    fn failed(status: CheckStatus, failure: FailureReason, issue: String) -> Self {
        Self {
            status,
            failure: Some(failure),
            issues: vec![issue],
            containers: Vec::new(),
        }
    }
}

pub struct CheckRunner {
    settings: CheckSettings,
    validator: Arc<dyn Validator>,
    screenshots: Arc<dyn ScreenshotSink>,
}

impl CheckRunner {
    pub fn new(
        settings: CheckSettings,
        validator: Arc<dyn Validator>,
        screenshots: Arc<dyn ScreenshotSink>,
    ) -> Self {
        Self {
            settings,
            validator,
            screenshots,
        }
    }

    /// Check one target on an already-acquired browser within `budget`.
    pub async fn run(
        &self,
        renderer: &dyn Renderer,
        run_id: &str,
        target: &Target,
        phase: Phase,
        budget: Duration,
    ) -> CheckResult {
        let started = Instant::now();
        let deadline = started + budget;

        let mut ctx = match renderer.new_context().await {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(target_id = %target.id, %phase, "failed to open page: {e:#}");
                let mut result = CheckResult::failed(
                    run_id,
                    &target.id,
                    phase,
                    CheckStatus::Error,
                    FailureReason::Internal,
                    format!("failed to open page: {e:#}"),
                );
                result.duration_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };

        let attached = EventCapturer::attach(ctx.as_mut(), self.settings.poll_interval).await;
        let mut capturer = match attached {
            Ok(capturer) => capturer,
            Err(e) => {
                if let Err(close_err) = ctx.close().await {
                    tracing::debug!("page close failed: {close_err:#}");
                }
                let mut result = CheckResult::failed(
                    run_id,
                    &target.id,
                    phase,
                    CheckStatus::Error,
                    FailureReason::Internal,
                    format!("{e:#}"),
                );
                result.duration_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };

        let outcome = self
            .drive(ctx.as_mut(), &mut capturer, target, deadline)
            .await;

        let screenshot = self.capture_screenshot(ctx.as_ref(), run_id, target, phase).await;
        if let Err(e) = ctx.close().await {
            tracing::debug!(target_id = %target.id, "page close failed: {e:#}");
        }

        let events = capturer.events();
        let mut containers = observed_container_ids(events);
        for id in outcome.containers {
            if !containers.contains(&id) {
                containers.push(id);
            }
        }

        let result = CheckResult {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            target_id: target.id.clone(),
            phase,
            status: outcome.status,
            failure: outcome.failure,
            observed_tag_ids: observed_tag_ids(events),
            observed_container_ids: containers,
            primary_event_seen: events.iter().any(|e| e.is_primary()),
            event_count: events.len() as u32,
            issues: outcome.issues,
            duration_ms: started.elapsed().as_millis() as u64,
            screenshot,
            created_at: crate::model::timestamp(),
        };
        tracing::debug!(
            target_id = %target.id,
            %phase,
            status = %result.status,
            events = result.event_count,
            duration_ms = result.duration_ms,
            "check finished"
        );
        result
    }

    async fn drive(
        &self,
        ctx: &mut dyn RenderContext,
        capturer: &mut EventCapturer,
        target: &Target,
        deadline: Instant,
    ) -> Outcome {
        let mut state = CheckState::Navigating;
        trace_state(target, state);

        let nav_budget = remaining(deadline);
        if let Err(failure) = ctx.navigate(&target.url, nav_budget.as_millis() as u64).await {
            trace_state(target, CheckState::Failed);
            let status = match failure {
                NavigationFailure::Timeout { .. } => CheckStatus::Timeout,
                _ => CheckStatus::Error,
            };
            return Outcome::failed(status, failure.reason(), failure.to_string());
        }

        let mut issues = Vec::new();

        state = CheckState::Interacting;
        trace_state(target, state);
        if let Err(e) = ctx.interact().await {
            issues.push(format!("synthetic interaction failed: {e:#}"));
        }
        tokio::time::sleep(self.settings.interaction_delay.min(remaining(deadline))).await;

        state = CheckState::AwaitingContainer;
        trace_state(target, state);
        let wait = self.settings.container_wait.min(remaining(deadline));
        let containers = self
            .await_container(ctx, capturer, target.expected_container_id.as_deref(), wait)
            .await;

        state = CheckState::AwaitingPrimaryEvent;
        trace_state(target, state);
        let validator = Arc::clone(&self.validator);
        let started = Instant::now();
        // Any page_view ends the first wait. A foreign one only earns a short
        // grace for the expected tag to follow.
        let first = capturer
            .wait_for(
                &*ctx,
                |events| events.iter().any(|e| e.is_primary()),
                remaining(deadline),
            )
            .await;
        if !first.timed_out {
            let grace = self.settings.foreign_primary_grace.min(remaining(deadline));
            capturer
                .wait_for(
                    &*ctx,
                    |events| events.iter().any(|e| validator.is_expected_primary(target, e)),
                    grace,
                )
                .await;
        }
        let waited = started.elapsed();

        let mut containers = containers;
        for id in observed_container_ids(capturer.events()) {
            if !containers.iter().any(|c| c.eq_ignore_ascii_case(&id)) {
                containers.push(id);
            }
        }
        let container_present = match &target.expected_container_id {
            Some(expected) => containers.iter().any(|c| c.eq_ignore_ascii_case(expected)),
            None => !containers.is_empty(),
        };
        if let Some(expected) = &target.expected_container_id {
            if containers.is_empty() {
                issues.push(format!("container {expected} not detected"));
            }
        }

        let verdict = self.validator.verdict(target, capturer.events(), &containers);
        let (status, failure) = match verdict {
            Verdict::Pass => (CheckStatus::Passed, None),
            Verdict::Mismatch(detail) => {
                issues.push(detail);
                (CheckStatus::Failed, Some(FailureReason::ConfigMismatch))
            }
            Verdict::Inconclusive if target.tolerate_blocked_first_party && container_present => {
                issues.push(format!(
                    "{} page_view not observed; accepted on container presence",
                    target.expected_tag_id
                ));
                (CheckStatus::Passed, None)
            }
            Verdict::Inconclusive => {
                issues.push(format!(
                    "no {} page_view within {}ms",
                    target.expected_tag_id,
                    waited.as_millis()
                ));
                (CheckStatus::Timeout, Some(FailureReason::EventWaitTimeout))
            }
        };

        trace_state(
            target,
            if status == CheckStatus::Passed {
                CheckState::Done
            } else {
                CheckState::Failed
            },
        );
        Outcome {
            status,
            failure,
            issues,
            containers,
        }
    }

    /// Poll the container registry and captured loader requests until the
    /// expected container (or any container, when none is configured) shows
    /// up or `wait` elapses. Returns every container ID seen.
    async fn await_container(
        &self,
        ctx: &dyn RenderContext,
        capturer: &mut EventCapturer,
        expected: Option<&str>,
        wait: Duration,
    ) -> Vec<String> {
        let until = Instant::now() + wait;
        let mut seen: Vec<String> = Vec::new();
        loop {
            capturer.drain(ctx).await;
            for id in probe_containers(ctx)
                .await
                .into_iter()
                .chain(observed_container_ids(capturer.events()))
            {
                if !seen.contains(&id) {
                    seen.push(id);
                }
            }
            let found = match expected {
                Some(expected) => seen.iter().any(|c| c.eq_ignore_ascii_case(expected)),
                None => !seen.is_empty(),
            };
            let now = Instant::now();
            if found || now >= until {
                return seen;
            }
            tokio::time::sleep(self.settings.poll_interval.min(until - now)).await;
        }
    }

    async fn capture_screenshot(
        &self,
        ctx: &dyn RenderContext,
        run_id: &str,
        target: &Target,
        phase: Phase,
    ) -> Option<String> {
        let png = match ctx.screenshot().await {
            Ok(png) => png,
            Err(e) => {
                tracing::debug!(target_id = %target.id, "screenshot failed: {e:#}");
                return None;
            }
        };
        match self.screenshots.store(run_id, &target.id, phase, &png).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::debug!(target_id = %target.id, "screenshot not stored: {e:#}");
                None
            }
        }
    }
}

async fn probe_containers(ctx: &dyn RenderContext) -> Vec<String> {
    match ctx.execute_js(CONTAINER_PROBE_SCRIPT).await {
        Ok(serde_json::Value::Array(ids)) => ids
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn trace_state(target: &Target, state: CheckState) {
    tracing::trace!(target_id = %target.id, ?state, "check state");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NavigationErrorKind;
    use crate::renderer::scripted::{PageScript, ScriptBook, ScriptedLauncher};
    use crate::renderer::Launcher;
    use crate::screenshots::{NoScreenshots, ScreenshotDir};
    use crate::validate::IdMatchValidator;

    const URL: &str = "https://acme.test/";
    const PAGE_VIEW: &str =
        "https://www.google-analytics.com/g/collect?v=2&tid=G-ABC123&en=page_view";
    const PROMO: &str =
        "https://www.google-analytics.com/g/collect?v=2&tid=G-ABC123&en=view_promotion";
    const GTM: &str = "https://www.googletagmanager.com/gtm.js?id=GTM-XYZ9";

    fn target() -> Target {
        Target {
            id: "acme".into(),
            url: URL.into(),
            expected_tag_id: "G-ABC123".into(),
            expected_container_id: Some("GTM-XYZ9".into()),
            tolerate_blocked_first_party: false,
            active: true,
        }
    }

    fn runner() -> CheckRunner {
        CheckRunner::new(
            CheckSettings::default(),
            Arc::new(IdMatchValidator),
            Arc::new(NoScreenshots),
        )
    }

    async fn check(book: Arc<ScriptBook>, target: &Target, budget: Duration) -> CheckResult {
        let renderer = ScriptedLauncher::new(book).launch(0).await.unwrap();
        let result = runner()
            .run(renderer.as_ref(), "run-1", target, Phase::One, budget)
            .await;
        assert_eq!(renderer.active_contexts(), 0, "page session leaked");
        result
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_passes_on_primary_event() {
        let book = ScriptBook::new();
        book.script(
            URL,
            vec![PageScript::loads()
                .with_hit(GTM, ms(100))
                .with_container("GTM-XYZ9")
                .with_hit(PAGE_VIEW, ms(2_500))],
        );
        let result = check(book, &target(), Duration::from_secs(20)).await;
        assert_eq!(result.status, CheckStatus::Passed);
        assert_eq!(result.failure, None);
        assert!(result.primary_event_seen);
        assert_eq!(result.observed_tag_ids, vec!["G-ABC123"]);
        assert_eq!(result.observed_container_ids, vec!["GTM-XYZ9"]);
        assert!(result.issues.is_empty(), "{:?}", result.issues);
    }

    #[tokio::test(start_paused = true)]
    async fn test_secondary_event_is_not_enough() {
        let book = ScriptBook::new();
        book.script(
            URL,
            vec![PageScript::loads()
                .with_container("GTM-XYZ9")
                .with_hit(PROMO, ms(500))],
        );
        let result = check(book, &target(), Duration::from_secs(20)).await;
        assert_eq!(result.status, CheckStatus::Timeout);
        assert_eq!(result.failure, Some(FailureReason::EventWaitTimeout));
        assert_eq!(result.event_count, 1);
        assert!(!result.primary_event_seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_after_promo_passes() {
        let book = ScriptBook::new();
        book.script(
            URL,
            vec![PageScript::loads()
                .with_hit(PROMO, ms(300))
                .with_hit(PAGE_VIEW, ms(9_000))],
        );
        let result = check(book, &target(), Duration::from_secs(20)).await;
        assert_eq!(result.status, CheckStatus::Passed);
        assert_eq!(result.event_count, 2);
        // Container never showed up: recorded, not fatal
        assert!(result.issues.iter().any(|i| i.contains("GTM-XYZ9")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_tag_is_config_mismatch() {
        let book = ScriptBook::new();
        book.script(
            URL,
            vec![PageScript::loads().with_hit(
                "https://www.google-analytics.com/g/collect?tid=G-WRONG&en=page_view",
                ms(400),
            )],
        );
        let result = check(book, &target(), Duration::from_secs(20)).await;
        assert_eq!(result.status, CheckStatus::Failed);
        assert_eq!(result.failure, Some(FailureReason::ConfigMismatch));
        assert_eq!(result.observed_tag_ids, vec!["G-WRONG"]);
        // The foreign page_view ends the wait after the grace period
        assert!(result.duration_ms < 15_000, "held for {}ms", result.duration_ms);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expected_page_view_within_grace_passes() {
        let book = ScriptBook::new();
        book.script(
            URL,
            vec![PageScript::loads()
                .with_hit(GTM, ms(100))
                .with_container("GTM-XYZ9")
                .with_hit(
                    "https://www.google-analytics.com/g/collect?tid=G-OTHER&en=page_view",
                    ms(2_000),
                )
                .with_hit(PAGE_VIEW, ms(3_500))],
        );
        let result = check(book, &target(), Duration::from_secs(20)).await;
        assert_eq!(result.status, CheckStatus::Passed);
        assert_eq!(result.observed_tag_ids, vec!["G-OTHER", "G-ABC123"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_container_is_config_mismatch() {
        let book = ScriptBook::new();
        book.script(
            URL,
            vec![PageScript::loads()
                .with_hit("https://www.googletagmanager.com/gtm.js?id=GTM-OTHER", ms(100))
                .with_container("GTM-OTHER")
                .with_hit(PAGE_VIEW, ms(2_500))],
        );
        let result = check(book, &target(), Duration::from_secs(20)).await;
        assert_eq!(result.status, CheckStatus::Failed);
        assert_eq!(result.failure, Some(FailureReason::ConfigMismatch));
        assert!(result.primary_event_seen);
        assert_eq!(result.observed_container_ids, vec!["GTM-OTHER"]);
        assert!(
            result.issues.iter().any(|i| i.contains("GTM-OTHER")),
            "{:?}",
            result.issues
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_timeout() {
        let book = ScriptBook::new();
        book.script(URL, vec![PageScript::hangs()]);
        let result = check(book, &target(), Duration::from_secs(20)).await;
        assert_eq!(result.status, CheckStatus::Timeout);
        assert_eq!(result.failure, Some(FailureReason::NavigationTimeout));
        assert!(result.duration_ms >= 20_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dns_failure() {
        let book = ScriptBook::new();
        book.script(
            URL,
            vec![PageScript::fails(NavigationFailure::Dns(
                "net::ERR_NAME_NOT_RESOLVED".into(),
            ))],
        );
        let result = check(book, &target(), Duration::from_secs(20)).await;
        assert_eq!(result.status, CheckStatus::Error);
        assert_eq!(
            result.failure,
            Some(FailureReason::NavigationError(NavigationErrorKind::Dns))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hook_channel_covers_suppressed_debug_channel() {
        let book = ScriptBook::new();
        book.script(
            URL,
            vec![PageScript::loads()
                .with_hit(PAGE_VIEW, ms(1_000))
                .suppress_debug_channel()],
        );
        let result = check(book, &target(), Duration::from_secs(20)).await;
        assert_eq!(result.status, CheckStatus::Passed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tolerant_target_passes_on_container() {
        let book = ScriptBook::new();
        book.script(URL, vec![PageScript::loads().with_container("GTM-XYZ9")]);
        let mut tolerant = target();
        tolerant.tolerate_blocked_first_party = true;
        let result = check(book, &tolerant, Duration::from_secs(20)).await;
        assert_eq!(result.status, CheckStatus::Passed);
        assert!(!result.primary_event_seen);
        assert!(result.issues.iter().any(|i| i.contains("container presence")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_screenshot_taken_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let book = ScriptBook::new();
        book.script(URL, vec![PageScript::loads()]);
        let renderer = ScriptedLauncher::new(book).launch(0).await.unwrap();
        let runner = CheckRunner::new(
            CheckSettings::default(),
            Arc::new(IdMatchValidator),
            Arc::new(ScreenshotDir::new(dir.path())),
        );
        let result = runner
            .run(renderer.as_ref(), "run-1", &target(), Phase::Two, Duration::from_secs(10))
            .await;
        assert_eq!(result.status, CheckStatus::Timeout);
        let path = result.screenshot.expect("screenshot stored");
        assert!(path.ends_with("acme-p2.png"));
    }
}
