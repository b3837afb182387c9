// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Wires settings into a running engine: store, recovery, browser pool,
//! runner, orchestrator and retry queue.

use crate::cli::pidfile;
use crate::config::Settings;
use crate::orchestrator::Orchestrator;
use crate::pool::BrowserPool;
use crate::progress::{self, ProgressSender};
use crate::recovery::{self, RecoveryReport};
use crate::renderer::chromium::ChromiumLauncher;
use crate::retry::RetryQueue;
use crate::runner::CheckRunner;
use crate::screenshots::ScreenshotDir;
use crate::store::Store;
use crate::targets::{JsonTargetFile, TargetSource};
use crate::validate::IdMatchValidator;
use anyhow::{Context, Result};
use std::sync::Arc;

pub struct App {
    pub settings: Settings,
    pub store: Arc<Store>,
    pub pool: Arc<BrowserPool>,
    pub targets: Arc<dyn TargetSource>,
    pub orchestrator: Arc<Orchestrator>,
    pub retry_queue: Arc<RetryQueue>,
    pub progress: ProgressSender,
}

/// Open the result store configured in `settings`.
pub fn open_store(settings: &Settings) -> Result<Arc<Store>> {
    settings
        .ensure_dirs()
        .with_context(|| format!("failed to create {}", settings.data_dir.display()))?;
    let store = Store::open(&settings.db_path)
        .with_context(|| format!("failed to open {}", settings.db_path.display()))?;
    Ok(Arc::new(store))
}

impl App {
    /// Recover interrupted runs, then launch the browser pool.
    ///
    /// Recovery is skipped while another process serves the same database:
    /// its runs are live, not interrupted. A pool launch failure is fatal.
    pub async fn start(settings: Settings) -> Result<(Self, RecoveryReport)> {
        let store = open_store(&settings)?;
        let report = match pidfile::live_server(&settings.db_path) {
            Some(pid) => {
                tracing::warn!(pid, "tagwatch serve owns this database, skipping recovery");
                RecoveryReport::default()
            }
            None => recovery::recover(&store).context("startup recovery failed")?,
        };

        let launcher = ChromiumLauncher::new(settings.browser.clone());
        let pool = BrowserPool::initialize(&launcher, settings.pool_size)
            .await
            .context("browser pool failed to start")?;
        let pool = Arc::new(pool);

        let runner = Arc::new(CheckRunner::new(
            settings.check,
            Arc::new(IdMatchValidator),
            Arc::new(ScreenshotDir::new(&settings.screenshot_dir)),
        ));
        let targets: Arc<dyn TargetSource> =
            Arc::new(JsonTargetFile::new(&settings.targets_path));
        let (progress, _) = progress::channel();

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&pool),
            Arc::clone(&runner),
            Arc::clone(&store),
            settings.crawl,
            Some(progress.clone()),
        ));
        let retry_queue = Arc::new(RetryQueue::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            runner,
            Arc::clone(&targets),
            settings.crawl,
        ));

        Ok((
            Self {
                settings,
                store,
                pool,
                targets,
                orchestrator,
                retry_queue,
                progress,
            },
            report,
        ))
    }

    pub async fn shutdown(&self) {
        let failures = self.pool.shutdown().await;
        if failures > 0 {
            tracing::warn!(failures, "some browsers did not shut down cleanly");
        }
    }
}

/// Print a one-line summary of what startup recovery did.
pub fn report_recovery(report: &RecoveryReport) {
    if crate::cli::output::is_quiet() || crate::cli::output::is_json() || report.runs.is_empty()
    {
        return;
    }
    let s = crate::cli::output::Styled::new();
    eprintln!(
        "  {} Recovered {} interrupted run(s)",
        s.ok_sym(),
        report.runs.len()
    );
    for run in report.warnings() {
        eprintln!(
            "  {} Run {} lost {} phase-2 check(s): {}",
            s.warn_sym(),
            run.run_id,
            run.lost_escalations.len(),
            run.lost_escalations.join(", ")
        );
    }
    for (run_id, err) in &report.errors {
        eprintln!("  {} Run {run_id} could not be recovered: {err}", s.err_sym());
    }
}
