// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! `tagwatch serve`, the long-running service: HTTP API, retry scheduler and
//! optional scheduled crawls.

use crate::cli::app::{report_recovery, App};
use crate::cli::output::{self, Styled};
use crate::cli::pidfile::PidGuard;
use crate::config::Settings;
use crate::orchestrator::Orchestrator;
use crate::rest::{self, AppState};
use crate::targets::TargetSource;
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

pub const DEFAULT_HTTP_PORT: u16 = 7878;

pub async fn run(settings: Settings, http_port: u16) -> Result<()> {
    let s = Styled::new();
    info!("starting tagwatch v{}", env!("CARGO_PKG_VERSION"));

    settings.ensure_dirs()?;
    let _pid = PidGuard::acquire(&settings.db_path)?;
    let (app, report) = App::start(settings).await?;
    report_recovery(&report);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let retry_task = {
        let queue = Arc::clone(&app.retry_queue);
        let interval = app.settings.retry_interval;
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { queue.run_every(interval, rx).await })
    };

    let crawl_task = app.settings.crawl_interval.map(|interval| {
        let orchestrator = Arc::clone(&app.orchestrator);
        let targets = Arc::clone(&app.targets);
        let rx = shutdown_rx.clone();
        tokio::spawn(scheduled_crawls(orchestrator, targets, interval, rx))
    });

    let state = Arc::new(AppState {
        orchestrator: Arc::clone(&app.orchestrator),
        retry_queue: Arc::clone(&app.retry_queue),
        targets: Arc::clone(&app.targets),
        store: Arc::clone(&app.store),
        pool: Arc::clone(&app.pool),
        progress: app.progress.clone(),
        started_at: Instant::now(),
    });

    if !output::is_quiet() {
        eprintln!(
            "  {} tagwatch v{} serving on http://127.0.0.1:{http_port} ({} browsers)",
            s.ok_sym(),
            env!("CARGO_PKG_VERSION"),
            app.pool.size()
        );
    }

    let result = rest::start(http_port, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    })
    .await;

    let _ = shutdown_tx.send(true);
    let _ = retry_task.await;
    if let Some(task) = crawl_task {
        let _ = task.await;
    }
    for run_id in app.orchestrator.live_runs() {
        // Left `running`; closed by recovery on the next start
        warn!(run_id, "run interrupted by shutdown");
    }
    app.shutdown().await;
    result
}

/// Start a crawl over the active targets every `interval`. A tick is skipped
/// while a previous run is still live.
async fn scheduled_crawls(
    orchestrator: Arc<Orchestrator>,
    targets: Arc<dyn TargetSource>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !orchestrator.live_runs().is_empty() {
                    info!("previous crawl still running, skipping scheduled crawl");
                    continue;
                }
                match targets.active_targets().await {
                    Ok(list) if list.is_empty() => {
                        warn!("no active targets, skipping scheduled crawl")
                    }
                    Ok(list) => match orchestrator.start_run(list) {
                        Ok(run_id) => info!(run_id, "scheduled crawl started"),
                        Err(e) => warn!("failed to start scheduled crawl: {e}"),
                    },
                    Err(e) => warn!("failed to load targets: {e:#}"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
