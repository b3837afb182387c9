// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! `tagwatch process-queue`: run one retry batch now.

use crate::cli::app::{report_recovery, App};
use crate::cli::output::{self, Styled};
use crate::cli::pidfile;
use crate::config::Settings;
use anyhow::{bail, Result};

pub async fn run(settings: Settings) -> Result<()> {
    // Only one process drains the queue
    if let Some(pid) = pidfile::live_server(&settings.db_path) {
        bail!(
            "tagwatch serve (PID {pid}) owns the retry queue; \
             use POST /api/v1/retry-queue/process instead"
        );
    }
    let (app, recovery) = App::start(settings).await?;
    report_recovery(&recovery);

    let outcome = app.retry_queue.process_queue().await;
    app.shutdown().await;
    let report = outcome?;

    if output::is_json() {
        output::print_json(&report);
        return Ok(());
    }
    if !output::is_quiet() {
        let s = Styled::new();
        eprintln!(
            "  {} {} attempted: {} resolved, {} rescheduled, {} abandoned, {} deferred",
            s.ok_sym(),
            report.attempted,
            report.resolved,
            report.rescheduled,
            report.permanent_failures,
            report.deferred
        );
    }
    Ok(())
}
