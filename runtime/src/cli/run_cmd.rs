// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! `tagwatch run`: execute one crawl in the foreground and print a summary.

use crate::cli::app::{report_recovery, App};
use crate::cli::output::{self, Styled};
use crate::config::Settings;
use crate::model::CheckStatus;
use crate::progress::{ProgressEventKind, ProgressReceiver};
use anyhow::{bail, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;

pub async fn run(
    mut settings: Settings,
    targets_path: Option<PathBuf>,
    only: Vec<String>,
) -> Result<()> {
    if let Some(path) = targets_path {
        settings.targets_path = path;
    }
    let (app, report) = App::start(settings).await?;
    report_recovery(&report);

    let outcome = execute(&app, only).await;
    app.shutdown().await;
    outcome
}

async fn execute(app: &App, only: Vec<String>) -> Result<()> {
    let mut targets = app.targets.active_targets().await?;
    if !only.is_empty() {
        let unknown: Vec<&String> = only
            .iter()
            .filter(|id| !targets.iter().any(|t| &t.id == *id))
            .collect();
        if !unknown.is_empty() {
            bail!(
                "unknown or inactive targets: {}",
                unknown
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        targets.retain(|t| only.contains(&t.id));
    }
    if targets.is_empty() {
        bail!(
            "no active targets in {}",
            app.settings.targets_path.display()
        );
    }

    let bar = (!output::is_quiet() && !output::is_json())
        .then(|| progress_bar(targets.len() as u64, app.progress.subscribe()));

    let cancel = {
        let orchestrator = Arc::clone(&app.orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, letting in-flight checks finish");
                for run_id in orchestrator.live_runs() {
                    orchestrator.stop(&run_id);
                }
            }
        })
    };
    let summary = app.orchestrator.run_to_completion(targets).await;
    cancel.abort();
    let summary = summary?;
    if let Some((bar, task)) = bar {
        task.abort();
        bar.finish_and_clear();
    }

    let results = app.store.authoritative_results(&summary.run_id)?;
    if output::is_json() {
        output::print_json(&serde_json::json!({
            "summary": summary,
            "results": results,
        }));
        return Ok(());
    }
    if output::is_quiet() {
        return Ok(());
    }

    let s = Styled::new();
    eprintln!();
    for result in &results {
        let sym = if result.status == CheckStatus::Passed {
            s.ok_sym()
        } else {
            s.err_sym()
        };
        let detail = result
            .failure
            .map(|f| format!(" ({f})"))
            .unwrap_or_default();
        eprintln!(
            "  {sym} {:<24} {}{} {}",
            result.target_id,
            s.status(result.status.as_str()),
            detail,
            s.dim(&format!("{} ms, {}", result.duration_ms, result.phase)),
        );
    }
    eprintln!();
    eprintln!(
        "  Run {} {}: {} checked, {} failed, {} escalated, {} queued for retry",
        s.bold(&summary.run_id),
        s.status(summary.status.as_str()),
        summary.counters.completed_properties,
        summary.counters.failed_properties,
        summary.escalated,
        summary.enqueued_for_retry,
    );
    Ok(())
}

/// A bar driven by progress snapshots on a background task.
fn progress_bar(
    total: u64,
    mut rx: ProgressReceiver,
) -> (ProgressBar, tokio::task::JoinHandle<()>) {
    let bar = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template("  {spinner} {msg} [{bar:30}] {pos}/{len}") {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.set_message("phase 1");
    let driven = bar.clone();
    let task = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event.event {
                ProgressEventKind::PhaseStarted { phase, total } => {
                    driven.set_message(phase.to_string());
                    driven.set_length(total as u64);
                    driven.set_position(0);
                }
                ProgressEventKind::Snapshot { completed, .. } => {
                    driven.set_position(completed as u64);
                }
                ProgressEventKind::Warning { message } => driven.println(format!("  ! {message}")),
                _ => {}
            }
        }
    });
    (bar, task)
}
