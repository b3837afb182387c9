// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! `tagwatch status [RUN_ID]`: show recent runs or one run in detail.

use crate::cli::app::open_store;
use crate::cli::output::{self, Styled};
use crate::config::Settings;
use anyhow::{Context, Result};

const RECENT_RUNS: usize = 10;

pub async fn run(settings: Settings, run_id: Option<String>) -> Result<()> {
    let store = open_store(&settings)?;
    let s = Styled::new();

    let Some(run_id) = run_id else {
        let runs = store.list_runs(RECENT_RUNS)?;
        let retries = store.retry_status_counts()?;
        if output::is_json() {
            let retries: serde_json::Map<String, serde_json::Value> = retries
                .iter()
                .map(|(status, n)| (status.to_string(), serde_json::json!(n)))
                .collect();
            output::print_json(&serde_json::json!({ "runs": runs, "retry_queue": retries }));
            return Ok(());
        }
        if runs.is_empty() {
            eprintln!("  No runs recorded in {}", settings.db_path.display());
        }
        for run in &runs {
            eprintln!(
                "  {} {:<10} {}/{} checked, {} failed  {}",
                run.id,
                s.status(run.status.as_str()),
                run.counters.completed_properties,
                run.counters.total_properties,
                run.counters.failed_properties,
                s.dim(&run.started_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            );
            if let Some(warning) = &run.warning {
                eprintln!("    {} {warning}", s.warn_sym());
            }
        }
        if !retries.is_empty() {
            let parts: Vec<String> = retries
                .iter()
                .map(|(status, n)| format!("{n} {status}"))
                .collect();
            eprintln!("  Retry queue: {}", parts.join(", "));
        }
        return Ok(());
    };

    let run = store
        .get_run(&run_id)?
        .with_context(|| format!("run {run_id} not found"))?;
    let results = store.authoritative_results(&run_id)?;
    let retries = store.retries_for_run(&run_id)?;

    if output::is_json() {
        output::print_json(&serde_json::json!({
            "run": run,
            "results": results,
            "retries": retries,
        }));
        return Ok(());
    }

    eprintln!(
        "  {} {}  {}/{} checked, {} failed",
        s.bold(&run.id),
        s.status(run.status.as_str()),
        run.counters.completed_properties,
        run.counters.total_properties,
        run.counters.failed_properties
    );
    if let Some(message) = &run.message {
        eprintln!("    {}", s.dim(message));
    }
    if let Some(warning) = &run.warning {
        eprintln!("    {} {warning}", s.warn_sym());
    }
    for result in &results {
        eprintln!(
            "  {:<24} {:<8} {} {}",
            result.target_id,
            s.status(result.status.as_str()),
            result.phase,
            result.issues.join("; ")
        );
    }
    for retry in &retries {
        eprintln!(
            "  retry {:<18} {} ({} failures, next {})",
            retry.target_id,
            s.status(retry.status.as_str()),
            retry.failure_count,
            retry.next_retry_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}
