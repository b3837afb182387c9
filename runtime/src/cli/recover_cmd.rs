// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! `tagwatch recover`: close runs left `running` by a crashed process.

use crate::cli::app::open_store;
use crate::cli::output::{self, Styled};
use crate::cli::pidfile;
use crate::config::Settings;
use crate::recovery;
use anyhow::{bail, Result};

pub async fn run(settings: Settings) -> Result<()> {
    if let Some(pid) = pidfile::live_server(&settings.db_path) {
        bail!(
            "tagwatch serve (PID {pid}) is using {}; its runs are not interrupted",
            settings.db_path.display()
        );
    }
    let store = open_store(&settings)?;
    let report = recovery::recover(&store)?;

    if output::is_json() {
        output::print_json(&report);
        return Ok(());
    }
    if output::is_quiet() {
        return Ok(());
    }

    let s = Styled::new();
    if report.runs.is_empty() && report.errors.is_empty() {
        eprintln!("  {} No interrupted runs", s.ok_sym());
    }
    for run in &report.runs {
        eprintln!(
            "  {} {} {} ({} results, {} duplicates removed)",
            s.ok_sym(),
            run.run_id,
            s.status(run.status.as_str()),
            run.counters.total_properties,
            run.removed_duplicates
        );
        if !run.lost_escalations.is_empty() {
            eprintln!(
                "    {} phase-1 timeouts never re-checked: {}",
                s.warn_sym(),
                run.lost_escalations.join(", ")
            );
        }
    }
    for (run_id, err) in &report.errors {
        eprintln!("  {} {run_id}: {err}", s.err_sym());
    }
    if report.requeued_retries > 0 {
        eprintln!(
            "  {} {} interrupted retries returned to the queue",
            s.ok_sym(),
            report.requeued_retries
        );
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::{CrawlRun, RunStatus};

    fn settings(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::from_env();
        settings.data_dir = dir.to_path_buf();
        settings.db_path = dir.join("tagwatch.db");
        settings.screenshot_dir = dir.join("screenshots");
        settings
    }

    #[tokio::test]
    async fn test_refuses_while_server_is_live() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let store = open_store(&settings).unwrap();
        store.create_run(&CrawlRun::start("live", 3)).unwrap();

        let mut server = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(
            pidfile::pid_file_path(&settings.db_path),
            server.id().to_string(),
        )
        .unwrap();

        let err = run(settings.clone()).await.unwrap_err();
        assert!(err.to_string().contains(&server.id().to_string()));
        assert_eq!(
            store.get_run("live").unwrap().unwrap().status,
            RunStatus::Running
        );

        server.kill().unwrap();
        server.wait().unwrap();
        run(settings).await.unwrap();
        assert_eq!(
            store.get_run("live").unwrap().unwrap().status,
            RunStatus::Failed
        );
    }
}
