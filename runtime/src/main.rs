// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use tagwatch_runtime::cli;
use tagwatch_runtime::config::{clamp_pool_size, Settings};

#[derive(Parser)]
#[command(
    name = "tagwatch",
    about = "Tagwatch: verifies that a fleet of websites still fires its analytics tags",
    version,
    after_help = "Run 'tagwatch <command> --help' for details on each command.\nSettings are read from TAGWATCH_* environment variables."
)]
struct Cli {
    /// Output results as JSON (machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Number of browser instances (1-16)
    #[arg(long, global = true)]
    pool_size: Option<usize>,

    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API, retry scheduler and scheduled crawls
    Serve {
        /// HTTP REST API port
        #[arg(long, default_value_t = cli::serve::DEFAULT_HTTP_PORT)]
        http_port: u16,
    },
    /// Run one crawl in the foreground
    Run {
        /// Target list (JSON); defaults to TAGWATCH_TARGETS
        #[arg(long)]
        targets: Option<PathBuf>,
        /// Only check this target ID. Can be repeated.
        #[arg(long = "target")]
        only: Vec<String>,
    },
    /// Close runs left unfinished by a crashed process
    Recover,
    /// Process due retry-queue entries once
    ProcessQueue,
    /// Show recent runs, or one run in detail
    Status {
        /// Run to show
        run_id: Option<String>,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type (bash, zsh, fish, powershell)
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set global flags via environment variables so all modules can check them
    if cli.json {
        std::env::set_var("TAGWATCH_JSON", "1");
    }
    if cli.quiet {
        std::env::set_var("TAGWATCH_QUIET", "1");
    }
    if cli.verbose {
        std::env::set_var("TAGWATCH_VERBOSE", "1");
    }
    if cli.no_color {
        std::env::set_var("TAGWATCH_NO_COLOR", "1");
    }
    cli::init_tracing();

    let mut settings = Settings::from_env();
    if let Some(size) = cli.pool_size {
        settings.pool_size = clamp_pool_size(size);
    }
    if let Some(db) = cli.db {
        settings.db_path = db;
    }

    let result = match cli.command {
        Commands::Serve { http_port } => cli::serve::run(settings, http_port).await,
        Commands::Run { targets, only } => cli::run_cmd::run(settings, targets, only).await,
        Commands::Recover => cli::recover_cmd::run(settings).await,
        Commands::ProcessQueue => cli::queue_cmd::run(settings).await,
        Commands::Status { run_id } => cli::status::run(settings, run_id).await,
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "tagwatch", &mut std::io::stdout());
            Ok(())
        }
    };

    // Consistent exit codes: 0=success, 1=error
    if let Err(e) = &result {
        if !cli::output::is_quiet() && !cli::output::is_json() {
            eprintln!("  Error: {e:#}");
        }
        if cli::output::is_json() {
            cli::output::print_json(&serde_json::json!({
                "error": true,
                "message": format!("{e:#}"),
            }));
        }
        std::process::exit(1);
    }

    result
}
