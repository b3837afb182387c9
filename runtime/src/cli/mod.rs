// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! CLI subcommand implementations for the tagwatch binary.

pub mod app;
pub mod output;
pub mod pidfile;
pub mod queue_cmd;
pub mod recover_cmd;
pub mod run_cmd;
pub mod serve;
pub mod status;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Logs go to stderr; set
/// `TAGWATCH_LOG_FORMAT=json` for one JSON object per line.
pub fn init_tracing() {
    let default = if output::is_verbose() {
        "tagwatch_runtime=debug"
    } else {
        "tagwatch_runtime=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let json = std::env::var("TAGWATCH_LOG_FORMAT").is_ok_and(|v| v == "json");

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    // A second init (tests, embedding) keeps the first subscriber
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
