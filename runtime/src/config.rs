// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Runtime settings resolved from `TAGWATCH_*` environment variables.
//!
//! CLI flags override individual fields after [`Settings::from_env`].

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_POOL_SIZE: usize = 4;
const MAX_POOL_SIZE: usize = 16;
const DEFAULT_PHASE1_BUDGET_MS: u64 = 20_000;
const DEFAULT_PHASE2_BUDGET_MS: u64 = 80_000;
const DEFAULT_POOL_ACQUIRE_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_CONTAINER_WAIT_MS: u64 = 5_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_INTERACTION_DELAY_MS: u64 = 1_500;
const DEFAULT_FOREIGN_PRIMARY_GRACE_MS: u64 = 3_000;
const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 5;
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 15 * 60;
const DEFAULT_RETRY_BATCH: usize = 50;

/// Desktop Chrome user agent presented by every browser instance.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Per-instance browser setup.
#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub chromium_path: Option<PathBuf>,
    pub user_agent: String,
    pub window: (u32, u32),
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            chromium_path: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            window: (1366, 768),
        }
    }
}

/// Timing knobs of a single check.
#[derive(Debug, Clone, Copy)]
pub struct CheckSettings {
    /// Upper bound on the wait for the tag-manager container.
    pub container_wait: Duration,
    /// Capture poll granularity.
    pub poll_interval: Duration,
    /// Settle time after the synthetic interaction.
    pub interaction_delay: Duration,
    /// How long to keep waiting for the expected page_view once a page_view
    /// for another tag has arrived.
    pub foreign_primary_grace: Duration,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            container_wait: Duration::from_millis(DEFAULT_CONTAINER_WAIT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            interaction_delay: Duration::from_millis(DEFAULT_INTERACTION_DELAY_MS),
            foreign_primary_grace: Duration::from_millis(DEFAULT_FOREIGN_PRIMARY_GRACE_MS),
        }
    }
}

/// Orchestration knobs shared by the orchestrator and the retry queue.
#[derive(Debug, Clone, Copy)]
pub struct CrawlSettings {
    pub phase1_budget: Duration,
    pub phase2_budget: Duration,
    pub pool_acquire_timeout: Duration,
    pub progress_interval: Duration,
    pub retry_batch: usize,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            phase1_budget: Duration::from_millis(DEFAULT_PHASE1_BUDGET_MS),
            phase2_budget: Duration::from_millis(DEFAULT_PHASE2_BUDGET_MS),
            pool_acquire_timeout: Duration::from_millis(DEFAULT_POOL_ACQUIRE_TIMEOUT_MS),
            progress_interval: Duration::from_secs(DEFAULT_PROGRESS_INTERVAL_SECS),
            retry_batch: DEFAULT_RETRY_BATCH,
        }
    }
}

/// All runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub screenshot_dir: PathBuf,
    pub targets_path: PathBuf,
    pub pool_size: usize,
    pub crawl: CrawlSettings,
    pub check: CheckSettings,
    pub browser: BrowserSettings,
    pub retry_interval: Duration,
    /// Scheduled crawl cadence for `serve`; `None` disables scheduled crawls.
    pub crawl_interval: Option<Duration>,
}

impl Settings {
    pub fn from_env() -> Self {
        let data_dir = read_env_string("TAGWATCH_DATA_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let db_path = read_env_path("TAGWATCH_DB").unwrap_or_else(|| data_dir.join("tagwatch.db"));
        let screenshot_dir = read_env_path("TAGWATCH_SCREENSHOT_DIR")
            .unwrap_or_else(|| data_dir.join("screenshots"));
        let targets_path =
            read_env_path("TAGWATCH_TARGETS").unwrap_or_else(|| data_dir.join("targets.json"));

        let crawl_interval_secs = read_env_u64("TAGWATCH_CRAWL_INTERVAL_SECS", 0);

        Self {
            data_dir,
            db_path,
            screenshot_dir,
            targets_path,
            pool_size: clamp_pool_size(read_env_usize("TAGWATCH_POOL_SIZE", DEFAULT_POOL_SIZE)),
            crawl: CrawlSettings {
                phase1_budget: Duration::from_millis(read_env_u64(
                    "TAGWATCH_PHASE1_BUDGET_MS",
                    DEFAULT_PHASE1_BUDGET_MS,
                )),
                phase2_budget: Duration::from_millis(read_env_u64(
                    "TAGWATCH_PHASE2_BUDGET_MS",
                    DEFAULT_PHASE2_BUDGET_MS,
                )),
                pool_acquire_timeout: Duration::from_millis(read_env_u64(
                    "TAGWATCH_POOL_ACQUIRE_TIMEOUT_MS",
                    DEFAULT_POOL_ACQUIRE_TIMEOUT_MS,
                )),
                progress_interval: Duration::from_secs(
                    read_env_u64(
                        "TAGWATCH_PROGRESS_INTERVAL_SECS",
                        DEFAULT_PROGRESS_INTERVAL_SECS,
                    )
                    .max(1),
                ),
                retry_batch: read_env_usize("TAGWATCH_RETRY_BATCH", DEFAULT_RETRY_BATCH).max(1),
            },
            check: CheckSettings {
                container_wait: Duration::from_millis(read_env_u64(
                    "TAGWATCH_CONTAINER_WAIT_MS",
                    DEFAULT_CONTAINER_WAIT_MS,
                )),
                poll_interval: Duration::from_millis(
                    read_env_u64("TAGWATCH_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS).max(50),
                ),
                interaction_delay: Duration::from_millis(DEFAULT_INTERACTION_DELAY_MS),
                foreign_primary_grace: Duration::from_millis(DEFAULT_FOREIGN_PRIMARY_GRACE_MS),
            },
            browser: BrowserSettings {
                chromium_path: read_env_path("TAGWATCH_CHROMIUM_PATH"),
                user_agent: read_env_string("TAGWATCH_USER_AGENT")
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
                ..BrowserSettings::default()
            },
            retry_interval: Duration::from_secs(
                read_env_u64("TAGWATCH_RETRY_INTERVAL_SECS", DEFAULT_RETRY_INTERVAL_SECS).max(1),
            ),
            crawl_interval: (crawl_interval_secs > 0)
                .then(|| Duration::from_secs(crawl_interval_secs)),
        }
    }

    /// Create the data and screenshot directories.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(&self.screenshot_dir)
    }
}

pub fn clamp_pool_size(size: usize) -> usize {
    size.clamp(1, MAX_POOL_SIZE)
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tagwatch")
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_usize(name: &str, default_value: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default_value)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string())
}

fn read_env_path(name: &str) -> Option<PathBuf> {
    read_env_string(name)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}
