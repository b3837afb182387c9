// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Core data model: targets, crawl runs, check results, captured events and
//! retry queue entries.
//!
//! Every status field is a closed enum. Persisted enums round-trip through
//! [`as_str`](RunStatus::as_str) / [`FromStr`] so the SQLite rows stay
//! human-readable.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::FailureReason;

/// One monitored site and the analytics configuration it is expected to emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub url: String,
    /// Expected analytics tag ID (e.g. `G-ABC123`).
    pub expected_tag_id: String,
    /// Expected tag-manager container ID (e.g. `GTM-XYZ9`), when the site uses one.
    #[serde(default)]
    pub expected_container_id: Option<String>,
    /// Accept a run without the primary event when the container registered.
    /// Used for sites whose first-party collection endpoint is blocked for
    /// headless browsers.
    #[serde(default)]
    pub tolerate_blocked_first_party: bool,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Current time at the microsecond precision records are stored with.
pub fn timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Which pass of a run produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Fast first pass over every target.
    One = 1,
    /// Longer-budget pass over the timed-out subset.
    Two = 2,
}

impl Phase {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase {}", self.as_u8())
    }
}

/// Declares a string-backed status enum with `as_str`, `Display` and `FromStr`.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// A persisted enum column held a value this build does not know.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

string_enum! {
    /// Lifecycle of a crawl run. Every status other than `Running` is terminal.
    RunStatus {
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

string_enum! {
    /// Validation outcome of a single check.
    CheckStatus {
        Passed => "passed",
        Failed => "failed",
        Error => "error",
        Timeout => "timeout",
    }
}

string_enum! {
    /// Lifecycle of a retry queue entry.
    RetryStatus {
        Pending => "pending",
        Retrying => "retrying",
        Resolved => "resolved",
        PermanentFailure => "permanent_failure",
    }
}

string_enum! {
    /// Which observation mechanism saw an outbound request.
    CaptureChannel {
        /// Network-level observer on the browser debug protocol.
        DebugProtocol => "debug_protocol",
        /// In-page hook around fetch / XHR / sendBeacon.
        PageHook => "page_hook",
    }
}

/// Aggregate counters of a run. Always derivable from its check results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    /// Targets with a result (planned target count while a run is live).
    pub total_properties: u32,
    /// Targets whose check reached a terminal result.
    pub completed_properties: u32,
    /// Targets whose authoritative result is anything other than `passed`.
    pub failed_properties: u32,
}

impl RunCounters {
    /// Recompute counters from one authoritative result per target.
    pub fn tally<'a>(results: impl IntoIterator<Item = &'a CheckResult>) -> Self {
        let mut counters = Self::default();
        for result in results {
            counters.total_properties += 1;
            counters.completed_properties += 1;
            if result.status != CheckStatus::Passed {
                counters.failed_properties += 1;
            }
        }
        counters
    }
}

/// One execution cycle over the active targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlRun {
    pub id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub counters: RunCounters,
    /// Explanation attached on abnormal termination or recovery.
    pub message: Option<String>,
    /// Actionable warning, e.g. escalations lost across a restart.
    pub warning: Option<String>,
}

impl CrawlRun {
    pub fn start(id: impl Into<String>, planned: u32) -> Self {
        Self {
            id: id.into(),
            status: RunStatus::Running,
            started_at: timestamp(),
            ended_at: None,
            counters: RunCounters {
                total_properties: planned,
                ..RunCounters::default()
            },
            message: None,
            warning: None,
        }
    }
}

/// Outcome of checking one target within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub id: String,
    pub run_id: String,
    pub target_id: String,
    pub phase: Phase,
    pub status: CheckStatus,
    pub failure: Option<FailureReason>,
    pub observed_tag_ids: Vec<String>,
    pub observed_container_ids: Vec<String>,
    pub primary_event_seen: bool,
    pub event_count: u32,
    pub issues: Vec<String>,
    pub duration_ms: u64,
    pub screenshot: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CheckResult {
    /// A result that carries only a failure, used when no browser work happened.
    pub fn failed(
        run_id: &str,
        target_id: &str,
        phase: Phase,
        status: CheckStatus,
        failure: FailureReason,
        issue: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            target_id: target_id.to_string(),
            phase,
            status,
            failure: Some(failure),
            observed_tag_ids: Vec::new(),
            observed_container_ids: Vec::new(),
            primary_event_seen: false,
            event_count: 0,
            issues: vec![issue.into()],
            duration_ms: 0,
            screenshot: None,
            created_at: timestamp(),
        }
    }
}

/// What kind of analytics request an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A measurement hit sent to the collection endpoint.
    Hit,
    /// The tag-manager container loader script.
    ContainerLoad,
}

/// One observed outbound analytics request, parsed. Lives for one check only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedEvent {
    pub channel: CaptureChannel,
    pub kind: EventKind,
    pub url: String,
    /// Measurement ID (`tid`) for hits, container ID (`id`) for loader requests.
    pub tag_id: Option<String>,
    /// Event name (`en`), e.g. `page_view`.
    pub event_name: Option<String>,
    /// Flat query parameters of the request (plus body line for batched hits).
    pub params: BTreeMap<String, String>,
    /// Implementation-specific parameters (`ep.*`, `epn.*`, `up.*`, JSON `cd`).
    pub custom: BTreeMap<String, serde_json::Value>,
    pub observed_at: DateTime<Utc>,
}

impl CapturedEvent {
    /// True for the page-load measurement hit.
    pub fn is_primary(&self) -> bool {
        self.kind == EventKind::Hit && self.event_name.as_deref() == Some(PRIMARY_EVENT_NAME)
    }
}

/// Event name of the page-load hit.
pub const PRIMARY_EVENT_NAME: &str = "page_view";

/// A check that failed for a transient reason, retried across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryEntry {
    pub id: String,
    pub target_id: String,
    /// The run whose check first failed.
    pub run_id: String,
    pub reason: FailureReason,
    pub status: RetryStatus,
    pub failure_count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
