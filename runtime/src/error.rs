// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the crawl engine.
//!
//! [`FailureReason`] is the persisted classification of a failed check and
//! drives escalation and retry decisions. The remaining types are the typed
//! errors of the pool, the browser navigation step and the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sub-reason of a navigation that failed before the page committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationErrorKind {
    Dns,
    ConnectionRefused,
    Aborted,
    Other,
}

impl NavigationErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::ConnectionRefused => "connection_refused",
            Self::Aborted => "aborted",
            Self::Other => "other",
        }
    }
}

/// Why a check did not pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NavigationTimeout,
    NavigationError(NavigationErrorKind),
    EventWaitTimeout,
    /// No browser became free in time. Reflects capacity, not site health.
    PoolTimeout,
    /// The page loaded but reported identifiers other than the expected ones.
    ConfigMismatch,
    /// The retry queue gave up on this check.
    PermanentFailure,
    /// Unexpected browser or adapter error.
    Internal,
}

impl FailureReason {
    pub fn is_timeout(self) -> bool {
        matches!(self, Self::NavigationTimeout | Self::EventWaitTimeout)
    }

    /// Whether a phase-1 failure with this reason is re-run in phase 2.
    pub fn escalates(self) -> bool {
        self.is_timeout() || matches!(self, Self::NavigationError(_))
    }

    /// Whether a final failure with this reason goes to the retry queue.
    pub fn is_retryable(self) -> bool {
        self.escalates()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NavigationTimeout => "navigation_timeout",
            Self::NavigationError(NavigationErrorKind::Dns) => "navigation_error:dns",
            Self::NavigationError(NavigationErrorKind::ConnectionRefused) => {
                "navigation_error:connection_refused"
            }
            Self::NavigationError(NavigationErrorKind::Aborted) => "navigation_error:aborted",
            Self::NavigationError(NavigationErrorKind::Other) => "navigation_error:other",
            Self::EventWaitTimeout => "event_wait_timeout",
            Self::PoolTimeout => "pool_timeout",
            Self::ConfigMismatch => "config_mismatch",
            Self::PermanentFailure => "permanent_failure",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = crate::model::UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "navigation_timeout" => Self::NavigationTimeout,
            "navigation_error:dns" => Self::NavigationError(NavigationErrorKind::Dns),
            "navigation_error:connection_refused" => {
                Self::NavigationError(NavigationErrorKind::ConnectionRefused)
            }
            "navigation_error:aborted" => Self::NavigationError(NavigationErrorKind::Aborted),
            "navigation_error:other" => Self::NavigationError(NavigationErrorKind::Other),
            "event_wait_timeout" => Self::EventWaitTimeout,
            "pool_timeout" => Self::PoolTimeout,
            "config_mismatch" => Self::ConfigMismatch,
            "permanent_failure" => Self::PermanentFailure,
            "internal" => Self::Internal,
            other => {
                return Err(crate::model::UnknownVariant {
                    kind: "FailureReason",
                    value: other.to_string(),
                })
            }
        })
    }
}

/// A navigation that did not reach page-load-committed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NavigationFailure {
    #[error("navigation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("DNS resolution failed: {0}")]
    Dns(String),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("load aborted: {0}")]
    Aborted(String),
    #[error("navigation failed: {0}")]
    Other(String),
}

impl NavigationFailure {
    /// Classify a browser error message by its `net::ERR_*` code.
    pub fn classify(message: &str) -> Self {
        let msg = message.to_string();
        if message.contains("ERR_NAME_NOT_RESOLVED")
            || message.contains("ERR_NAME_RESOLUTION_FAILED")
            || message.contains("ERR_ADDRESS_UNREACHABLE")
        {
            Self::Dns(msg)
        } else if message.contains("ERR_CONNECTION_REFUSED")
            || message.contains("ERR_CONNECTION_RESET")
            || message.contains("ERR_CONNECTION_CLOSED")
        {
            Self::ConnectionRefused(msg)
        } else if message.contains("ERR_ABORTED") {
            Self::Aborted(msg)
        } else if message.contains("ERR_TIMED_OUT") || message.contains("ERR_CONNECTION_TIMED_OUT")
        {
            Self::Timeout { timeout_ms: 0 }
        } else {
            Self::Other(msg)
        }
    }

    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Timeout { .. } => FailureReason::NavigationTimeout,
            Self::Dns(_) => FailureReason::NavigationError(NavigationErrorKind::Dns),
            Self::ConnectionRefused(_) => {
                FailureReason::NavigationError(NavigationErrorKind::ConnectionRefused)
            }
            Self::Aborted(_) => FailureReason::NavigationError(NavigationErrorKind::Aborted),
            Self::Other(_) => FailureReason::NavigationError(NavigationErrorKind::Other),
        }
    }
}

/// Browser pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to launch browser {index}: {source:#}")]
    LaunchFailed {
        index: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("no browser became available within {waited_ms}ms")]
    Timeout { waited_ms: u64 },
    /// Releasing an index the caller does not hold is a programming error.
    #[error("browser {0} released but not currently held")]
    NotHeld(usize),
    #[error("browser index {0} out of range")]
    IndexOutOfRange(usize),
    #[error("browser pool is shut down")]
    ShutDown,
}

/// Result store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
    #[error("crawl run not found: {0}")]
    RunNotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_net_errors() {
        assert_eq!(
            NavigationFailure::classify("net::ERR_NAME_NOT_RESOLVED").reason(),
            FailureReason::NavigationError(NavigationErrorKind::Dns)
        );
        assert_eq!(
            NavigationFailure::classify("net::ERR_CONNECTION_REFUSED").reason(),
            FailureReason::NavigationError(NavigationErrorKind::ConnectionRefused)
        );
        assert_eq!(
            NavigationFailure::classify("net::ERR_ABORTED").reason(),
            FailureReason::NavigationError(NavigationErrorKind::Aborted)
        );
        assert_eq!(
            NavigationFailure::classify("net::ERR_TIMED_OUT").reason(),
            FailureReason::NavigationTimeout
        );
        assert!(matches!(
            NavigationFailure::classify("something odd"),
            NavigationFailure::Other(_)
        ));
    }

    #[test]
    fn test_escalation_policy() {
        assert!(FailureReason::NavigationTimeout.escalates());
        assert!(FailureReason::EventWaitTimeout.escalates());
        assert!(FailureReason::NavigationError(NavigationErrorKind::Dns).escalates());
        assert!(!FailureReason::ConfigMismatch.escalates());
        assert!(!FailureReason::PoolTimeout.escalates());
        assert!(!FailureReason::PoolTimeout.is_retryable());
        assert!(!FailureReason::NavigationError(NavigationErrorKind::Dns).is_timeout());
    }

    #[test]
    fn test_reason_string_roundtrip() {
        for r in [
            FailureReason::NavigationTimeout,
            FailureReason::NavigationError(NavigationErrorKind::ConnectionRefused),
            FailureReason::EventWaitTimeout,
            FailureReason::PoolTimeout,
            FailureReason::ConfigMismatch,
            FailureReason::PermanentFailure,
            FailureReason::Internal,
        ] {
            assert_eq!(r.as_str().parse::<FailureReason>().unwrap(), r);
        }
    }
}
