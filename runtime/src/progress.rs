// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Progress event types and broadcast channel for live run telemetry.
//!
//! The orchestrator emits `ProgressEvent`s while a run executes. They flow
//! through a `tokio::sync::broadcast` channel to every subscriber (CLI
//! progress bar, SSE clients). When no subscriber exists, events are dropped.

use crate::model::{CheckStatus, Phase, RunCounters, RunStatus};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A progress event emitted during a crawl run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The run this event belongs to.
    pub run_id: String,
    /// Monotonically increasing sequence number within the run.
    pub seq: u64,
    pub event: ProgressEventKind,
}

/// The specific kind of progress event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProgressEventKind {
    RunStarted { planned: u32 },
    /// A phase began dispatching `total` checks.
    PhaseStarted { phase: Phase, total: u32 },
    /// Aggregate counters, emitted on every completion and on a fixed interval.
    Snapshot {
        phase: Phase,
        completed: u32,
        total: u32,
        failed: u32,
        elapsed_ms: u64,
    },
    CheckFinished {
        target_id: String,
        phase: Phase,
        status: CheckStatus,
    },
    RunFinished {
        status: RunStatus,
        counters: RunCounters,
    },
    /// A non-fatal problem, e.g. a result that could not be persisted.
    Warning { message: String },
}

pub type ProgressSender = tokio::sync::broadcast::Sender<ProgressEvent>;

pub type ProgressReceiver = tokio::sync::broadcast::Receiver<ProgressEvent>;

/// Create a new progress broadcast channel.
///
/// 1024 events cover the snapshots and per-check events of a large run
/// between two reads of a slow subscriber.
pub fn channel() -> (ProgressSender, ProgressReceiver) {
    tokio::sync::broadcast::channel(1024)
}

/// Emit a progress event, ignoring send errors (no receivers listening).
///
/// `seq` is shared by the concurrent checks of one run.
pub fn emit(tx: &Option<ProgressSender>, run_id: &str, seq: &AtomicU64, event: ProgressEventKind) {
    if let Some(ref sender) = tx {
        let seq = seq.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = sender.send(ProgressEvent {
            run_id: run_id.to_string(),
            seq,
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_event_serialization() {
        let event = ProgressEvent {
            run_id: "run-1".to_string(),
            seq: 3,
            event: ProgressEventKind::Snapshot {
                phase: Phase::One,
                completed: 40,
                total: 100,
                failed: 2,
                elapsed_ms: 5000,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Snapshot\""));

        let parsed: ProgressEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.run_id, "run-1");
        assert_eq!(parsed.seq, 3);
    }

    #[test]
    fn test_emit_numbers_events() {
        let (tx, mut rx) = channel();
        let seq = AtomicU64::new(0);
        let tx = Some(tx);
        emit(&tx, "r", &seq, ProgressEventKind::RunStarted { planned: 2 });
        emit(
            &tx,
            "r",
            &seq,
            ProgressEventKind::Warning {
                message: "late".to_string(),
            },
        );
        assert_eq!(rx.try_recv().unwrap().seq, 1);
        assert_eq!(rx.try_recv().unwrap().seq, 2);
    }

    #[test]
    fn test_emit_without_receivers() {
        let (tx, rx) = channel();
        drop(rx);
        emit(
            &Some(tx),
            "r",
            &AtomicU64::new(0),
            ProgressEventKind::RunStarted { planned: 0 },
        );
        emit(
            &None,
            "r",
            &AtomicU64::new(0),
            ProgressEventKind::RunStarted { planned: 0 },
        );
    }
}
