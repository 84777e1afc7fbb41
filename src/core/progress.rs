//! Progress events for a running job.
//!
//! The engine never renders anything itself: every status change goes out
//! as a [`ProgressEvent`] on one channel. The bus only keeps the last-known
//! status per sink, so a vanished sink can be flagged in later events.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use super::models::JobSummary;
use crate::logging::LogThrottle;

/// Channel capacity between the job and its caller
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkStatus {
    Idle,
    Copy,
    Hashing,
    Done,
    ErrorCopy,
    ErrorHash,
    ErrorIo,
}

impl SinkStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::ErrorCopy | Self::ErrorHash | Self::ErrorIo)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkProgress {
    pub status: SinkStatus,
    pub processed_bytes: u64,
    pub processed_files: u64,
    pub current_file: String,
}

impl Default for SinkProgress {
    fn default() -> Self {
        Self {
            status: SinkStatus::Idle,
            processed_bytes: 0,
            processed_files: 0,
            current_file: String::new(),
        }
    }
}

/// Which pass a streaming event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Copying,
    Verifying,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ProgressEvent {
    Copying {
        sinks: BTreeMap<String, SinkProgress>,
    },
    Verifying {
        sinks: BTreeMap<String, SinkProgress>,
    },
    Done {
        summary: JobSummary,
    },
    Cancelled {
        at: DateTime<Local>,
        summary: JobSummary,
    },
    Error {
        cause: String,
    },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done { .. } | Self::Cancelled { .. } | Self::Error { .. }
        )
    }

    pub fn sinks(&self) -> Option<&BTreeMap<String, SinkProgress>> {
        match self {
            Self::Copying { sinks } | Self::Verifying { sinks } => Some(sinks),
            _ => None,
        }
    }
}

struct BusState {
    phase: Phase,
    sinks: BTreeMap<String, SinkProgress>,
}

/// Sending half of the event channel plus the per-sink status table.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<ProgressEvent>,
    state: Arc<Mutex<BusState>>,
    throttle: Arc<LogThrottle>,
}

impl EventBus {
    pub fn new(tx: mpsc::Sender<ProgressEvent>, interval: Duration) -> Self {
        Self {
            tx,
            state: Arc::new(Mutex::new(BusState {
                phase: Phase::Copying,
                sinks: BTreeMap::new(),
            })),
            throttle: Arc::new(LogThrottle::new(interval)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a pass: every listed sink goes back to idle.
    pub fn begin_phase(&self, phase: Phase, sink_ids: &[String], processed_files: u64) {
        let mut state = self.lock();
        state.phase = phase;
        state.sinks = sink_ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    SinkProgress {
                        processed_files,
                        ..Default::default()
                    },
                )
            })
            .collect();
        self.throttle.reset();
    }

    pub fn update(&self, sink_id: &str, f: impl FnOnce(&mut SinkProgress)) {
        if let Some(progress) = self.lock().sinks.get_mut(sink_id) {
            f(progress);
        }
    }

    /// Apply `f` to every sink not already in an error state.
    pub fn update_live(&self, mut f: impl FnMut(&mut SinkProgress)) {
        for progress in self.lock().sinks.values_mut() {
            if !progress.status.is_error() {
                f(progress);
            }
        }
    }

    /// Mark a sink as failed; later events keep showing the error.
    pub fn mark_error(&self, sink_id: &str, status: SinkStatus) {
        self.update(sink_id, |p| p.status = status);
    }

    pub fn status(&self, sink_id: &str) -> Option<SinkProgress> {
        self.lock().sinks.get(sink_id).cloned()
    }

    fn current(&self) -> ProgressEvent {
        let state = self.lock();
        let sinks = state.sinks.clone();
        match state.phase {
            Phase::Copying => ProgressEvent::Copying { sinks },
            Phase::Verifying => ProgressEvent::Verifying { sinks },
        }
    }

    /// Emit the current state now, waiting for channel capacity.
    pub async fn emit(&self) {
        let _ = self.tx.send(self.current()).await;
    }

    /// Emit the current state if the throttle interval has passed. Dropped
    /// when the caller is not keeping up.
    pub fn emit_throttled(&self) {
        if self.throttle.should_log() {
            let _ = self.tx.try_send(self.current());
        }
    }

    /// Emit a per-file event, never blocking the copy.
    pub fn emit_nowait(&self) {
        let _ = self.tx.try_send(self.current());
    }

    pub async fn finish(&self, event: ProgressEvent) {
        let _ = self.tx.send(event).await;
    }
}
