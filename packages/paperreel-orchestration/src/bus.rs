//! Progress bus: lossy broadcast of committed state transitions.
//!
//! Delivery is best-effort and at-most-once; a lagged subscriber skips
//! ahead rather than blocking the orchestrator. Per-job ordering follows
//! commit order because all transitions of one job are serialized through
//! the job store. Durable replay comes from the store's event log, not
//! from this channel.

use crate::error::StageError;
use crate::job::{JobState, StageId, StagePhase};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 1024;

/// What changed: one stage's phase, or the job's overall state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Transition {
    Stage {
        stage_id: StageId,
        from: StagePhase,
        to: StagePhase,
    },
    Job {
        from: JobState,
        to: JobState,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub transition: Transition,
    pub error: Option<StageError>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn stage(
        job_id: Uuid,
        stage_id: StageId,
        from: StagePhase,
        to: StagePhase,
        error: Option<StageError>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            transition: Transition::Stage { stage_id, from, to },
            error,
            timestamp,
        }
    }

    pub fn job(
        job_id: Uuid,
        from: JobState,
        to: JobState,
        error: Option<StageError>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            transition: Transition::Job { from, to },
            error,
            timestamp,
        }
    }

    pub fn stage_id(&self) -> Option<StageId> {
        match &self.transition {
            Transition::Stage { stage_id, .. } => Some(*stage_id),
            Transition::Job { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct ProgressBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Fire-and-forget publish. Returns the number of live subscribers;
    /// zero subscribers is not an error.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to every job, or to a single job's events.
    pub fn subscribe(&self, job_filter: Option<Uuid>) -> ProgressReceiver {
        ProgressReceiver {
            inner: self.sender.subscribe(),
            job_filter,
        }
    }
}

pub struct ProgressReceiver {
    inner: broadcast::Receiver<ProgressEvent>,
    job_filter: Option<Uuid>,
}

impl ProgressReceiver {
    /// Next matching event, or `None` once the bus is closed. Lag is
    /// absorbed silently: dropped events are simply not delivered.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.inner.recv().await {
                Ok(event) => {
                    if self.job_filter.map_or(true, |id| event.job_id == id) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Adapt the receiver into a `Stream` of events.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> {
        futures::stream::unfold(self, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
    }
}
