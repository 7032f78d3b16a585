//! Durable job persistence.
//!
//! The store is the single mutable shared resource in the system. All
//! multi-field updates go through [`JobStore::update`] with optimistic
//! concurrency on `updated_at`; claimants coordinate through
//! [`JobStore::claim_ready`], which binds a bounded-TTL lease.

mod memory;
mod sqlite;

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

use crate::bus::ProgressEvent;
use crate::job::{ClaimInfo, Job, JobState};
use crate::registry::ResourceClass;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Lease slack past the stage timeout, so a healthy executor always
/// finishes (or times out) before its lease lapses.
pub const LEASE_GRACE_SECS: i64 = 30;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Transient backend failure; callers back off and retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Someone else advanced the record; re-read and reapply.
    #[error("conflict: record was updated concurrently")]
    Conflict,

    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A job handed to a claimant, with what the claim changed.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub info: ClaimInfo,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> StoreResult<()>;

    async fn get(&self, id: Uuid) -> StoreResult<Job>;

    async fn list(&self, state: Option<JobState>) -> StoreResult<Vec<Job>>;

    /// Atomically move up to `limit` ready stages to RUNNING and bind a
    /// lease to `owner`. Candidates are filtered by the resource class of
    /// their next ready stage and ordered FIFO by `updated_at`. Two
    /// claimants never receive the same job.
    async fn claim_ready(
        &self,
        owner: &str,
        limit: usize,
        resource_filter: Option<ResourceClass>,
    ) -> StoreResult<Vec<ClaimedJob>>;

    /// Compare-and-swap write: applies `job` only if the stored
    /// `updated_at` still equals `expected_updated_at`.
    async fn update(&self, job: &Job, expected_updated_at: DateTime<Utc>) -> StoreResult<()>;

    /// Heartbeat: push the lease expiry out for a long-running stage.
    async fn extend_lease(
        &self,
        job_id: Uuid,
        owner: &str,
        until: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Crash recovery: every RUNNING stage whose lease has lapsed reverts
    /// to READY with `last_error = LeaseLost`, attempts unchanged. Returns
    /// the recovered jobs.
    async fn recover_expired(&self) -> StoreResult<Vec<Job>>;

    /// Append to the per-job event log (Progress Bus replay source).
    async fn append_event(&self, event: &ProgressEvent) -> StoreResult<()>;

    async fn events(&self, job_id: Uuid) -> StoreResult<Vec<ProgressEvent>>;
}

/// Shared recovery mutation, applied under each backend's own locking.
pub(crate) fn recover_job(job: &mut Job, now: DateTime<Utc>) -> bool {
    if job.state != JobState::Running || job.lease_active(now) {
        return false;
    }
    let Some(stage_id) = job.current_stage else {
        return false;
    };
    let Some(stage) = job.stage_state_mut(stage_id) else {
        return false;
    };
    if stage.phase != crate::job::StagePhase::Running {
        return false;
    }
    stage.phase = crate::job::StagePhase::Ready;
    stage.started_at = None;
    stage.deadline_at = None;
    stage.ready_at = None;
    stage.last_error = Some(crate::error::StageError::lease_lost());
    job.lease = None;
    job.touch(now);
    true
}
