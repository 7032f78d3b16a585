use super::{recover_job, ClaimedJob, JobStore, StoreError, StoreResult, LEASE_GRACE_SECS};
use crate::bus::ProgressEvent;
use crate::clock::SharedClock;
use crate::job::{Job, JobState};
use crate::registry::ResourceClass;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    events: Vec<ProgressEvent>,
}

/// In-process job store. Deterministic under an injected clock; the
/// reference implementation the property suite runs against.
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    clock: SharedClock,
}

impl MemoryJobStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&job.id) {
            return Err(StoreError::Serialization(format!(
                "job {} already exists",
                job.id
            )));
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Job> {
        self.inner
            .lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn list(&self, state: Option<JobState>) -> StoreResult<Vec<Job>> {
        let inner = self.inner.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| state.map_or(true, |s| j.state == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn claim_ready(
        &self,
        owner: &str,
        limit: usize,
        resource_filter: Option<ResourceClass>,
    ) -> StoreResult<Vec<ClaimedJob>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        // FIFO by updated_at across the candidate set.
        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = inner
            .jobs
            .values()
            .filter(|job| {
                job.is_claimable(now)
                    && resource_filter.map_or(true, |class| {
                        job.stage_states
                            .iter()
                            .find(|s| s.is_ready(now))
                            .map_or(false, |s| s.resource_class == class)
                    })
            })
            .map(|job| (job.updated_at, job.id))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let mut claimed = Vec::new();
        for (_, id) in candidates {
            let job = inner.jobs.get_mut(&id).expect("candidate exists");
            if let Some(info) = job.claim_next(owner, now, LEASE_GRACE_SECS) {
                claimed.push(ClaimedJob {
                    job: job.clone(),
                    info,
                });
            }
        }
        Ok(claimed)
    }

    async fn update(&self, job: &Job, expected_updated_at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let stored = inner.jobs.get_mut(&job.id).ok_or(StoreError::NotFound(job.id))?;
        if stored.updated_at != expected_updated_at {
            return Err(StoreError::Conflict);
        }
        *stored = job.clone();
        Ok(())
    }

    async fn extend_lease(
        &self,
        job_id: Uuid,
        owner: &str,
        until: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        match &mut job.lease {
            Some(lease) if lease.owner == owner => {
                lease.expires_at = until;
                Ok(())
            }
            _ => Err(StoreError::Conflict),
        }
    }

    async fn recover_expired(&self) -> StoreResult<Vec<Job>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut recovered = Vec::new();
        for job in inner.jobs.values_mut() {
            if recover_job(job, now) {
                recovered.push(job.clone());
            }
        }
        Ok(recovered)
    }

    async fn append_event(&self, event: &ProgressEvent) -> StoreResult<()> {
        self.inner.lock().events.push(event.clone());
        Ok(())
    }

    async fn events(&self, job_id: Uuid) -> StoreResult<Vec<ProgressEvent>> {
        Ok(self
            .inner
            .lock()
            .events
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }
}
