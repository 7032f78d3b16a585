use crate::bus::{ProgressBus, ProgressEvent};
use crate::clock::SharedClock;
use crate::error::{ErrorKind, Result, StageError};
use crate::executor::ExecutionOutcome;
use crate::job::{Job, JobState, StageId, StagePhase};
use crate::registry::StageRegistry;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{ClaimedJob, JobStore, StoreError};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Consumes executor results under the lease and advances the per-job state
/// machine. Every write is a compare-and-swap through the job store; on
/// conflict the decision is recomputed against the fresh record.
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    registry: Arc<StageRegistry>,
    policy: Arc<RetryPolicy>,
    bus: ProgressBus,
    clock: SharedClock,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<StageRegistry>,
        policy: Arc<RetryPolicy>,
        bus: ProgressBus,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
            bus,
            clock,
        }
    }

    /// Record the transitions a successful claim already made durable.
    pub async fn emit_claim_events(&self, claimed: &ClaimedJob) {
        let now = self.clock.now();
        let mut events = Vec::new();
        if claimed.info.was_queued {
            events.push(ProgressEvent::job(
                claimed.job.id,
                JobState::Queued,
                JobState::Running,
                None,
                now,
            ));
        }
        events.push(ProgressEvent::stage(
            claimed.job.id,
            claimed.info.stage_id,
            StagePhase::Ready,
            StagePhase::Running,
            None,
            now,
        ));
        self.commit_events(&events).await;
    }

    /// Apply one stage outcome. Orphan results (job advanced or terminal in
    /// the meantime) are discarded; stage idempotency makes that safe.
    pub async fn apply(
        &self,
        job_id: Uuid,
        stage_id: StageId,
        outcome: &ExecutionOutcome,
    ) -> Result<()> {
        loop {
            let job = match self.store.get(job_id).await {
                Ok(job) => job,
                Err(StoreError::NotFound(_)) => {
                    warn!(job_id = %job_id, "job vanished before outcome was applied");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            if job.is_terminal() {
                info!(job_id = %job_id, stage = %stage_id, "discarding outcome for terminal job");
                return Ok(());
            }
            let owns_stage = job.current_stage == Some(stage_id)
                && job
                    .stage_state(stage_id)
                    .map_or(false, |s| s.phase == StagePhase::Running);
            if !owns_stage {
                info!(job_id = %job_id, stage = %stage_id, "discarding orphan stage outcome");
                return Ok(());
            }

            let expected = job.updated_at;
            let mut job = job;
            let mut events = Vec::new();
            match &outcome.result {
                Ok(success) => {
                    self.apply_success(&mut job, stage_id, success, &mut events)?
                }
                Err(failure) => {
                    self.apply_failure(&mut job, stage_id, failure, &mut events)?
                }
            }

            match self.store.update(&job, expected).await {
                Ok(()) => {
                    self.commit_events(&events).await;
                    return Ok(());
                }
                Err(StoreError::Conflict) => {
                    warn!(job_id = %job_id, stage = %stage_id, "conflict applying outcome, retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn apply_success(
        &self,
        job: &mut Job,
        stage_id: StageId,
        success: &crate::stage::StageSuccess,
        events: &mut Vec<ProgressEvent>,
    ) -> Result<()> {
        let now = self.clock.now();
        let job_id = job.id;
        let cancel_pending = job.cancel_requested;

        let stage = job
            .stage_state_mut(stage_id)
            .expect("owning stage exists");
        stage.phase = StagePhase::Succeeded;
        stage.finished_at = Some(now);
        stage.deadline_at = None;
        stage.attempts += 1;
        stage.cost = Some(success.cost.clone());
        stage.output_keys = success.output_artifacts.keys().cloned().collect();
        events.push(ProgressEvent::stage(
            job_id,
            stage_id,
            StagePhase::Running,
            StagePhase::Succeeded,
            None,
            now,
        ));

        for (key, blob) in &success.output_artifacts {
            job.artifacts.insert(key.clone(), blob.clone());
        }
        job.lease = None;

        if cancel_pending {
            // The worker outran the cancel signal. Honor the request before
            // any further stage can start.
            let from = job.state;
            job.cancel(now)?;
            events.push(ProgressEvent::job(job_id, from, JobState::Cancelled, None, now));
            return Ok(());
        }

        // Advance past any stages skipped at submit.
        let mut next = self.registry.next(stage_id);
        while let Some(candidate) = next {
            if job
                .stage_state(candidate)
                .map_or(false, |s| s.phase == StagePhase::Skipped)
            {
                next = self.registry.next(candidate);
            } else {
                break;
            }
        }

        match next {
            Some(next_stage) => {
                let state = job
                    .stage_state_mut(next_stage)
                    .expect("registry stages are materialized");
                state.phase = StagePhase::Ready;
                events.push(ProgressEvent::stage(
                    job_id,
                    next_stage,
                    StagePhase::Pending,
                    StagePhase::Ready,
                    None,
                    now,
                ));
                job.current_stage = Some(next_stage);
                job.touch(now);
            }
            None => {
                let from = job.state;
                job.complete(now)?;
                info!(job_id = %job_id, "job completed");
                events.push(ProgressEvent::job(job_id, from, JobState::Completed, None, now));
            }
        }
        Ok(())
    }

    fn apply_failure(
        &self,
        job: &mut Job,
        stage_id: StageId,
        failure: &StageError,
        events: &mut Vec<ProgressEvent>,
    ) -> Result<()> {
        let now = self.clock.now();
        let job_id = job.id;
        job.lease = None;

        // A pending cancel overrides retry handling: this write is the next
        // suspension point at which the request can be observed.
        if failure.kind == ErrorKind::Cancelled || job.cancel_requested {
            let stage = job.stage_state_mut(stage_id).expect("owning stage exists");
            stage.phase = StagePhase::Failed;
            stage.finished_at = Some(now);
            stage.deadline_at = None;
            stage.attempts += 1;
            stage.last_error = Some(failure.clone());
            events.push(ProgressEvent::stage(
                job_id,
                stage_id,
                StagePhase::Running,
                StagePhase::Failed,
                Some(failure.clone()),
                now,
            ));
            let from = job.state;
            job.cancel(now)?;
            events.push(ProgressEvent::job(
                job_id,
                from,
                JobState::Cancelled,
                Some(failure.clone()),
                now,
            ));
            return Ok(());
        }

        match failure.kind {
            ErrorKind::LeaseLost => {
                // Requeued without charging attempts or budget.
                let stage = job.stage_state_mut(stage_id).expect("owning stage exists");
                stage.phase = StagePhase::Ready;
                stage.started_at = None;
                stage.deadline_at = None;
                stage.ready_at = None;
                stage.last_error = Some(failure.clone());
                events.push(ProgressEvent::stage(
                    job_id,
                    stage_id,
                    StagePhase::Running,
                    StagePhase::Ready,
                    Some(failure.clone()),
                    now,
                ));
                job.touch(now);
                return Ok(());
            }
            _ => {}
        }

        let spec = self.registry.spec(stage_id)?;
        let snapshot = job
            .stage_state(stage_id)
            .expect("owning stage exists")
            .clone();
        let decision = self
            .policy
            .decide(&self.registry, spec, &snapshot, failure, job.attempt_budget);

        match decision {
            RetryDecision::Retry { delay } => {
                job.attempt_budget -= 1;
                let stage = job.stage_state_mut(stage_id).expect("owning stage exists");
                stage.phase = StagePhase::Ready;
                stage.attempts += 1;
                stage.started_at = None;
                stage.deadline_at = None;
                stage.ready_at = Some(now + delay);
                stage.last_error = Some(failure.clone());
                info!(
                    job_id = %job_id,
                    stage = %stage_id,
                    delay_ms = delay.num_milliseconds(),
                    "stage will retry"
                );
                events.push(ProgressEvent::stage(
                    job_id,
                    stage_id,
                    StagePhase::Running,
                    StagePhase::Ready,
                    Some(failure.clone()),
                    now,
                ));
                job.touch(now);
            }
            RetryDecision::Fallback { next_index } => {
                let stage = job.stage_state_mut(stage_id).expect("owning stage exists");
                stage.phase = StagePhase::Ready;
                stage.attempts = 0;
                stage.fallback_index = next_index;
                stage.started_at = None;
                stage.deadline_at = None;
                stage.ready_at = None;
                stage.last_error = Some(failure.clone());
                info!(
                    job_id = %job_id,
                    stage = %stage_id,
                    fallback_index = next_index,
                    "stage falling back to alternate worker"
                );
                events.push(ProgressEvent::stage(
                    job_id,
                    stage_id,
                    StagePhase::Running,
                    StagePhase::Ready,
                    Some(failure.clone()),
                    now,
                ));
                job.touch(now);
            }
            RetryDecision::Fail { reason } => {
                error!(job_id = %job_id, stage = %stage_id, reason = %reason, "stage failed");
                self.fail_stage(job, stage_id, failure, events, now)?;
            }
            RetryDecision::GiveUp => {
                error!(job_id = %job_id, stage = %stage_id, "giving up on stage");
                self.fail_stage(job, stage_id, failure, events, now)?;
            }
        }
        Ok(())
    }

    fn fail_stage(
        &self,
        job: &mut Job,
        stage_id: StageId,
        failure: &StageError,
        events: &mut Vec<ProgressEvent>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let job_id = job.id;
        let stage = job.stage_state_mut(stage_id).expect("owning stage exists");
        stage.phase = StagePhase::Failed;
        stage.finished_at = Some(now);
        stage.deadline_at = None;
        stage.attempts += 1;
        stage.last_error = Some(failure.clone());
        events.push(ProgressEvent::stage(
            job_id,
            stage_id,
            StagePhase::Running,
            StagePhase::Failed,
            Some(failure.clone()),
            now,
        ));
        let from = job.state;
        job.fail(stage_id, failure.clone(), now)?;
        events.push(ProgressEvent::job(
            job_id,
            from,
            JobState::Failed,
            Some(failure.clone()),
            now,
        ));
        Ok(())
    }

    /// Startup recovery: revert expired-lease RUNNING stages to READY and
    /// finalize cancellations that were requested but never observed.
    pub async fn recover(&self) -> Result<()> {
        let recovered = self.store.recover_expired().await?;
        for job in &recovered {
            let now = self.clock.now();
            if let Some(stage) = job.next_ready() {
                warn!(job_id = %job.id, stage = %stage.stage_id, "recovered stage from lost lease");
                self.commit_events(&[ProgressEvent::stage(
                    job.id,
                    stage.stage_id,
                    StagePhase::Running,
                    StagePhase::Ready,
                    Some(StageError::lease_lost()),
                    now,
                )])
                .await;
            }
        }

        for job in self.store.list(None).await? {
            if job.is_terminal() || !job.cancel_requested {
                continue;
            }
            let running = job
                .current_stage
                .and_then(|s| job.stage_state(s))
                .map_or(false, |s| s.phase == StagePhase::Running);
            if running && job.lease_active(self.clock.now()) {
                // A live executor will observe the flag itself.
                continue;
            }
            let now = self.clock.now();
            let expected = job.updated_at;
            let mut job = job;
            let from = job.state;
            if job.cancel(now).is_err() {
                continue;
            }
            match self.store.update(&job, expected).await {
                Ok(()) => {
                    self.commit_events(&[ProgressEvent::job(
                        job.id,
                        from,
                        JobState::Cancelled,
                        None,
                        now,
                    )])
                    .await;
                }
                Err(StoreError::Conflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Append to the durable log, then broadcast. The log write is
    /// best-effort observability; it never fails a committed transition.
    pub async fn commit_events(&self, events: &[ProgressEvent]) {
        for event in events {
            if let Err(e) = self.store.append_event(event).await {
                warn!(job_id = %event.job_id, "failed to append progress event: {}", e);
            }
            self.bus.publish(event.clone());
        }
    }
}
