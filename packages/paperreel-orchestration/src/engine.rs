use crate::artifact::BlobRef;
use crate::bus::{ProgressBus, ProgressEvent, ProgressReceiver};
use crate::clock::{system_clock, SharedClock};
use crate::error::{OrchestratorError, Result};
use crate::executor::StageExecutor;
use crate::job::{Job, JobState, PaperInput, StagePhase};
use crate::options::{ConcurrencyLimits, JobOptions};
use crate::orchestrator::Orchestrator;
use crate::registry::StageRegistry;
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::store::{JobStore, MemoryJobStore, StoreError};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Builder for [`Engine`]. Only the registry is mandatory; everything else
/// defaults to in-process components (memory store, system clock, default
/// retry policy and caps).
pub struct EngineBuilder {
    registry: Arc<StageRegistry>,
    store: Option<Arc<dyn JobStore>>,
    clock: SharedClock,
    policy: Arc<RetryPolicy>,
    limits: ConcurrencyLimits,
    bus: ProgressBus,
}

impl EngineBuilder {
    pub fn new(registry: Arc<StageRegistry>) -> Self {
        Self {
            registry,
            store: None,
            clock: system_clock(),
            policy: Arc::new(RetryPolicy::default()),
            limits: ConcurrencyLimits::default(),
            bus: ProgressBus::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, policy: Arc<RetryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_concurrency(mut self, limits: ConcurrencyLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_bus(mut self, bus: ProgressBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn build(self) -> Engine {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryJobStore::new(self.clock.clone())));
        Engine {
            orchestrator: Arc::new(Orchestrator::new(
                store.clone(),
                self.registry.clone(),
                self.policy.clone(),
                self.bus.clone(),
                self.clock.clone(),
            )),
            store,
            registry: self.registry,
            clock: self.clock,
            policy: self.policy,
            limits: self.limits,
            bus: self.bus,
            cancel_tokens: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            scheduler_handle: parking_lot::Mutex::new(None),
        }
    }
}

/// The programmatic surface of the orchestration core. HTTP and CLI
/// framing are the caller's concern.
pub struct Engine {
    store: Arc<dyn JobStore>,
    registry: Arc<StageRegistry>,
    clock: SharedClock,
    policy: Arc<RetryPolicy>,
    limits: ConcurrencyLimits,
    bus: ProgressBus,
    orchestrator: Arc<Orchestrator>,
    cancel_tokens: Arc<DashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
    scheduler_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(registry: Arc<StageRegistry>) -> EngineBuilder {
        EngineBuilder::new(registry)
    }

    /// Spawn the scheduler loop. Idempotent.
    pub fn start(&self) {
        let mut handle = self.scheduler_handle.lock();
        if handle.is_some() {
            return;
        }
        let executor = Arc::new(StageExecutor::new(
            self.registry.clone(),
            self.store.clone(),
            self.clock.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            self.store.clone(),
            self.registry.clone(),
            executor,
            self.orchestrator.clone(),
            self.clock.clone(),
            &self.limits,
            self.cancel_tokens.clone(),
            self.shutdown.clone(),
        ));
        *handle = Some(tokio::spawn(scheduler.run()));
    }

    /// Stop claiming new work and wait for the scheduler loop to exit.
    /// Stages already in flight run to their own conclusion.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.scheduler_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Validate and persist a new job. Invalid input or options are
    /// rejected synchronously; no job is created.
    pub async fn submit(&self, input: PaperInput, options: JobOptions) -> Result<Uuid> {
        input.validate()?;
        options.validate()?;
        let plans = self.registry.plan(&options)?;
        let now = self.clock.now();
        let job = Job::new(Uuid::new_v4(), input, options, &plans, now);
        self.store.insert(&job).await?;
        info!(job_id = %job.id, "job submitted");

        let mut events = Vec::new();
        for stage in &job.stage_states {
            if stage.phase == StagePhase::Skipped {
                events.push(ProgressEvent::stage(
                    job.id,
                    stage.stage_id,
                    StagePhase::Pending,
                    StagePhase::Skipped,
                    None,
                    now,
                ));
            }
        }
        if job.state == JobState::Completed {
            // Every stage was skipped; nothing will ever claim this job.
            events.push(ProgressEvent::job(
                job.id,
                JobState::Queued,
                JobState::Completed,
                None,
                now,
            ));
        }
        self.orchestrator.commit_events(&events).await;
        Ok(job.id)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Job> {
        Ok(self.store.get(job_id).await?)
    }

    pub async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        Ok(self.store.list(state).await?)
    }

    /// Request cancellation. Idempotent; a no-op on terminal jobs. A job
    /// with a stage in flight is cancelled through the executor's token; an
    /// idle job is finalized immediately.
    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        loop {
            let job = self.store.get(job_id).await?;
            if job.is_terminal() {
                return Ok(());
            }
            let now = self.clock.now();
            let expected = job.updated_at;
            let stage_running = job
                .current_stage
                .and_then(|s| job.stage_state(s))
                .map_or(false, |s| s.phase == StagePhase::Running);

            let mut job = job;
            if stage_running {
                if job.cancel_requested {
                    // Already pending; re-signal in case the token appeared
                    // after the flag was set.
                    self.signal_cancel(job_id);
                    return Ok(());
                }
                job.cancel_requested = true;
                job.touch(now);
                match self.store.update(&job, expected).await {
                    Ok(()) => {
                        self.signal_cancel(job_id);
                        info!(job_id = %job_id, "cancellation requested");
                        return Ok(());
                    }
                    Err(StoreError::Conflict) => continue,
                    Err(e) => return Err(e.into()),
                }
            } else {
                let from = job.state;
                job.cancel_requested = true;
                job.cancel(now)?;
                match self.store.update(&job, expected).await {
                    Ok(()) => {
                        self.orchestrator
                            .commit_events(&[ProgressEvent::job(
                                job_id,
                                from,
                                JobState::Cancelled,
                                None,
                                now,
                            )])
                            .await;
                        info!(job_id = %job_id, "job cancelled");
                        return Ok(());
                    }
                    Err(StoreError::Conflict) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    /// Stop claiming further stages of a job. The stage in flight (if any)
    /// finishes on its own.
    pub async fn pause(&self, job_id: Uuid) -> Result<()> {
        loop {
            let job = self.store.get(job_id).await?;
            let now = self.clock.now();
            let expected = job.updated_at;
            let from = job.state;
            let mut job = job;
            job.pause(now)?;
            match self.store.update(&job, expected).await {
                Ok(()) => {
                    self.orchestrator
                        .commit_events(&[ProgressEvent::job(
                            job_id,
                            from,
                            JobState::Paused,
                            None,
                            now,
                        )])
                        .await;
                    return Ok(());
                }
                Err(StoreError::Conflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn resume(&self, job_id: Uuid) -> Result<()> {
        loop {
            let job = self.store.get(job_id).await?;
            let now = self.clock.now();
            let expected = job.updated_at;
            let mut job = job;
            job.resume(now)?;
            let to = job.state;
            match self.store.update(&job, expected).await {
                Ok(()) => {
                    self.orchestrator
                        .commit_events(&[ProgressEvent::job(
                            job_id,
                            JobState::Paused,
                            to,
                            None,
                            now,
                        )])
                        .await;
                    return Ok(());
                }
                Err(StoreError::Conflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Live event stream, optionally filtered to one job. Lossy; use
    /// [`Engine::events`] for the durable log.
    pub fn subscribe(&self, job_filter: Option<Uuid>) -> ProgressReceiver {
        self.bus.subscribe(job_filter)
    }

    /// Durable, replayable event log for one job.
    pub async fn events(&self, job_id: Uuid) -> Result<Vec<ProgressEvent>> {
        Ok(self.store.events(job_id).await?)
    }

    /// Hand out an artifact reference, but only once the stage that
    /// produces that key has SUCCEEDED.
    pub async fn download_artifact(&self, job_id: Uuid, key: &str) -> Result<BlobRef> {
        let job = self.store.get(job_id).await?;
        let producer = self
            .registry
            .order()
            .find(|&stage| {
                self.registry
                    .spec(stage)
                    .map(|spec| spec.output_keys.iter().any(|p| p.matches(key)))
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                OrchestratorError::ArtifactNotAvailable(format!("unknown artifact key {}", key))
            })?;
        let produced = job
            .stage_state(producer)
            .map_or(false, |s| s.phase == StagePhase::Succeeded);
        if !produced {
            return Err(OrchestratorError::ArtifactNotAvailable(format!(
                "stage {} has not succeeded for job {}",
                producer, job_id
            )));
        }
        job.artifacts.get(key).cloned().ok_or_else(|| {
            OrchestratorError::ArtifactNotAvailable(format!(
                "artifact {} missing for job {}",
                key, job_id
            ))
        })
    }

    /// The store-side retry policy in use, mainly for introspection in
    /// tests and diagnostics.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn signal_cancel(&self, job_id: Uuid) {
        if let Some(token) = self.cancel_tokens.get(&job_id) {
            token.cancel();
        }
    }
}
