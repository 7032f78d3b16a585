use crate::clock::SharedClock;
use crate::executor::StageExecutor;
use crate::job::StageId;
use crate::options::ConcurrencyLimits;
use crate::orchestrator::Orchestrator;
use crate::registry::{ResourceClass, StageRegistry};
use crate::store::{ClaimedJob, JobStore};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

const IDLE_BACKOFF_MIN_MS: u64 = 10;
const IDLE_BACKOFF_MAX_MS: u64 = 1_000;

/// Pulls ready jobs from the store and dispatches them to the executor,
/// gated by three layers of capacity: a global cap, per-stage caps, and
/// per-resource-class caps. Round-robins over resource classes so no class
/// starves; within a class the store hands back jobs FIFO by `updated_at`.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    executor: Arc<StageExecutor>,
    orchestrator: Arc<Orchestrator>,
    clock: SharedClock,
    global: Arc<Semaphore>,
    per_stage: HashMap<StageId, Arc<Semaphore>>,
    per_class: HashMap<ResourceClass, Arc<Semaphore>>,
    cancel_tokens: Arc<DashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
    worker_id: String,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<StageRegistry>,
        executor: Arc<StageExecutor>,
        orchestrator: Arc<Orchestrator>,
        clock: SharedClock,
        limits: &ConcurrencyLimits,
        cancel_tokens: Arc<DashMap<Uuid, CancellationToken>>,
        shutdown: CancellationToken,
    ) -> Self {
        let global = Arc::new(Semaphore::new(limits.global));
        let per_stage = registry
            .order()
            .map(|stage| {
                let cap = limits.stage_cap(stage).unwrap_or(limits.global);
                (stage, Arc::new(Semaphore::new(cap)))
            })
            .collect();
        let per_class = ResourceClass::ALL
            .iter()
            .map(|&class| {
                let cap = limits.class_cap(class).unwrap_or(limits.global);
                (class, Arc::new(Semaphore::new(cap)))
            })
            .collect();

        Self {
            store,
            executor,
            orchestrator,
            clock,
            global,
            per_stage,
            per_class,
            cancel_tokens,
            shutdown,
            worker_id: format!("scheduler-{}", Uuid::new_v4()),
        }
    }

    /// Main loop. Runs startup recovery first, then claims and dispatches
    /// until shutdown, sleeping with capped exponential backoff when the
    /// store has nothing ready.
    pub async fn run(self: Arc<Self>) {
        if let Err(e) = self.orchestrator.recover().await {
            error!("startup recovery failed: {}", e);
        }
        info!(worker_id = %self.worker_id, "scheduler started");

        let mut idle_ms = IDLE_BACKOFF_MIN_MS;
        let mut cursor = 0usize;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let mut dispatched = 0usize;
            for offset in 0..ResourceClass::ALL.len() {
                let class = ResourceClass::ALL[(cursor + offset) % ResourceClass::ALL.len()];
                let class_sem = &self.per_class[&class];
                let free = class_sem
                    .available_permits()
                    .min(self.global.available_permits());
                if free == 0 {
                    continue;
                }
                match self
                    .store
                    .claim_ready(&self.worker_id, free, Some(class))
                    .await
                {
                    Ok(claims) => {
                        for claimed in claims {
                            if self.clone().dispatch(claimed).await {
                                dispatched += 1;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(class = %class, "claim_ready failed: {}", e);
                    }
                }
            }
            cursor = cursor.wrapping_add(1);

            if dispatched == 0 {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(idle_ms)) => {}
                }
                idle_ms = (idle_ms * 2).min(IDLE_BACKOFF_MAX_MS);
            } else {
                idle_ms = IDLE_BACKOFF_MIN_MS;
            }
        }
        info!(worker_id = %self.worker_id, "scheduler stopped");
    }

    /// Acquire all three capacity permits and hand the stage to the
    /// executor on its own task. A claim that cannot get capacity is
    /// returned to the store unrun.
    async fn dispatch(self: Arc<Self>, claimed: ClaimedJob) -> bool {
        let stage_id = claimed.info.stage_id;
        let class = claimed
            .job
            .stage_state(stage_id)
            .map(|s| s.resource_class)
            .unwrap_or(ResourceClass::Cpu);

        let Ok(global_permit) = self.global.clone().try_acquire_owned() else {
            self.unclaim(claimed).await;
            return false;
        };
        let Ok(class_permit) = self.per_class[&class].clone().try_acquire_owned() else {
            self.unclaim(claimed).await;
            return false;
        };
        let Ok(stage_permit) = self.per_stage[&stage_id].clone().try_acquire_owned() else {
            self.unclaim(claimed).await;
            return false;
        };

        let token = CancellationToken::new();
        self.cancel_tokens.insert(claimed.job.id, token.clone());

        // A cancel may have landed between the claim filter and here.
        if let Ok(fresh) = self.store.get(claimed.job.id).await {
            if fresh.cancel_requested {
                token.cancel();
            }
        }

        self.orchestrator.emit_claim_events(&claimed).await;

        let this = self.clone();
        tokio::spawn(async move {
            let job_id = claimed.job.id;
            let outcome = this.executor.execute(&claimed.job, token).await;

            // Capacity is released before the outcome is observed, so a
            // slow store write never holds a permit hostage.
            drop(global_permit);
            drop(class_permit);
            drop(stage_permit);

            if let Err(e) = this.orchestrator.apply(job_id, stage_id, &outcome).await {
                error!(job_id = %job_id, stage = %stage_id, "failed to apply stage outcome: {}", e);
            }
            this.cancel_tokens.remove(&job_id);
        });
        true
    }

    /// Best-effort return of a claim that never ran. If the write loses a
    /// race the lease simply expires and recovery requeues the stage.
    async fn unclaim(&self, claimed: ClaimedJob) {
        let now = self.clock.now();
        let mut job = claimed.job;
        let expected = job.updated_at;
        job.release_claim(&claimed.info, now);
        if let Err(e) = self.store.update(&job, expected).await {
            warn!(job_id = %job.id, "could not return unclaimed job, lease will expire: {}", e);
        }
    }
}
