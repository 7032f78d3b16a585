use crate::clock::SharedClock;
use crate::error::StageError;
use crate::job::Job;
use crate::registry::{ResourceClass, StageRegistry};
use crate::stage::{StageRequest, StageResult};
use crate::store::{JobStore, StoreError};
use chrono::Duration;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTelemetry {
    pub duration_ms: u64,
    pub resource_class: ResourceClass,
}

/// What one stage invocation produced, plus what it cost. Failures are
/// carried in `result`; the executor itself does not error.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub result: StageResult,
    pub telemetry: StageTelemetry,
}

/// Runs one claimed stage: persists the deadline, invokes the worker on its
/// own task, and races completion against the deadline and external
/// cancellation. Returns in bounded time even when the worker ignores its
/// soft-cancel; aborted work is discarded, which stage idempotency makes
/// safe.
pub struct StageExecutor {
    registry: Arc<StageRegistry>,
    store: Arc<dyn JobStore>,
    clock: SharedClock,
}

impl StageExecutor {
    pub fn new(registry: Arc<StageRegistry>, store: Arc<dyn JobStore>, clock: SharedClock) -> Self {
        Self {
            registry,
            store,
            clock,
        }
    }

    pub async fn execute(&self, job: &Job, cancel: CancellationToken) -> ExecutionOutcome {
        let started = Instant::now();
        let stage_id = match job.current_stage {
            Some(stage_id) => stage_id,
            None => {
                return self.outcome(
                    started,
                    ResourceClass::Cpu,
                    Err(StageError::internal("claimed job has no current stage")),
                )
            }
        };
        let spec = match self.registry.spec(stage_id) {
            Ok(spec) => spec,
            Err(e) => {
                return self.outcome(started, ResourceClass::Cpu, Err(StageError::internal(e.to_string())))
            }
        };
        let class = spec.resource_class;
        let Some(stage) = job.stage_state(stage_id) else {
            return self.outcome(
                started,
                class,
                Err(StageError::internal(format!(
                    "job {} has no state for stage {}",
                    job.id, stage_id
                ))),
            );
        };

        // The deadline is persisted before the worker starts, so lease
        // recovery and observers see the bound.
        let now = self.clock.now();
        let deadline = now + Duration::seconds(stage.timeout_secs as i64);
        let mut persisted = job.clone();
        let expected = persisted.updated_at;
        if let Some(s) = persisted.stage_state_mut(stage_id) {
            s.deadline_at = Some(deadline);
        }
        persisted.touch(now);
        match self.store.update(&persisted, expected).await {
            Ok(()) => {}
            Err(StoreError::Conflict) => {
                // The record moved under us; treat it as a lost lease and
                // let the orchestrator requeue without burning an attempt.
                return self.outcome(started, class, Err(StageError::lease_lost()));
            }
            Err(e) => {
                return self.outcome(started, class, Err(StageError::transient(e.to_string())));
            }
        }

        let worker = match self.registry.resolve(stage_id, stage.fallback_index) {
            Ok(worker) => worker,
            Err(e) => {
                return self.outcome(started, class, Err(StageError::internal(e.to_string())))
            }
        };
        let skipped = job
            .stage_states
            .iter()
            .filter(|s| s.phase == crate::job::StagePhase::Skipped)
            .map(|s| s.stage_id)
            .collect();
        let input_artifacts =
            match self
                .registry
                .collect_inputs(stage_id, &job.artifacts, &skipped)
            {
                Ok(inputs) => inputs,
                Err(e) => {
                    return self.outcome(started, class, Err(StageError::internal(e.to_string())))
                }
            };

        info!(
            job_id = %job.id,
            stage = %stage_id,
            worker = worker.name(),
            attempt = stage.attempts,
            fallback_index = stage.fallback_index,
            "executing stage"
        );

        let request = StageRequest {
            job_id: job.id,
            stage_id,
            input_artifacts,
            options: job.options.clone(),
            deadline,
            attempt: stage.attempts,
            fallback_index: stage.fallback_index,
            cancel: cancel.child_token(),
        };
        let soft_cancel = request.cancel.clone();
        let timeout_secs = stage.timeout_secs;

        let run_worker = worker.clone();
        let mut handle = tokio::spawn(async move { run_worker.run(request).await });

        let budget = (deadline - self.clock.now())
            .num_milliseconds()
            .max(0) as u64;
        let result = tokio::select! {
            joined = &mut handle => match joined {
                Ok(result) => result,
                Err(e) => Err(StageError::internal(format!("worker panicked: {}", e))),
            },
            _ = tokio::time::sleep(std::time::Duration::from_millis(budget)) => {
                soft_cancel.cancel();
                handle.abort();
                warn!(job_id = %job.id, stage = %stage_id, "stage deadline exceeded, worker cancelled");
                Err(StageError::timeout(format!(
                    "stage {} exceeded its {}s deadline",
                    stage_id, timeout_secs
                )))
            }
            _ = cancel.cancelled() => {
                soft_cancel.cancel();
                handle.abort();
                info!(job_id = %job.id, stage = %stage_id, "stage cancelled");
                Err(StageError::cancelled())
            }
        };

        // The output contract is checked here, not in workers.
        let result = result.and_then(|success| {
            self.registry
                .validate_outputs(stage_id, &success.output_artifacts)
                .map(|()| success)
        });

        self.outcome(started, class, result)
    }

    fn outcome(
        &self,
        started: Instant,
        resource_class: ResourceClass,
        result: StageResult,
    ) -> ExecutionOutcome {
        ExecutionOutcome {
            result,
            telemetry: StageTelemetry {
                duration_ms: started.elapsed().as_millis() as u64,
                resource_class,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{keys, BlobRef};
    use crate::clock::system_clock;
    use crate::error::ErrorKind;
    use crate::job::{Job, PaperInput, StageId};
    use crate::options::JobOptions;
    use crate::store::MemoryJobStore;
    use crate::testing::{stub_registry, ScriptedWorker};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    async fn claimed_job(
        registry: &Arc<StageRegistry>,
        store: &Arc<MemoryJobStore>,
        timeout_secs: u64,
    ) -> Job {
        let mut options = JobOptions::default();
        for stage in StageId::ALL {
            options.stage_timeouts.insert(stage, timeout_secs);
        }
        let plans = registry.plan(&options).unwrap();
        let job = Job::new(
            Uuid::new_v4(),
            PaperInput::title("test"),
            options,
            &plans,
            Utc::now(),
        );
        store.insert(&job).await.unwrap();
        let claimed = store.claim_ready("worker-1", 1, None).await.unwrap();
        claimed.into_iter().next().unwrap().job
    }

    #[tokio::test]
    async fn test_successful_stage_validates_outputs() {
        let registry = Arc::new(stub_registry(2));
        let store = Arc::new(MemoryJobStore::new(system_clock()));
        let executor = StageExecutor::new(registry.clone(), store.clone(), system_clock());

        let job = claimed_job(&registry, &store, 60).await;
        let outcome = executor.execute(&job, CancellationToken::new()).await;

        let success = outcome.result.unwrap();
        assert!(success.output_artifacts.contains_key(keys::PAPER_PARSED));
        assert_eq!(outcome.telemetry.resource_class, ResourceClass::NetHeavy);
    }

    #[tokio::test]
    async fn test_contract_violation_synthesized() {
        let mut bad_outputs = BTreeMap::new();
        bad_outputs.insert("wrong.key".to_string(), BlobRef::new("mem://x"));
        let worker = Arc::new(ScriptedWorker::new("bad-ingest").then_succeed_with(bad_outputs));
        let registry = Arc::new(crate::testing::stub_registry_with_ingest(worker, 2));
        let store = Arc::new(MemoryJobStore::new(system_clock()));
        let executor = StageExecutor::new(registry.clone(), store.clone(), system_clock());

        let job = claimed_job(&registry, &store, 60).await;
        let outcome = executor.execute(&job, CancellationToken::new()).await;

        let err = outcome.result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ContractViolation);
        assert!(err.suggested_fallback);
    }

    #[tokio::test]
    async fn test_deadline_enforced_on_sleeping_worker() {
        let worker = Arc::new(ScriptedWorker::new("sleepy").then_sleep_ms(10_000));
        let registry = Arc::new(crate::testing::stub_registry_with_ingest(worker, 2));
        let store = Arc::new(MemoryJobStore::new(system_clock()));
        let executor = StageExecutor::new(registry.clone(), store.clone(), system_clock());

        let job = claimed_job(&registry, &store, 1).await;
        let started = Instant::now();
        let outcome = executor.execute(&job, CancellationToken::new()).await;

        assert!(started.elapsed() < std::time::Duration::from_secs(3));
        assert_eq!(outcome.result.unwrap_err().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_cancellation_preempts_worker() {
        let worker = Arc::new(ScriptedWorker::new("sleepy").then_sleep_ms(10_000));
        let registry = Arc::new(crate::testing::stub_registry_with_ingest(worker, 2));
        let store = Arc::new(MemoryJobStore::new(system_clock()));
        let executor = StageExecutor::new(registry.clone(), store.clone(), system_clock());

        let job = claimed_job(&registry, &store, 60).await;
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel2.cancel();
        });

        let started = Instant::now();
        let outcome = executor.execute(&job, cancel).await;
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert_eq!(outcome.result.unwrap_err().kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_deadline_persisted_before_invocation() {
        let registry = Arc::new(stub_registry(2));
        let store = Arc::new(MemoryJobStore::new(system_clock()));
        let executor = StageExecutor::new(registry.clone(), store.clone(), system_clock());

        let job = claimed_job(&registry, &store, 60).await;
        executor.execute(&job, CancellationToken::new()).await;

        let stored = store.get(job.id).await.unwrap();
        assert!(stored
            .stage_state(StageId::Ingest)
            .unwrap()
            .deadline_at
            .is_some());
    }
}
