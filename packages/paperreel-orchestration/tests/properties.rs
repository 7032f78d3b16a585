//! Property tests over the orchestration state machine: stage progression,
//! terminal absorption, budget accounting, claim exclusivity, crash
//! recovery, and event-log coherence. The store and orchestrator are
//! stepped directly under a manual clock, so every case is deterministic.

use chrono::{Duration as ChronoDuration, Utc};
use paperreel_orchestration::testing::{stage_outputs, stub_worker, ManualClock};
use paperreel_orchestration::{
    BlobRef, Clock, Engine, ExecutionOutcome, Job, JobOptions, JobState, JobStore, MemoryJobStore,
    Orchestrator, PaperInput, PipelineWorkers, ProgressBus, ProgressEvent, ResourceClass,
    RetryConfig, RetryPolicy, StageCost, StageError, StageId, StagePhase, StageRegistry,
    StageSuccess, StageTelemetry, StageWorker, Transition,
};
use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
enum StageScript {
    /// Succeeds first try.
    Clean,
    /// N transient failures, then success.
    Flaky(u8),
    /// Fails non-retryably.
    Broken,
    /// One contract violation, then the fallback worker succeeds.
    WrongContract,
}

fn script_strategy() -> impl Strategy<Value = StageScript> {
    prop_oneof![
        5 => Just(StageScript::Clean),
        3 => (1u8..=2).prop_map(StageScript::Flaky),
        1 => Just(StageScript::Broken),
        1 => Just(StageScript::WrongContract),
    ]
}

/// Two workers per stage, so a contract violation always has a fallback.
fn sim_registry() -> Arc<StageRegistry> {
    let two = |stage| -> Vec<Arc<dyn StageWorker>> {
        vec![stub_worker(stage, 1), stub_worker(stage, 1)]
    };
    Arc::new(
        StageRegistry::video_pipeline(PipelineWorkers {
            ingest: two(StageId::Ingest),
            understand: two(StageId::Understand),
            script: two(StageId::Script),
            plan: two(StageId::Plan),
            animate: two(StageId::Animate),
            voice: two(StageId::Voice),
            compose: two(StageId::Compose),
            metadata: two(StageId::Metadata),
            publish: two(StageId::Publish),
        })
        .unwrap(),
    )
}

struct Sim {
    clock: Arc<ManualClock>,
    store: Arc<MemoryJobStore>,
    orchestrator: Orchestrator,
    registry: Arc<StageRegistry>,
    job_id: Uuid,
    failures_left: HashMap<StageId, u8>,
    violation_pending: HashMap<StageId, bool>,
}

impl Sim {
    async fn new(scripts: &[StageScript], budget: u32) -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryJobStore::new(clock.clone()));
        let registry = sim_registry();
        let orchestrator = Orchestrator::new(
            store.clone(),
            registry.clone(),
            Arc::new(RetryPolicy::with_seed(RetryConfig::default(), 99)),
            ProgressBus::new(),
            clock.clone(),
        );

        let options = JobOptions {
            attempt_budget: budget,
            ..Default::default()
        };
        let plans = registry.plan(&options).unwrap();
        let job = Job::new(
            Uuid::new_v4(),
            PaperInput::title("property run"),
            options,
            &plans,
            clock.now(),
        );
        store.insert(&job).await.unwrap();

        let mut failures_left = HashMap::new();
        let mut violation_pending = HashMap::new();
        for (stage, script) in StageId::ALL.iter().zip(scripts) {
            match script {
                StageScript::Flaky(n) => {
                    failures_left.insert(*stage, *n);
                }
                StageScript::WrongContract => {
                    violation_pending.insert(*stage, true);
                }
                _ => {}
            }
        }

        Self {
            clock,
            store,
            orchestrator,
            registry,
            job_id: job.id,
            failures_left,
            violation_pending,
        }
    }

    fn synth(&mut self, stage: StageId, scripts: &[StageScript]) -> ExecutionOutcome {
        let index = StageId::ALL.iter().position(|s| *s == stage).unwrap();
        let result = match scripts[index] {
            StageScript::Broken => Err(StageError::non_retryable("permanently broken")),
            StageScript::Flaky(_) => {
                let left = self.failures_left.get_mut(&stage).unwrap();
                if *left > 0 {
                    *left -= 1;
                    Err(StageError::transient("simulated blip"))
                } else {
                    Ok(self.success_for(stage))
                }
            }
            StageScript::WrongContract => {
                let pending = self.violation_pending.get_mut(&stage).unwrap();
                if *pending {
                    *pending = false;
                    Err(StageError::contract_violation("missing declared artifact"))
                } else {
                    Ok(self.success_for(stage))
                }
            }
            StageScript::Clean => Ok(self.success_for(stage)),
        };
        ExecutionOutcome {
            result,
            telemetry: StageTelemetry {
                duration_ms: 1,
                resource_class: ResourceClass::Cpu,
            },
        }
    }

    fn success_for(&self, stage: StageId) -> StageSuccess {
        let output_artifacts = stage_outputs(stage, 1)
            .into_iter()
            .map(|key| {
                let blob = BlobRef::new(format!("mem://{}/{}", self.job_id, key));
                (key, blob)
            })
            .collect();
        StageSuccess {
            output_artifacts,
            cost: StageCost {
                duration_ms: 1,
                resource_class: ResourceClass::Cpu,
            },
        }
    }

    async fn job(&self) -> Job {
        self.store.get(self.job_id).await.unwrap()
    }

    /// Advance the clock past any retry delay on the next ready stage.
    async fn skip_retry_delay(&self) {
        let job = self.job().await;
        if let Some(stage) = job.next_ready() {
            if let Some(at) = stage.ready_at {
                if at > self.clock.now() {
                    self.clock.set(at + ChronoDuration::milliseconds(1));
                }
            }
        }
    }

    /// Claim and run one stage invocation; `crash` abandons the invocation
    /// after the claim and recovers the lease instead of applying a result.
    async fn step(&mut self, scripts: &[StageScript], crash: bool) -> bool {
        self.skip_retry_delay().await;
        let mut claims = self.store.claim_ready("sim", 1, None).await.unwrap();
        if claims.is_empty() {
            return false;
        }
        let claimed = claims.remove(0);
        self.orchestrator.emit_claim_events(&claimed).await;

        // Claim exclusivity: nothing else can grab this job now.
        assert!(self
            .store
            .claim_ready("rival", 1, None)
            .await
            .unwrap()
            .is_empty());

        let stage = claimed.info.stage_id;
        if crash {
            let before = self.job().await;
            let longest = self
                .registry
                .order()
                .map(|s| self.registry.spec(s).unwrap().default_timeout_secs)
                .max()
                .unwrap();
            self.clock
                .advance(ChronoDuration::seconds(longest as i64 + 31));
            let recovered = self.store.recover_expired().await.unwrap();
            assert_eq!(recovered.len(), 1);
            assert_recovery_only_reverts_running(&before, &recovered[0], stage);
        } else {
            let outcome = self.synth(stage, scripts);
            self.orchestrator
                .apply(self.job_id, stage, &outcome)
                .await
                .unwrap();
        }

        let after = self.job().await;
        assert_stage_prefix(&after);
        true
    }
}

/// SUCCEEDED stages form a prefix (skips are transparent), and at most one
/// stage is in flight.
fn assert_stage_prefix(job: &Job) {
    let mut past_active = false;
    let mut running = 0;
    for stage in &job.stage_states {
        match stage.phase {
            StagePhase::Skipped => {}
            StagePhase::Succeeded => {
                assert!(!past_active, "succeeded stage after an unfinished one");
            }
            StagePhase::Ready | StagePhase::Running | StagePhase::Failed => {
                assert!(!past_active, "two stages active at once");
                if stage.phase == StagePhase::Running {
                    running += 1;
                }
                past_active = true;
            }
            StagePhase::Pending => {
                past_active = true;
            }
        }
    }
    assert!(running <= 1);
}

/// The recovered record differs from the pre-crash snapshot only in the
/// reverted stage (and the lease/bookkeeping that reversion entails).
fn assert_recovery_only_reverts_running(before: &Job, after: &Job, crashed: StageId) {
    assert!(after.lease.is_none());
    for (b, a) in before.stage_states.iter().zip(&after.stage_states) {
        if b.stage_id == crashed {
            assert_eq!(b.phase, StagePhase::Running);
            assert_eq!(a.phase, StagePhase::Ready);
            assert_eq!(a.attempts, b.attempts, "attempts must not change");
            assert_eq!(
                a.last_error.as_ref().unwrap().kind,
                paperreel_orchestration::ErrorKind::LeaseLost
            );
        } else {
            assert_eq!(a, b, "unrelated stage {} changed", b.stage_id);
        }
    }
    assert_eq!(after.artifacts, before.artifacts);
    assert_eq!(after.state, before.state);
}

/// Walk the oracle: where should this run end, and how many retries should
/// it consume?
fn expected_outcome(scripts: &[StageScript], budget: u32) -> (Option<StageId>, u32) {
    let mut remaining = budget;
    for (stage, script) in StageId::ALL.iter().zip(scripts) {
        match script {
            StageScript::Clean | StageScript::WrongContract => {}
            StageScript::Broken => return (Some(*stage), budget - remaining),
            StageScript::Flaky(n) => {
                let n = *n as u32;
                if n <= remaining {
                    remaining -= n;
                } else {
                    return (Some(*stage), budget);
                }
            }
        }
    }
    (None, budget - remaining)
}

fn count_retry_events(events: &[ProgressEvent]) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(
                e.transition,
                Transition::Stage {
                    from: StagePhase::Running,
                    to: StagePhase::Ready,
                    ..
                }
            ) && e.error.as_ref().map_or(false, |err| {
                err.kind == paperreel_orchestration::ErrorKind::Transient
            })
        })
        .count()
}

/// Every stage transition follows the phase machine, job transitions start
/// from QUEUED, and timestamps never go backwards.
fn assert_event_log_coherent(events: &[ProgressEvent]) {
    let mut stage_last: HashMap<StageId, StagePhase> = HashMap::new();
    let mut job_last: Option<JobState> = None;
    let mut last_ts = None;

    for event in events {
        if let Some(prev) = last_ts {
            assert!(event.timestamp >= prev, "timestamps went backwards");
        }
        last_ts = Some(event.timestamp);

        match &event.transition {
            Transition::Stage { stage_id, from, to } => {
                if let Some(prev_to) = stage_last.get(stage_id) {
                    assert_eq!(
                        from, prev_to,
                        "stage {} transition chain broken",
                        stage_id
                    );
                } else {
                    assert!(
                        matches!(from, StagePhase::Ready | StagePhase::Pending),
                        "stage {} first transition starts from {:?}",
                        stage_id,
                        from
                    );
                }
                stage_last.insert(*stage_id, *to);
            }
            Transition::Job { from, to } => {
                if let Some(prev_to) = &job_last {
                    assert_eq!(from, prev_to, "job transition chain broken");
                } else {
                    assert_eq!(*from, JobState::Queued);
                }
                job_last = Some(*to);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn progression_budget_and_events(
        scripts in vec(script_strategy(), 9),
        budget in 0u32..=10,
    ) {
        tokio_test::block_on(async {
            let mut sim = Sim::new(&scripts, budget).await;
            let mut steps = 0;
            while sim.step(&scripts, false).await {
                steps += 1;
                assert!(steps < 200, "simulation did not converge");
            }

            let job = sim.job().await;
            let (expected_failure, expected_retries) = expected_outcome(&scripts, budget);
            match expected_failure {
                None => {
                    assert_eq!(job.state, JobState::Completed);
                    assert!(job.artifacts.contains_key("video.final"));
                }
                Some(stage) => {
                    assert_eq!(job.state, JobState::Failed);
                    assert_eq!(job.failure.as_ref().unwrap().stage_id, stage);
                    assert_eq!(
                        job.stage_state(stage).unwrap().phase,
                        StagePhase::Failed
                    );
                }
            }

            // Budget accounting matches the observed retry transitions.
            assert!(expected_retries <= budget);
            assert_eq!(job.attempt_budget, budget - expected_retries);
            let events = sim.store.events(job.id).await.unwrap();
            assert_eq!(count_retry_events(&events) as u32, expected_retries);
            assert_event_log_coherent(&events);

            // Terminal absorption: nothing mutates a finished job.
            let snapshot = sim.job().await;
            assert!(sim.store.claim_ready("late", 4, None).await.unwrap().is_empty());
            let orphan = ExecutionOutcome {
                result: Ok(sim.success_for(StageId::Ingest)),
                telemetry: StageTelemetry {
                    duration_ms: 1,
                    resource_class: ResourceClass::Cpu,
                },
            };
            sim.orchestrator
                .apply(sim.job_id, StageId::Ingest, &orphan)
                .await
                .unwrap();
            assert_eq!(sim.job().await, snapshot);
        });
    }

    #[test]
    fn crash_recovery_reverts_exactly_one_stage(
        scripts in vec(script_strategy(), 9),
        budget in 2u32..=10,
        crash_at in 0usize..6,
    ) {
        tokio_test::block_on(async {
            let mut sim = Sim::new(&scripts, budget).await;
            let mut claims_done = 0usize;
            let mut steps = 0;
            loop {
                steps += 1;
                assert!(steps < 200, "simulation did not converge");
                let crash = claims_done == crash_at;
                if !sim.step(&scripts, crash).await {
                    break;
                }
                claims_done += 1;
            }

            // A lost lease never charges the budget, so the oracle holds
            // whether or not the crash point was reached.
            let job = sim.job().await;
            let (expected_failure, expected_retries) = expected_outcome(&scripts, budget);
            match expected_failure {
                None => assert_eq!(job.state, JobState::Completed),
                Some(stage) => {
                    assert_eq!(job.state, JobState::Failed);
                    assert_eq!(job.failure.as_ref().unwrap().stage_id, stage);
                }
            }
            assert_eq!(job.attempt_budget, budget - expected_retries);
        });
    }

    #[test]
    fn submit_is_idempotent_in_shape(
        title in "[a-zA-Z0-9 ]{1,40}",
        budget in 0u32..=10,
        publish in any::<bool>(),
    ) {
        tokio_test::block_on(async {
            let registry = sim_registry();
            let engine = Engine::builder(registry).build();
            let options = JobOptions {
                attempt_budget: budget,
                publish,
                ..Default::default()
            };
            let input = PaperInput::title(title.trim().to_string() + "x");

            let a = engine.submit(input.clone(), options.clone()).await.unwrap();
            let b = engine.submit(input.clone(), options.clone()).await.unwrap();
            prop_assert_ne!(a, b);

            let ja = engine.get(a).await.unwrap();
            let jb = engine.get(b).await.unwrap();
            prop_assert_eq!(&ja.input, &jb.input);
            prop_assert_eq!(&ja.options, &jb.options);
            prop_assert_eq!(&ja.stage_states, &jb.stage_states);
            prop_assert_eq!(&ja.artifacts, &jb.artifacts);
            Ok(())
        })?;
    }
}
