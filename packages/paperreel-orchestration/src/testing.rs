//! Deterministic test support: a manual clock, scriptable stage workers,
//! and ready-made stub pipelines. Compiled for this crate's own tests and
//! behind the `testing` feature for downstream suites.

use crate::artifact::{keys, BlobRef};
use crate::clock::Clock;
use crate::error::StageError;
use crate::job::StageId;
use crate::registry::{PipelineWorkers, ResourceClass, StageRegistry};
use crate::stage::{StageCost, StageRequest, StageResult, StageSuccess, StageWorker};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Tracks how many workers are inside their `run` at once.
#[derive(Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(self: &Arc<Self>) -> ProbeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        ProbeGuard {
            probe: self.clone(),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn max_seen(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

pub struct ProbeGuard {
    probe: Arc<ConcurrencyProbe>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.probe.current.fetch_sub(1, Ordering::SeqCst);
    }
}

enum ScriptedOutcome {
    Succeed,
    SucceedWith(BTreeMap<String, BlobRef>),
    Fail(StageError),
    SleepMs(u64),
}

/// Worker that plays back a queue of per-attempt outcomes, then succeeds
/// with its default outputs forever after. Minted blob references embed the
/// attempt and fallback index, so reinvocation never collides with prior
/// artifacts.
pub struct ScriptedWorker {
    name: String,
    outputs: Vec<String>,
    class: ResourceClass,
    script: Mutex<VecDeque<ScriptedOutcome>>,
    probe: Option<Arc<ConcurrencyProbe>>,
    invocations: AtomicUsize,
}

impl ScriptedWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outputs: Vec::new(),
            class: ResourceClass::Cpu,
            script: Mutex::new(VecDeque::new()),
            probe: None,
            invocations: AtomicUsize::new(0),
        }
    }

    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = String>) -> Self {
        self.outputs = outputs.into_iter().collect();
        self
    }

    pub fn with_class(mut self, class: ResourceClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_probe(mut self, probe: Arc<ConcurrencyProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn then_succeed(self) -> Self {
        self.script.lock().push_back(ScriptedOutcome::Succeed);
        self
    }

    pub fn then_succeed_with(self, outputs: BTreeMap<String, BlobRef>) -> Self {
        self.script
            .lock()
            .push_back(ScriptedOutcome::SucceedWith(outputs));
        self
    }

    pub fn then_fail(self, error: StageError) -> Self {
        self.script.lock().push_back(ScriptedOutcome::Fail(error));
        self
    }

    pub fn then_sleep_ms(self, ms: u64) -> Self {
        self.script.lock().push_back(ScriptedOutcome::SleepMs(ms));
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    fn mint(&self, request: &StageRequest) -> StageSuccess {
        let output_artifacts = self
            .outputs
            .iter()
            .map(|key| {
                (
                    key.clone(),
                    BlobRef::new(format!(
                        "mem://{}/{}/a{}f{}",
                        request.job_id, key, request.attempt, request.fallback_index
                    )),
                )
            })
            .collect();
        StageSuccess {
            output_artifacts,
            cost: StageCost {
                duration_ms: 1,
                resource_class: self.class,
            },
        }
    }
}

#[async_trait]
impl StageWorker for ScriptedWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, request: StageRequest) -> StageResult {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let _guard = self.probe.as_ref().map(|p| p.enter());
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(ScriptedOutcome::Succeed);
        match outcome {
            ScriptedOutcome::Succeed => Ok(self.mint(&request)),
            ScriptedOutcome::SucceedWith(outputs) => Ok(StageSuccess {
                output_artifacts: outputs,
                cost: StageCost {
                    duration_ms: 1,
                    resource_class: self.class,
                },
            }),
            ScriptedOutcome::Fail(error) => Err(error),
            ScriptedOutcome::SleepMs(ms) => {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(ms)) => {
                        Ok(self.mint(&request))
                    }
                    _ = request.cancel.cancelled() => Err(StageError::cancelled()),
                }
            }
        }
    }
}

/// Output keys each stub stage produces for a pipeline with `scene_count`
/// scenes.
pub fn stage_outputs(stage: StageId, scene_count: usize) -> Vec<String> {
    match stage {
        StageId::Ingest => vec![keys::PAPER_PARSED.to_string()],
        StageId::Understand => vec![keys::PAPER_UNDERSTANDING.to_string()],
        StageId::Script => vec![keys::SCRIPT.to_string()],
        StageId::Plan => vec![keys::VISUAL_PLAN.to_string()],
        StageId::Animate => (0..scene_count).map(keys::scene_animation).collect(),
        StageId::Voice => (0..scene_count).map(keys::scene_audio).collect(),
        StageId::Compose => vec![keys::VIDEO_FINAL.to_string()],
        StageId::Metadata => vec![keys::METADATA.to_string()],
        StageId::Publish => vec![],
    }
}

/// One always-succeeding stub worker for a stage.
pub fn stub_worker(stage: StageId, scene_count: usize) -> Arc<ScriptedWorker> {
    Arc::new(
        ScriptedWorker::new(format!("stub-{}", stage))
            .with_outputs(stage_outputs(stage, scene_count)),
    )
}

/// Stub worker assignments for the full pipeline; tests override individual
/// fields before building the registry.
pub fn stub_workers(scene_count: usize) -> PipelineWorkers {
    PipelineWorkers {
        ingest: vec![stub_worker(StageId::Ingest, scene_count)],
        understand: vec![stub_worker(StageId::Understand, scene_count)],
        script: vec![stub_worker(StageId::Script, scene_count)],
        plan: vec![stub_worker(StageId::Plan, scene_count)],
        animate: vec![stub_worker(StageId::Animate, scene_count)],
        voice: vec![stub_worker(StageId::Voice, scene_count)],
        compose: vec![stub_worker(StageId::Compose, scene_count)],
        metadata: vec![stub_worker(StageId::Metadata, scene_count)],
        publish: vec![stub_worker(StageId::Publish, scene_count)],
    }
}

/// A registry where every stage succeeds first try.
pub fn stub_registry(scene_count: usize) -> StageRegistry {
    StageRegistry::video_pipeline(stub_workers(scene_count)).expect("stub pipeline is valid")
}

/// Stub registry with the ingest stage replaced.
pub fn stub_registry_with_ingest(
    ingest: Arc<dyn StageWorker>,
    scene_count: usize,
) -> StageRegistry {
    let mut workers = stub_workers(scene_count);
    workers.ingest = vec![ingest];
    StageRegistry::video_pipeline(workers).expect("stub pipeline is valid")
}

/// Stub registry whose every worker reports into one concurrency probe.
pub fn stub_registry_with_probe(
    scene_count: usize,
    probe: Arc<ConcurrencyProbe>,
) -> StageRegistry {
    let workers = PipelineWorkers {
        ingest: vec![probed(StageId::Ingest, scene_count, &probe)],
        understand: vec![probed(StageId::Understand, scene_count, &probe)],
        script: vec![probed(StageId::Script, scene_count, &probe)],
        plan: vec![probed(StageId::Plan, scene_count, &probe)],
        animate: vec![probed(StageId::Animate, scene_count, &probe)],
        voice: vec![probed(StageId::Voice, scene_count, &probe)],
        compose: vec![probed(StageId::Compose, scene_count, &probe)],
        metadata: vec![probed(StageId::Metadata, scene_count, &probe)],
        publish: vec![probed(StageId::Publish, scene_count, &probe)],
    };
    StageRegistry::video_pipeline(workers).expect("stub pipeline is valid")
}

fn probed(
    stage: StageId,
    scene_count: usize,
    probe: &Arc<ConcurrencyProbe>,
) -> Arc<ScriptedWorker> {
    Arc::new(
        ScriptedWorker::new(format!("stub-{}", stage))
            .with_outputs(stage_outputs(stage, scene_count))
            .with_probe(probe.clone())
            // A small dwell makes concurrent overlap observable.
            .then_sleep_ms(5),
    )
}
