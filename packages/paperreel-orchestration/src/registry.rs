use crate::artifact::{keys, ArtifactPattern, BlobRef};
use crate::error::{ErrorKind, OrchestratorError, Result, StageError};
use crate::job::{StageId, StagePlan};
use crate::options::JobOptions;
use crate::stage::StageWorker;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Capacity-accounting tag partitioning workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceClass {
    Cpu,
    Gpu,
    NetHeavy,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 3] =
        [ResourceClass::Cpu, ResourceClass::Gpu, ResourceClass::NetHeavy];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::Cpu => "cpu",
            ResourceClass::Gpu => "gpu",
            ResourceClass::NetHeavy => "net-heavy",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(ResourceClass::Cpu),
            "gpu" => Ok(ResourceClass::Gpu),
            "net-heavy" => Ok(ResourceClass::NetHeavy),
            _ => Err(OrchestratorError::parse(format!(
                "Invalid resource class: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_retryable() -> HashSet<ErrorKind> {
    [
        ErrorKind::Transient,
        ErrorKind::Timeout,
        ErrorKind::ResourceExhausted,
        ErrorKind::LeaseLost,
    ]
    .into_iter()
    .collect()
}

/// Static declaration of one stage: its workers (primary first, fallbacks in
/// order), capacity class, timeout, retry posture, and artifact contract.
#[derive(Clone)]
pub struct StageSpec {
    pub id: StageId,
    pub display_name: &'static str,
    pub workers: Vec<Arc<dyn StageWorker>>,
    pub resource_class: ResourceClass,
    pub default_timeout_secs: u64,
    pub max_attempts: u32,
    pub retryable_kinds: HashSet<ErrorKind>,
    pub skippable: bool,
    pub input_keys: Vec<ArtifactPattern>,
    pub output_keys: Vec<ArtifactPattern>,
}

impl StageSpec {
    pub fn new(
        id: StageId,
        display_name: &'static str,
        resource_class: ResourceClass,
        primary: Arc<dyn StageWorker>,
    ) -> Self {
        Self {
            id,
            display_name,
            workers: vec![primary],
            resource_class,
            default_timeout_secs: 300,
            max_attempts: 5,
            retryable_kinds: default_retryable(),
            skippable: false,
            input_keys: Vec::new(),
            output_keys: Vec::new(),
        }
    }

    pub fn with_fallback(mut self, worker: Arc<dyn StageWorker>) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_kinds = kinds.into_iter().collect();
        self
    }

    pub fn skippable(mut self) -> Self {
        self.skippable = true;
        self
    }

    pub fn with_inputs(mut self, patterns: impl IntoIterator<Item = &'static str>) -> Self {
        self.input_keys = patterns.into_iter().map(ArtifactPattern::new).collect();
        self
    }

    pub fn with_outputs(mut self, patterns: impl IntoIterator<Item = &'static str>) -> Self {
        self.output_keys = patterns.into_iter().map(ArtifactPattern::new).collect();
        self
    }
}

impl std::fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSpec")
            .field("id", &self.id)
            .field("workers", &self.workers.len())
            .field("resource_class", &self.resource_class)
            .field("timeout_secs", &self.default_timeout_secs)
            .finish()
    }
}

/// Ordered stage table defining the pipeline. Linear today; the ordered
/// spec list is where branch support would attach.
pub struct StageRegistry {
    specs: Vec<StageSpec>,
    index: HashMap<StageId, usize>,
}

impl StageRegistry {
    pub fn new(specs: Vec<StageSpec>) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, spec) in specs.iter().enumerate() {
            if spec.workers.is_empty() {
                return Err(OrchestratorError::registry(format!(
                    "stage {} has no workers",
                    spec.id
                )));
            }
            if index.insert(spec.id, i).is_some() {
                return Err(OrchestratorError::registry(format!(
                    "stage {} registered twice",
                    spec.id
                )));
            }
        }
        if specs.is_empty() {
            return Err(OrchestratorError::registry("empty pipeline"));
        }
        Ok(Self { specs, index })
    }

    pub fn order(&self) -> impl Iterator<Item = StageId> + '_ {
        self.specs.iter().map(|s| s.id)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn spec(&self, stage_id: StageId) -> Result<&StageSpec> {
        self.index
            .get(&stage_id)
            .map(|&i| &self.specs[i])
            .ok_or_else(|| OrchestratorError::StageNotFound(stage_id.to_string()))
    }

    pub fn first(&self) -> StageId {
        self.specs[0].id
    }

    /// Successor in pipeline order; `None` past the last stage.
    pub fn next(&self, stage_id: StageId) -> Option<StageId> {
        let i = *self.index.get(&stage_id)?;
        self.specs.get(i + 1).map(|s| s.id)
    }

    pub fn resolve(&self, stage_id: StageId, fallback_index: u32) -> Result<Arc<dyn StageWorker>> {
        let spec = self.spec(stage_id)?;
        spec.workers
            .get(fallback_index as usize)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::registry(format!(
                    "stage {} has no worker at fallback index {}",
                    stage_id, fallback_index
                ))
            })
    }

    pub fn worker_count(&self, stage_id: StageId) -> usize {
        self.spec(stage_id).map(|s| s.workers.len()).unwrap_or(0)
    }

    pub fn declared_retryable(&self, stage_id: StageId, kind: ErrorKind) -> bool {
        self.spec(stage_id)
            .map(|s| s.retryable_kinds.contains(&kind))
            .unwrap_or(false)
    }

    /// Resolve the per-stage execution plan for a submission: timeout
    /// overrides applied, skip set validated against skippable flags,
    /// `publish=false` folded into the skips.
    pub fn plan(&self, options: &JobOptions) -> Result<Vec<StagePlan>> {
        for stage in &options.skip_stages {
            let spec = self.spec(*stage)?;
            if !spec.skippable {
                return Err(OrchestratorError::InvalidOptions(format!(
                    "stage {} is not skippable",
                    stage
                )));
            }
        }
        Ok(self
            .specs
            .iter()
            .map(|spec| StagePlan {
                stage_id: spec.id,
                resource_class: spec.resource_class,
                timeout_secs: options
                    .timeout_override(spec.id)
                    .unwrap_or(spec.default_timeout_secs),
                skipped: options.skip_stages.contains(&spec.id)
                    || (spec.id == StageId::Publish && !options.publish),
            })
            .collect())
    }

    /// Gather the declared inputs for a stage out of the job's artifact map.
    /// Per-scene patterns collect every matching key. An input is only
    /// required when its producing stage actually ran: artifacts from
    /// stages in `skipped` are passed through when present and tolerated
    /// when absent.
    pub fn collect_inputs(
        &self,
        stage_id: StageId,
        artifacts: &BTreeMap<String, BlobRef>,
        skipped: &HashSet<StageId>,
    ) -> Result<BTreeMap<String, BlobRef>> {
        let spec = self.spec(stage_id)?;
        let mut inputs = BTreeMap::new();
        for pattern in &spec.input_keys {
            let mut matched = false;
            for (key, blob) in artifacts {
                if pattern.matches(key) {
                    inputs.insert(key.clone(), blob.clone());
                    matched = true;
                }
            }
            if !matched && !self.produced_by_skipped(pattern, skipped) {
                return Err(OrchestratorError::registry(format!(
                    "stage {} is missing required input {}",
                    stage_id, pattern
                )));
            }
        }
        Ok(inputs)
    }

    fn produced_by_skipped(&self, pattern: &ArtifactPattern, skipped: &HashSet<StageId>) -> bool {
        self.specs.iter().any(|spec| {
            skipped.contains(&spec.id)
                && spec
                    .output_keys
                    .iter()
                    .any(|out| out.as_str() == pattern.as_str())
        })
    }

    /// Check produced keys against the declaration. Missing or unexpected
    /// keys are a contract violation.
    pub fn validate_outputs(
        &self,
        stage_id: StageId,
        produced: &BTreeMap<String, BlobRef>,
    ) -> std::result::Result<(), StageError> {
        let spec = match self.spec(stage_id) {
            Ok(spec) => spec,
            Err(e) => return Err(StageError::internal(e.to_string())),
        };
        for key in produced.keys() {
            if !spec.output_keys.iter().any(|p| p.matches(key)) {
                return Err(StageError::contract_violation(format!(
                    "stage {} produced undeclared artifact key {}",
                    stage_id, key
                )));
            }
        }
        for pattern in &spec.output_keys {
            if !produced.keys().any(|k| pattern.matches(k)) {
                return Err(StageError::contract_violation(format!(
                    "stage {} did not produce declared artifact {}",
                    stage_id, pattern
                )));
            }
        }
        Ok(())
    }

    /// Human-readable pipeline plan, for logs.
    pub fn execution_plan(&self) -> String {
        self.specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                format!(
                    "Stage {}: {} [{}]",
                    i + 1,
                    spec.display_name,
                    spec.resource_class
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Worker assignments for the standard paper-to-video pipeline.
pub struct PipelineWorkers {
    pub ingest: Vec<Arc<dyn StageWorker>>,
    pub understand: Vec<Arc<dyn StageWorker>>,
    pub script: Vec<Arc<dyn StageWorker>>,
    pub plan: Vec<Arc<dyn StageWorker>>,
    pub animate: Vec<Arc<dyn StageWorker>>,
    pub voice: Vec<Arc<dyn StageWorker>>,
    pub compose: Vec<Arc<dyn StageWorker>>,
    pub metadata: Vec<Arc<dyn StageWorker>>,
    pub publish: Vec<Arc<dyn StageWorker>>,
}

impl StageRegistry {
    /// The standard nine-stage pipeline with its artifact topology.
    pub fn video_pipeline(workers: PipelineWorkers) -> Result<Self> {
        fn with_workers(mut spec: StageSpec, mut rest: Vec<Arc<dyn StageWorker>>) -> StageSpec {
            spec.workers.append(&mut rest);
            spec
        }

        fn primary(
            mut workers: Vec<Arc<dyn StageWorker>>,
            stage: StageId,
        ) -> Result<(Arc<dyn StageWorker>, Vec<Arc<dyn StageWorker>>)> {
            if workers.is_empty() {
                return Err(OrchestratorError::registry(format!(
                    "no worker assigned for stage {}",
                    stage
                )));
            }
            let first = workers.remove(0);
            Ok((first, workers))
        }

        let (ingest, ingest_rest) = primary(workers.ingest, StageId::Ingest)?;
        let (understand, understand_rest) = primary(workers.understand, StageId::Understand)?;
        let (script, script_rest) = primary(workers.script, StageId::Script)?;
        let (plan, plan_rest) = primary(workers.plan, StageId::Plan)?;
        let (animate, animate_rest) = primary(workers.animate, StageId::Animate)?;
        let (voice, voice_rest) = primary(workers.voice, StageId::Voice)?;
        let (compose, compose_rest) = primary(workers.compose, StageId::Compose)?;
        let (metadata, metadata_rest) = primary(workers.metadata, StageId::Metadata)?;
        let (publish, publish_rest) = primary(workers.publish, StageId::Publish)?;

        Self::new(vec![
            with_workers(
                StageSpec::new(StageId::Ingest, "Paper Ingest", ResourceClass::NetHeavy, ingest)
                    .with_timeout_secs(120)
                    .with_outputs([keys::PAPER_PARSED]),
                ingest_rest,
            ),
            with_workers(
                StageSpec::new(
                    StageId::Understand,
                    "Paper Understanding",
                    ResourceClass::NetHeavy,
                    understand,
                )
                .with_timeout_secs(300)
                .with_inputs([keys::PAPER_PARSED])
                .with_outputs([keys::PAPER_UNDERSTANDING]),
                understand_rest,
            ),
            with_workers(
                StageSpec::new(StageId::Script, "Script Writing", ResourceClass::NetHeavy, script)
                    .with_timeout_secs(300)
                    .with_inputs([keys::PAPER_UNDERSTANDING])
                    .with_outputs([keys::SCRIPT]),
                script_rest,
            ),
            with_workers(
                StageSpec::new(StageId::Plan, "Visual Planning", ResourceClass::NetHeavy, plan)
                    .with_timeout_secs(300)
                    .with_inputs([keys::SCRIPT])
                    .with_outputs([keys::VISUAL_PLAN]),
                plan_rest,
            ),
            with_workers(
                StageSpec::new(
                    StageId::Animate,
                    "Scene Animation",
                    ResourceClass::Gpu,
                    animate,
                )
                .with_timeout_secs(900)
                .with_inputs([keys::VISUAL_PLAN])
                .with_outputs(["scene.<n>.animation"]),
                animate_rest,
            ),
            with_workers(
                StageSpec::new(StageId::Voice, "Narration", ResourceClass::NetHeavy, voice)
                    .with_timeout_secs(600)
                    .with_inputs([keys::SCRIPT, keys::VISUAL_PLAN])
                    .with_outputs(["scene.<n>.audio"]),
                voice_rest,
            ),
            with_workers(
                StageSpec::new(StageId::Compose, "Video Composition", ResourceClass::Cpu, compose)
                    .with_timeout_secs(600)
                    .with_inputs(["scene.<n>.animation", "scene.<n>.audio"])
                    .with_outputs([keys::VIDEO_FINAL]),
                compose_rest,
            ),
            with_workers(
                StageSpec::new(
                    StageId::Metadata,
                    "Publishing Metadata",
                    ResourceClass::Cpu,
                    metadata,
                )
                .with_timeout_secs(120)
                .with_inputs([keys::PAPER_UNDERSTANDING, keys::SCRIPT])
                .with_outputs([keys::METADATA])
                .skippable(),
                metadata_rest,
            ),
            with_workers(
                StageSpec::new(StageId::Publish, "Publish", ResourceClass::NetHeavy, publish)
                    .with_timeout_secs(300)
                    .with_inputs([keys::VIDEO_FINAL, keys::METADATA])
                    .skippable(),
                publish_rest,
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{StageRequest, StageResult, StageSuccess};
    use async_trait::async_trait;

    struct NoopWorker;

    #[async_trait]
    impl StageWorker for NoopWorker {
        fn name(&self) -> &str {
            "noop"
        }

        async fn run(&self, _request: StageRequest) -> StageResult {
            Ok(StageSuccess {
                output_artifacts: BTreeMap::new(),
                cost: crate::stage::StageCost {
                    duration_ms: 0,
                    resource_class: ResourceClass::Cpu,
                },
            })
        }
    }

    fn noop() -> Arc<dyn StageWorker> {
        Arc::new(NoopWorker)
    }

    fn pipeline() -> StageRegistry {
        StageRegistry::video_pipeline(PipelineWorkers {
            ingest: vec![noop()],
            understand: vec![noop()],
            script: vec![noop()],
            plan: vec![noop()],
            animate: vec![noop(), noop()],
            voice: vec![noop()],
            compose: vec![noop()],
            metadata: vec![noop()],
            publish: vec![noop()],
        })
        .unwrap()
    }

    #[test]
    fn test_resource_class_roundtrip() {
        for class in ResourceClass::ALL {
            assert_eq!(ResourceClass::from_str(class.as_str()).unwrap(), class);
        }
        assert!(ResourceClass::from_str("tpu").is_err());
    }

    #[test]
    fn test_pipeline_order_is_linear() {
        let registry = pipeline();
        assert_eq!(registry.first(), StageId::Ingest);
        let order: Vec<StageId> = registry.order().collect();
        assert_eq!(order, StageId::ALL.to_vec());
        assert_eq!(registry.next(StageId::Ingest), Some(StageId::Understand));
        assert_eq!(registry.next(StageId::Publish), None);
    }

    #[test]
    fn test_resolve_fallback_bounds() {
        let registry = pipeline();
        assert!(registry.resolve(StageId::Animate, 0).is_ok());
        assert!(registry.resolve(StageId::Animate, 1).is_ok());
        assert!(registry.resolve(StageId::Animate, 2).is_err());
        assert!(registry.resolve(StageId::Ingest, 1).is_err());
    }

    #[test]
    fn test_declared_retryable_defaults() {
        let registry = pipeline();
        assert!(registry.declared_retryable(StageId::Voice, ErrorKind::Transient));
        assert!(registry.declared_retryable(StageId::Voice, ErrorKind::Timeout));
        assert!(!registry.declared_retryable(StageId::Voice, ErrorKind::ContractViolation));
        assert!(!registry.declared_retryable(StageId::Voice, ErrorKind::NonRetryable));
    }

    #[test]
    fn test_plan_applies_overrides_and_skips() {
        let registry = pipeline();
        let mut options = JobOptions::default();
        options.stage_timeouts.insert(StageId::Voice, 2);
        options.publish = false;
        options.skip_stages.insert(StageId::Metadata);

        let plans = registry.plan(&options).unwrap();
        let voice = plans.iter().find(|p| p.stage_id == StageId::Voice).unwrap();
        assert_eq!(voice.timeout_secs, 2);
        assert!(plans.iter().find(|p| p.stage_id == StageId::Metadata).unwrap().skipped);
        assert!(plans.iter().find(|p| p.stage_id == StageId::Publish).unwrap().skipped);
        assert!(!plans.iter().find(|p| p.stage_id == StageId::Animate).unwrap().skipped);
    }

    #[test]
    fn test_plan_rejects_unskippable_skip() {
        let registry = pipeline();
        let mut options = JobOptions::default();
        options.skip_stages.insert(StageId::Animate);
        assert!(registry.plan(&options).is_err());
    }

    #[test]
    fn test_collect_inputs_expands_scene_patterns() {
        let registry = pipeline();
        let mut artifacts = BTreeMap::new();
        for key in [
            "scene.0.animation",
            "scene.1.animation",
            "scene.0.audio",
            "scene.1.audio",
            "script",
            "visual_plan",
        ] {
            artifacts.insert(key.to_string(), BlobRef::new(format!("mem://{}", key)));
        }

        let inputs = registry
            .collect_inputs(StageId::Compose, &artifacts, &HashSet::new())
            .unwrap();
        assert_eq!(inputs.len(), 4);
        assert!(inputs.contains_key("scene.1.audio"));
        assert!(!inputs.contains_key("script"));
    }

    #[test]
    fn test_collect_inputs_missing_is_error() {
        let registry = pipeline();
        let artifacts = BTreeMap::new();
        assert!(registry
            .collect_inputs(StageId::Compose, &artifacts, &HashSet::new())
            .is_err());
    }

    #[test]
    fn test_collect_inputs_tolerates_skipped_producer() {
        let registry = pipeline();
        let mut artifacts = BTreeMap::new();
        artifacts.insert("video.final".to_string(), BlobRef::new("v"));

        // With metadata skipped, publish can still gather its inputs.
        let skipped: HashSet<StageId> = [StageId::Metadata].into_iter().collect();
        let inputs = registry
            .collect_inputs(StageId::Publish, &artifacts, &skipped)
            .unwrap();
        assert_eq!(inputs.len(), 1);

        // Without the skip, the missing metadata artifact is an error.
        assert!(registry
            .collect_inputs(StageId::Publish, &artifacts, &HashSet::new())
            .is_err());
    }

    #[test]
    fn test_validate_outputs_missing_scene_key() {
        let registry = pipeline();
        let mut produced = BTreeMap::new();
        produced.insert("scene.0.animation".to_string(), BlobRef::new("a"));
        assert!(registry.validate_outputs(StageId::Animate, &produced).is_ok());

        let err = registry
            .validate_outputs(StageId::Animate, &BTreeMap::new())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ContractViolation);
        assert!(err.suggested_fallback);
    }

    #[test]
    fn test_validate_outputs_unexpected_key() {
        let registry = pipeline();
        let mut produced = BTreeMap::new();
        produced.insert("video.final".to_string(), BlobRef::new("v"));
        produced.insert("debug.dump".to_string(), BlobRef::new("d"));
        let err = registry
            .validate_outputs(StageId::Compose, &produced)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ContractViolation);
    }

    #[test]
    fn test_publish_declares_no_outputs() {
        let registry = pipeline();
        assert!(registry
            .validate_outputs(StageId::Publish, &BTreeMap::new())
            .is_ok());
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let result = StageRegistry::new(vec![
            StageSpec::new(StageId::Ingest, "A", ResourceClass::Cpu, noop()),
            StageSpec::new(StageId::Ingest, "B", ResourceClass::Cpu, noop()),
        ]);
        assert!(result.is_err());
    }
}
