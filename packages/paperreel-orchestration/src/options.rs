use crate::error::{OrchestratorError, Result};
use crate::job::StageId;
use crate::registry::ResourceClass;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

pub const DEFAULT_ATTEMPT_BUDGET: u32 = 8;

/// Render quality tier, propagated opaquely to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
    #[serde(rename = "cinematic_4k")]
    Cinematic4k,
    #[serde(rename = "cinematic_8k")]
    Cinematic8k,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Low => "low",
            Quality::Medium => "medium",
            Quality::High => "high",
            Quality::Cinematic4k => "cinematic_4k",
            Quality::Cinematic8k => "cinematic_8k",
        }
    }
}

/// Concurrency ceilings. Engine-wide defaults come from the builder; a job
/// may carry its own (reserved for branch/DAG execution, where a single job
/// can have more than one stage in flight).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConcurrencyLimits {
    pub global: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_stage: Option<HashMap<StageId, usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_resource_class: Option<HashMap<ResourceClass, usize>>,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            global: 8,
            per_stage: None,
            per_resource_class: None,
        }
    }
}

impl ConcurrencyLimits {
    pub fn stage_cap(&self, stage: StageId) -> Option<usize> {
        self.per_stage.as_ref().and_then(|m| m.get(&stage).copied())
    }

    pub fn class_cap(&self, class: ResourceClass) -> Option<usize> {
        self.per_resource_class
            .as_ref()
            .and_then(|m| m.get(&class).copied())
    }
}

/// Options recognized at submit. Unknown keys are rejected during
/// deserialization; value ranges are checked by [`JobOptions::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct JobOptions {
    pub quality: Quality,
    pub voice: Option<String>,
    pub target_duration: Option<u32>,
    pub attempt_budget: u32,
    pub stage_timeouts: HashMap<StageId, u64>,
    pub concurrency: Option<ConcurrencyLimits>,
    pub skip_stages: BTreeSet<StageId>,
    pub publish: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            quality: Quality::default(),
            voice: None,
            target_duration: None,
            attempt_budget: DEFAULT_ATTEMPT_BUDGET,
            stage_timeouts: HashMap::new(),
            concurrency: None,
            skip_stages: BTreeSet::new(),
            publish: true,
        }
    }
}

impl JobOptions {
    /// Parse from a raw JSON mapping, rejecting unrecognized keys.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let options: JobOptions = serde_json::from_value(value)
            .map_err(|e| OrchestratorError::InvalidOptions(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(secs) = self.target_duration {
            if secs < 1 {
                return Err(OrchestratorError::InvalidOptions(
                    "target_duration must be >= 1 second".to_string(),
                ));
            }
        }
        for (stage, secs) in &self.stage_timeouts {
            if *secs == 0 {
                return Err(OrchestratorError::InvalidOptions(format!(
                    "stage_timeouts.{} must be positive",
                    stage
                )));
            }
        }
        if let Some(limits) = &self.concurrency {
            if limits.global == 0 {
                return Err(OrchestratorError::InvalidOptions(
                    "concurrency.global must be >= 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Effective timeout for a stage, in seconds.
    pub fn timeout_override(&self, stage: StageId) -> Option<u64> {
        self.stage_timeouts.get(&stage).copied()
    }
}
