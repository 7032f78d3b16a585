use crate::artifact::BlobRef;
use crate::error::StageError;
use crate::job::StageId;
use crate::options::JobOptions;
use crate::registry::ResourceClass;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything a worker receives for one invocation.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub job_id: Uuid,
    pub stage_id: StageId,
    pub input_artifacts: BTreeMap<String, BlobRef>,
    pub options: JobOptions,
    pub deadline: DateTime<Utc>,
    pub attempt: u32,
    pub fallback_index: u32,
    /// Soft-cancel signal. Workers should abort at the next safe point once
    /// this fires; the executor hard-cancels regardless.
    pub cancel: CancellationToken,
}

/// What a completed invocation cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCost {
    pub duration_ms: u64,
    pub resource_class: ResourceClass,
}

#[derive(Debug, Clone)]
pub struct StageSuccess {
    pub output_artifacts: BTreeMap<String, BlobRef>,
    pub cost: StageCost,
}

pub type StageResult = std::result::Result<StageSuccess, StageError>;

/// The uniform contract every specialist stage honors.
///
/// Implementations must be idempotent under identical
/// `(job_id, stage_id, attempt, fallback_index)`: reinvocation may
/// recompute, but must not corrupt previously written artifacts.
#[async_trait]
pub trait StageWorker: Send + Sync {
    /// Stable name, used in logs and telemetry.
    fn name(&self) -> &str;

    async fn run(&self, request: StageRequest) -> StageResult;
}
