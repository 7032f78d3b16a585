/*
 * Paperreel Orchestration - Paper-to-Video Job Orchestration Core
 *
 * Durable state machine driving the fixed specialist pipeline
 * (ingest -> understand -> script -> plan -> animate -> voice ->
 * compose -> metadata -> publish) with per-stage retry/fallback,
 * persistent checkpointing, and bounded concurrency.
 *
 * Architecture:
 * - Job Store (in-memory + SQLite) with leased claims
 * - Stage Registry (pluggable workers, ordered fallbacks)
 * - Retry Policy Engine (deterministic under a seeded jitter source)
 * - Scheduler (semaphore-gated, round-robin over resource classes)
 * - Stage Executor (deadline/cancellation race, contract validation)
 * - Orchestrator (per-job state machine, CAS writes)
 * - Progress Bus (lossy broadcast + durable event log)
 */

// Public modules
pub mod artifact;
pub mod bus;
pub mod clock;
pub mod engine;
pub mod error;
pub mod executor;
pub mod job;
pub mod options;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod stage;
pub mod store;

// Deterministic harness (crate tests + downstream suites)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-exports
pub use artifact::{keys, ArtifactPattern, BlobRef, BlobStore, MemoryBlobStore};
pub use bus::{ProgressBus, ProgressEvent, ProgressReceiver, Transition};
pub use clock::{system_clock, Clock, SharedClock, SystemClock};
pub use engine::{Engine, EngineBuilder};
pub use error::{ErrorKind, OrchestratorError, Result, StageError};
pub use executor::{ExecutionOutcome, StageExecutor, StageTelemetry};
pub use job::{
    ClaimInfo, Job, JobFailure, JobState, Lease, PaperInput, StageId, StagePhase, StagePlan,
    StageState,
};
pub use options::{ConcurrencyLimits, JobOptions, Quality, DEFAULT_ATTEMPT_BUDGET};
pub use orchestrator::Orchestrator;
pub use registry::{PipelineWorkers, ResourceClass, StageRegistry, StageSpec};
pub use retry::{RetryConfig, RetryDecision, RetryPolicy};
pub use scheduler::Scheduler;
pub use stage::{StageCost, StageRequest, StageResult, StageSuccess, StageWorker};
pub use store::{ClaimedJob, JobStore, MemoryJobStore, SqliteJobStore, StoreError};
