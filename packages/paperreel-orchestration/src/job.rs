use crate::artifact::BlobRef;
use crate::error::{OrchestratorError, Result, StageError};
use crate::options::JobOptions;
use crate::registry::ResourceClass;
use crate::stage::StageCost;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Stage identifier. Declaration order is pipeline order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Ingest,
    Understand,
    Script,
    Plan,
    Animate,
    Voice,
    Compose,
    Metadata,
    Publish,
}

impl StageId {
    pub const ALL: [StageId; 9] = [
        StageId::Ingest,
        StageId::Understand,
        StageId::Script,
        StageId::Plan,
        StageId::Animate,
        StageId::Voice,
        StageId::Compose,
        StageId::Metadata,
        StageId::Publish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Ingest => "ingest",
            StageId::Understand => "understand",
            StageId::Script => "script",
            StageId::Plan => "plan",
            StageId::Animate => "animate",
            StageId::Voice => "voice",
            StageId::Compose => "compose",
            StageId::Metadata => "metadata",
            StageId::Publish => "publish",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "ingest" => Ok(StageId::Ingest),
            "understand" => Ok(StageId::Understand),
            "script" => Ok(StageId::Script),
            "plan" => Ok(StageId::Plan),
            "animate" => Ok(StageId::Animate),
            "voice" => Ok(StageId::Voice),
            "compose" => Ok(StageId::Compose),
            "metadata" => Ok(StageId::Metadata),
            "publish" => Ok(StageId::Publish),
            _ => Err(OrchestratorError::parse(format!("Invalid stage ID: {}", s))),
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The paper reference a job starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaperInput {
    Title { title: String },
    Arxiv { id: String },
    Pdf { blob: BlobRef },
}

impl PaperInput {
    pub fn title(title: impl Into<String>) -> Self {
        PaperInput::Title {
            title: title.into(),
        }
    }

    pub fn arxiv(id: impl Into<String>) -> Self {
        PaperInput::Arxiv { id: id.into() }
    }

    pub fn pdf(blob: BlobRef) -> Self {
        PaperInput::Pdf { blob }
    }

    /// Validation performed synchronously at submit.
    pub fn validate(&self) -> Result<()> {
        match self {
            PaperInput::Title { title } => {
                if title.trim().is_empty() {
                    return Err(OrchestratorError::InvalidInput(
                        "title must not be empty".to_string(),
                    ));
                }
            }
            PaperInput::Arxiv { id } => {
                // Accepts modern ids (2301.00001) and legacy ones (cs/0112017).
                let well_formed = id.split_once('.').map_or(false, |(prefix, rest)| {
                    prefix.len() >= 4
                        && prefix.bytes().all(|b| b.is_ascii_digit())
                        && rest.len() >= 4
                        && rest
                            .trim_end_matches(|c: char| c == 'v' || c.is_ascii_digit())
                            .is_empty()
                }) || id.split_once('/').map_or(false, |(archive, num)| {
                    !archive.is_empty()
                        && archive
                            .bytes()
                            .all(|b| b.is_ascii_lowercase() || b == b'-' || b == b'.')
                        && num.len() >= 7
                        && num.bytes().all(|b| b.is_ascii_digit())
                });
                if !well_formed {
                    return Err(OrchestratorError::InvalidInput(format!(
                        "malformed arXiv identifier: {}",
                        id
                    )));
                }
            }
            PaperInput::Pdf { blob } => {
                if blob.as_str().is_empty() {
                    return Err(OrchestratorError::InvalidInput(
                        "pdf blob reference must not be empty".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "paused" => Ok(JobState::Paused),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            _ => Err(OrchestratorError::parse(format!("Invalid job state: {}", s))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StagePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagePhase::Pending => "pending",
            StagePhase::Ready => "ready",
            StagePhase::Running => "running",
            StagePhase::Succeeded => "succeeded",
            StagePhase::Failed => "failed",
            StagePhase::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StagePhase::Succeeded | StagePhase::Failed | StagePhase::Skipped
        )
    }
}

impl std::fmt::Display for StagePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bounded-TTL claim over a job, held while one of its stages runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// Per-stage execution plan resolved from the registry and job options at
/// submit. Denormalized onto the job so the store can filter claims without
/// consulting the registry.
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub stage_id: StageId,
    pub resource_class: ResourceClass,
    pub timeout_secs: u64,
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub stage_id: StageId,
    pub phase: StagePhase,
    pub attempts: u32,
    pub fallback_index: u32,
    pub resource_class: ResourceClass,
    pub timeout_secs: u64,
    pub last_error: Option<StageError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub output_keys: Vec<String>,
    pub cost: Option<StageCost>,
}

impl StageState {
    fn from_plan(plan: &StagePlan) -> Self {
        Self {
            stage_id: plan.stage_id,
            phase: if plan.skipped {
                StagePhase::Skipped
            } else {
                StagePhase::Pending
            },
            attempts: 0,
            fallback_index: 0,
            resource_class: plan.resource_class,
            timeout_secs: plan.timeout_secs,
            last_error: None,
            started_at: None,
            finished_at: None,
            deadline_at: None,
            ready_at: None,
            output_keys: Vec::new(),
            cost: None,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.phase == StagePhase::Ready && self.ready_at.map_or(true, |at| at <= now)
    }
}

/// Recorded on the job when it transitions to FAILED: the first fatal stage
/// and its structured error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub stage_id: StageId,
    pub error: StageError,
}

/// Result of a successful claim.
#[derive(Debug, Clone)]
pub struct ClaimInfo {
    pub stage_id: StageId,
    pub was_queued: bool,
}

/// Root entity per submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub input: PaperInput,
    pub options: JobOptions,
    pub state: JobState,
    pub current_stage: Option<StageId>,
    pub stage_states: Vec<StageState>,
    pub artifacts: BTreeMap<String, BlobRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attempt_budget: u32,
    pub lease: Option<Lease>,
    pub cancel_requested: bool,
    pub failure: Option<JobFailure>,
}

impl Job {
    /// Create a queued job. The first non-skipped stage starts READY; the
    /// rest PENDING; planned skips are marked SKIPPED up front. A job whose
    /// every stage is skipped is born COMPLETED.
    pub fn new(
        id: Uuid,
        input: PaperInput,
        options: JobOptions,
        plans: &[StagePlan],
        now: DateTime<Utc>,
    ) -> Self {
        let attempt_budget = options.attempt_budget;
        let mut stage_states: Vec<StageState> =
            plans.iter().map(StageState::from_plan).collect();
        let first_runnable = stage_states
            .iter_mut()
            .find(|s| s.phase == StagePhase::Pending);
        let state = match first_runnable {
            Some(stage) => {
                stage.phase = StagePhase::Ready;
                JobState::Queued
            }
            None => JobState::Completed,
        };

        Self {
            id,
            input,
            options,
            state,
            current_stage: None,
            stage_states,
            artifacts: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            attempt_budget,
            lease: None,
            cancel_requested: false,
            failure: None,
        }
    }

    pub fn stage_state(&self, stage_id: StageId) -> Option<&StageState> {
        self.stage_states.iter().find(|s| s.stage_id == stage_id)
    }

    pub fn stage_state_mut(&mut self, stage_id: StageId) -> Option<&mut StageState> {
        self.stage_states.iter_mut().find(|s| s.stage_id == stage_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn lease_active(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().map_or(false, |l| l.expires_at > now)
    }

    /// The stage a claimant would run next, ignoring `ready_at` gating.
    pub fn next_ready(&self) -> Option<&StageState> {
        self.stage_states
            .iter()
            .find(|s| s.phase == StagePhase::Ready)
    }

    /// Claim eligibility as evaluated by the job store.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Queued | JobState::Running)
            && !self.cancel_requested
            && !self.lease_active(now)
            && self
                .stage_states
                .iter()
                .any(|s| s.is_ready(now))
    }

    /// Atomically (from the store's perspective) move the next ready stage
    /// to RUNNING and bind a lease. Returns `None` when nothing is ready.
    pub fn claim_next(
        &mut self,
        owner: &str,
        now: DateTime<Utc>,
        lease_grace_secs: i64,
    ) -> Option<ClaimInfo> {
        if !self.is_claimable(now) {
            return None;
        }
        let was_queued = self.state == JobState::Queued;
        let stage = self.stage_states.iter_mut().find(|s| s.is_ready(now))?;
        stage.phase = StagePhase::Running;
        stage.started_at = Some(now);
        stage.ready_at = None;
        let stage_id = stage.stage_id;
        let ttl = Duration::seconds(stage.timeout_secs as i64 + lease_grace_secs);

        self.state = JobState::Running;
        self.current_stage = Some(stage_id);
        self.lease = Some(Lease {
            owner: owner.to_string(),
            expires_at: now + ttl,
        });
        self.touch(now);
        Some(ClaimInfo {
            stage_id,
            was_queued,
        })
    }

    /// Undo a claim that could not be dispatched (capacity refused). No
    /// events are emitted for the round trip.
    pub fn release_claim(&mut self, info: &ClaimInfo, now: DateTime<Utc>) {
        if let Some(stage) = self.stage_state_mut(info.stage_id) {
            if stage.phase == StagePhase::Running {
                stage.phase = StagePhase::Ready;
                stage.started_at = None;
                stage.deadline_at = None;
            }
        }
        self.lease = None;
        if info.was_queued {
            self.state = JobState::Queued;
            self.current_stage = None;
        }
        self.touch(now);
    }

    /// Transition: RUNNING -> COMPLETED.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.state != JobState::Running && self.state != JobState::Paused {
            return Err(self.bad_transition("completed"));
        }
        self.state = JobState::Completed;
        self.current_stage = None;
        self.lease = None;
        self.touch(now);
        Ok(())
    }

    /// Transition: RUNNING -> FAILED, recording the first fatal stage.
    pub fn fail(&mut self, stage_id: StageId, error: StageError, now: DateTime<Utc>) -> Result<()> {
        if self.is_terminal() {
            return Err(self.bad_transition("failed"));
        }
        self.state = JobState::Failed;
        self.lease = None;
        if self.failure.is_none() {
            self.failure = Some(JobFailure { stage_id, error });
        }
        self.touch(now);
        Ok(())
    }

    /// Transition: any non-terminal state -> CANCELLED.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.is_terminal() {
            return Err(self.bad_transition("cancelled"));
        }
        self.state = JobState::Cancelled;
        self.current_stage = None;
        self.lease = None;
        self.touch(now);
        Ok(())
    }

    /// Transition: QUEUED/RUNNING -> PAUSED. The stage in flight (if any)
    /// runs to its own conclusion; nothing further is claimed.
    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !matches!(self.state, JobState::Queued | JobState::Running) {
            return Err(self.bad_transition("paused"));
        }
        self.state = JobState::Paused;
        self.touch(now);
        Ok(())
    }

    /// Transition: PAUSED -> QUEUED/RUNNING depending on prior progress.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.state != JobState::Paused {
            return Err(self.bad_transition("resumed"));
        }
        let any_started = self
            .stage_states
            .iter()
            .any(|s| s.attempts > 0 || s.phase == StagePhase::Running);
        self.state = if any_started {
            JobState::Running
        } else {
            JobState::Queued
        };
        self.touch(now);
        Ok(())
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        // updated_at doubles as the optimistic-concurrency token; it must
        // move on every write even when the wall clock has not.
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::microseconds(1)
        };
    }

    fn bad_transition(&self, to: &str) -> OrchestratorError {
        OrchestratorError::InvalidStateTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plans() -> Vec<StagePlan> {
        StageId::ALL
            .iter()
            .map(|&stage_id| StagePlan {
                stage_id,
                resource_class: ResourceClass::Cpu,
                timeout_secs: 60,
                skipped: false,
            })
            .collect()
    }

    fn queued_job() -> Job {
        Job::new(
            Uuid::new_v4(),
            PaperInput::title("Attention Is All You Need"),
            JobOptions::default(),
            &plans(),
            Utc::now(),
        )
    }

    #[test]
    fn test_stage_id_roundtrip() {
        for stage in StageId::ALL {
            assert_eq!(StageId::from_str(stage.as_str()).unwrap(), stage);
        }
    }

    #[test]
    fn test_new_job_first_stage_ready() {
        let job = queued_job();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(
            job.stage_state(StageId::Ingest).unwrap().phase,
            StagePhase::Ready
        );
        for stage in &StageId::ALL[1..] {
            assert_eq!(job.stage_state(*stage).unwrap().phase, StagePhase::Pending);
        }
    }

    #[test]
    fn test_new_job_with_skips() {
        let mut stage_plans = plans();
        stage_plans[0].skipped = true;
        let job = Job::new(
            Uuid::new_v4(),
            PaperInput::arxiv("1706.03762"),
            JobOptions::default(),
            &stage_plans,
            Utc::now(),
        );
        assert_eq!(
            job.stage_state(StageId::Ingest).unwrap().phase,
            StagePhase::Skipped
        );
        assert_eq!(
            job.stage_state(StageId::Understand).unwrap().phase,
            StagePhase::Ready
        );
    }

    #[test]
    fn test_new_job_all_skipped_is_completed() {
        let stage_plans: Vec<StagePlan> = plans()
            .into_iter()
            .map(|mut p| {
                p.skipped = true;
                p
            })
            .collect();
        let job = Job::new(
            Uuid::new_v4(),
            PaperInput::title("t"),
            JobOptions::default(),
            &stage_plans,
            Utc::now(),
        );
        assert_eq!(job.state, JobState::Completed);
    }

    #[test]
    fn test_claim_next_binds_lease() {
        let mut job = queued_job();
        let now = Utc::now();
        let claim = job.claim_next("worker-1", now, 30).unwrap();

        assert_eq!(claim.stage_id, StageId::Ingest);
        assert!(claim.was_queued);
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.current_stage, Some(StageId::Ingest));
        let stage = job.stage_state(StageId::Ingest).unwrap();
        assert_eq!(stage.phase, StagePhase::Running);
        assert!(job.lease_active(now));
        assert_eq!(
            job.lease.as_ref().unwrap().expires_at,
            now + Duration::seconds(90)
        );
    }

    #[test]
    fn test_claim_respects_ready_at() {
        let mut job = queued_job();
        let now = Utc::now();
        job.stage_state_mut(StageId::Ingest).unwrap().ready_at =
            Some(now + Duration::seconds(10));
        assert!(job.claim_next("worker-1", now, 30).is_none());
        assert!(job
            .claim_next("worker-1", now + Duration::seconds(11), 30)
            .is_some());
    }

    #[test]
    fn test_claim_skips_cancel_requested() {
        let mut job = queued_job();
        job.cancel_requested = true;
        assert!(job.claim_next("worker-1", Utc::now(), 30).is_none());
    }

    #[test]
    fn test_release_claim_restores_queued() {
        let mut job = queued_job();
        let now = Utc::now();
        let claim = job.claim_next("worker-1", now, 30).unwrap();
        job.release_claim(&claim, now);

        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.current_stage, None);
        assert!(job.lease.is_none());
        assert_eq!(
            job.stage_state(StageId::Ingest).unwrap().phase,
            StagePhase::Ready
        );
    }

    #[test]
    fn test_terminal_states_absorb() {
        let mut job = queued_job();
        let now = Utc::now();
        job.claim_next("worker-1", now, 30).unwrap();
        job.cancel(now).unwrap();

        assert!(job.cancel(now).is_err());
        assert!(job.pause(now).is_err());
        assert!(job.complete(now).is_err());
        assert!(job
            .fail(StageId::Ingest, StageError::transient("x"), now)
            .is_err());
    }

    #[test]
    fn test_pause_resume_roundtrip() {
        let mut job = queued_job();
        let now = Utc::now();
        job.pause(now).unwrap();
        assert_eq!(job.state, JobState::Paused);
        assert!(!job.is_claimable(now));
        job.resume(now).unwrap();
        assert_eq!(job.state, JobState::Queued);
    }

    #[test]
    fn test_touch_is_strictly_monotone() {
        let mut job = queued_job();
        let stamp = job.updated_at;
        job.touch(stamp);
        assert!(job.updated_at > stamp);
    }

    #[test]
    fn test_arxiv_input_validation() {
        assert!(PaperInput::arxiv("1706.03762").validate().is_ok());
        assert!(PaperInput::arxiv("2301.00001v2").validate().is_ok());
        assert!(PaperInput::arxiv("cs/0112017").validate().is_ok());
        assert!(PaperInput::arxiv("not-an-id").validate().is_err());
        assert!(PaperInput::title("  ").validate().is_err());
        assert!(PaperInput::title("ok").validate().is_ok());
    }
}
