use crate::error::{ErrorKind, StageError};
use crate::job::StageState;
use crate::registry::{StageRegistry, StageSpec};
use chrono::Duration;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Outcome of consulting the policy after a stage failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Fallback { next_index: u32 },
    Fail { reason: String },
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub ceiling_ms: u64,
    /// Ceiling applied to `ResourceExhausted`, which warrants waiting out
    /// quota and memory pressure rather than hammering the worker.
    pub resource_exhausted_ceiling_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            ceiling_ms: 30_000,
            resource_exhausted_ceiling_ms: 120_000,
        }
    }
}

/// Pure decision engine: a function of the stage declaration, the stage
/// state, the error, and the job's remaining budget. The only impurity is
/// the jitter source, which tests pin with a fixed seed.
pub struct RetryPolicy {
    config: RetryConfig,
    rng: Mutex<StdRng>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(config: RetryConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Decision rules, in order:
    ///
    /// 1. kind undeclared for the stage and no fallback suggested -> `Fail`.
    /// 2. fallback suggested and another worker exists -> `Fallback`.
    /// 3. per-stage attempts and the job budget both allow -> `Retry` with
    ///    exponential backoff.
    /// 4. otherwise -> `GiveUp`.
    pub fn decide(
        &self,
        registry: &StageRegistry,
        spec: &StageSpec,
        stage: &StageState,
        error: &StageError,
        attempt_budget: u32,
    ) -> RetryDecision {
        let declared = registry.declared_retryable(spec.id, error.kind);
        if !declared && !error.suggested_fallback {
            return RetryDecision::Fail {
                reason: format!("{} is not retryable for stage {}", error.kind, spec.id),
            };
        }

        if error.suggested_fallback {
            let next_index = stage.fallback_index + 1;
            if (next_index as usize) < spec.workers.len() {
                return RetryDecision::Fallback { next_index };
            }
        }

        if stage.attempts + 1 < spec.max_attempts && attempt_budget > 0 {
            return RetryDecision::Retry {
                delay: self.backoff(stage.attempts, error.kind),
            };
        }

        RetryDecision::GiveUp
    }

    /// `min(base * 2^n + jitter, ceiling)`, jitter uniform over
    /// `[0, base * 2^n / 2]`.
    pub fn backoff(&self, attempts: u32, kind: ErrorKind) -> Duration {
        let exp = attempts.min(20);
        let scaled = self.config.base_ms.saturating_mul(1u64 << exp);
        let half = scaled / 2;
        let jitter = if half == 0 {
            0
        } else {
            self.rng.lock().gen_range(0..=half)
        };
        let ceiling = if kind == ErrorKind::ResourceExhausted {
            self.config.resource_exhausted_ceiling_ms
        } else {
            self.config.ceiling_ms
        };
        Duration::milliseconds(scaled.saturating_add(jitter).min(ceiling) as i64)
    }
}
