use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Time source injected into every component that stamps or compares
/// timestamps. Production wiring uses [`SystemClock`]; tests use the manual
/// clock from the `testing` module.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
