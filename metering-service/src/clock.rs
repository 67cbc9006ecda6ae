use std::sync::Mutex;

use time::{Duration, OffsetDateTime, PrimitiveDateTime};

/// Source of local wall-clock time.
///
/// Boundaries (23:59 resets, HT/NT windows, anniversaries) are defined in
/// local time, so the engine works on `PrimitiveDateTime` throughout.
pub trait Clock: Send + Sync {
    fn now(&self) -> PrimitiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> PrimitiveDateTime {
        // The local offset cannot be determined in every environment
        // (multi-threaded processes on some platforms); UTC is the fallback.
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        PrimitiveDateTime::new(now.date(), now.time())
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<PrimitiveDateTime>,
}

impl ManualClock {
    pub fn new(start: PrimitiveDateTime) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, to: PrimitiveDateTime) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> PrimitiveDateTime {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}
