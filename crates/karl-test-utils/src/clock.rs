//! Hand-advanced clock for deterministic tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use karl_core::{Clock, MicroDuration, MicroTimestamp};

/// A [`Clock`] whose time only moves when a test advances it.
///
/// Cloning shares the underlying time, so the clock handed to Karl and the one
/// held by the test tick together.
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    now_us: Arc<AtomicI64>,
}

impl MockClock {
    /// Creates a clock starting at the given epoch-microsecond value.
    pub fn starting_at(us: i64) -> Self {
        Self {
            now_us: Arc::new(AtomicI64::new(us)),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: MicroDuration) {
        self.now_us.fetch_add(by.as_micros(), Ordering::SeqCst);
    }

    /// Moves the clock forward by whole seconds.
    pub fn advance_seconds(&self, seconds: i64) {
        self.advance(MicroDuration::from_seconds(seconds));
    }

    /// Pins the clock to an absolute time.
    pub fn set(&self, to: MicroTimestamp) {
        self.now_us.store(to.as_micros(), Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now(&self) -> MicroTimestamp {
        MicroTimestamp::from_micros(self.now_us.load(Ordering::SeqCst))
    }
}
