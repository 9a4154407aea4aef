//! The clock capability: a source of monotonically non-decreasing wall time.
//!
//! The coordination core never calls `Utc::now()` directly outside of this
//! module so that lease expiry and backoff timing can be driven
//! deterministically in tests.

use chrono::{DateTime, Utc};

/// A source of wall-clock instants. Implementations must never return a time
/// earlier than a previously returned time.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// A [`Clock`] backed by the system wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use test_support::ManualClock;

#[cfg(test)]
mod test_support {
    use super::Clock;
    use chrono::{DateTime, Utc};
    use parking_lot::RwLock;

    /// A [`Clock`] whose value is advanced explicitly by tests.
    #[derive(Debug)]
    pub struct ManualClock {
        now: RwLock<DateTime<Utc>>,
    }

    impl ManualClock {
        #[must_use]
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                now: RwLock::new(start),
            }
        }

        pub fn advance(&self, delta: chrono::Duration) {
            let mut guard = self.now.write();
            *guard += delta;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.read()
        }
    }
}
