//! Injectable time source.
//!
//! Every component that makes a time-based decision (scheduler, budget,
//! cache freshness, queue stamps) reads the clock through this trait so
//! tests can drive time by hand instead of sleeping.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Whole seconds since the Unix epoch.
    fn epoch(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use manual::ManualClock;

#[cfg(test)]
mod manual {
    use super::Clock;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::{Arc, Mutex};

    /// Hand-driven clock shared between a test and the component under test.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        pub fn at(rfc3339: &str) -> Self {
            let now = DateTime::parse_from_rfc3339(rfc3339)
                .expect("valid rfc3339 timestamp")
                .with_timezone(&Utc);
            Self { now: Arc::new(Mutex::new(now)) }
        }

        pub fn advance_secs(&self, secs: i64) {
            let mut now = self.now.lock().unwrap();
            *now = *now + Duration::seconds(secs);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }
}
