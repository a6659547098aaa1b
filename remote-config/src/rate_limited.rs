// Rate limited warnings. The first occurrence of a message class within the interval is
// logged at warn level, repeats are demoted to debug.
use moka::sync::Cache;
use std::fmt::Display;
use std::time::Duration;

const SIZE: u64 = 1000;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct RateLimitedLog {
    seen: Cache<String, ()>,
}

impl RateLimitedLog {
    pub fn new(interval: Duration) -> Self {
        let seen = Cache::builder()
            .max_capacity(SIZE)
            .time_to_live(interval)
            .build();

        RateLimitedLog { seen }
    }

    /// True the first time `class` is seen within the interval.
    pub fn should_warn(&self, class: &str) -> bool {
        self.seen.entry(class.to_string()).or_insert(()).is_fresh()
    }

    pub fn warn(&self, class: &str, message: impl Display) {
        if self.should_warn(class) {
            tracing::warn!(class, "{message}");
        } else {
            tracing::debug!(class, "{message}");
        }
    }
}

impl Default for RateLimitedLog {
    fn default() -> Self {
        RateLimitedLog::new(DEFAULT_INTERVAL)
    }
}
