/**
 * Tunables for resync streams
 */
use std::time::Duration;

/// Base watch timeout in milliseconds; each watch asks for between one and two times this
pub const DEFAULT_WATCH_TIMEOUT_MS: u64 = 5000;

/// Largest watch timeout the client library accepts (kube rejects 295s and above)
pub const MAX_WATCH_TIMEOUT_SECONDS: u32 = 294;

/// Number of undelivered items after which the active watch is closed
pub const DEFAULT_HIGH_WATER_MARK: usize = 16;

/// Notices retained for a lagging subscriber before the oldest are dropped
pub const NOTICE_CAPACITY: usize = 16;

/// Initial delay before retrying after an error
pub const INITIAL_BACKOFF_SECONDS: u64 = 1;

/// Maximum delay between retries
pub const MAX_BACKOFF_SECONDS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncConfig {
    /// Base for the jittered server side watch timeout
    pub timeout: Duration,
    /// Consumer buffer size that triggers backpressure
    pub high_water_mark: usize,
    /// Delay before the first retry after an error; `None` retries on the next pull
    pub initial_backoff: Option<Duration>,
    pub max_backoff: Duration,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_WATCH_TIMEOUT_MS),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            initial_backoff: Some(Duration::from_secs(INITIAL_BACKOFF_SECONDS)),
            max_backoff: Duration::from_secs(MAX_BACKOFF_SECONDS),
        }
    }
}

impl ResyncConfig {
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// A mark of zero is treated as one
    #[must_use]
    pub fn high_water_mark(mut self, items: usize) -> Self {
        self.high_water_mark = items.max(1);
        self
    }

    #[must_use]
    pub const fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = Some(initial);
        self.max_backoff = max;
        self
    }

    #[must_use]
    pub const fn without_backoff(mut self) -> Self {
        self.initial_backoff = None;
        self
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(DEFAULT_WATCH_TIMEOUT_MS > 0, "DEFAULT_WATCH_TIMEOUT_MS must be greater than 0");
    assert!(MAX_WATCH_TIMEOUT_SECONDS > 0 && MAX_WATCH_TIMEOUT_SECONDS < 295, "MAX_WATCH_TIMEOUT_SECONDS must be in 1..295");
    assert!(DEFAULT_HIGH_WATER_MARK > 0, "DEFAULT_HIGH_WATER_MARK must be greater than 0");
    assert!(NOTICE_CAPACITY > 0, "NOTICE_CAPACITY must be greater than 0");
    assert!(INITIAL_BACKOFF_SECONDS > 0, "INITIAL_BACKOFF_SECONDS must be greater than 0");
    assert!(MAX_BACKOFF_SECONDS >= INITIAL_BACKOFF_SECONDS, "MAX_BACKOFF_SECONDS must not be below INITIAL_BACKOFF_SECONDS");
};
