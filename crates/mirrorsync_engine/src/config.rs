//! Configuration for the sync engine.

use mirrorsync_protocol::LocalTimestamp;
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long a write performed by the engine suppresses its own echo.
    pub echo_window: Duration,
    /// Local timestamp compared against the remote `updated_at`.
    pub local_timestamp: LocalTimestamp,
    /// Retry configuration for drain passes.
    pub retry: RetryConfig,
    /// Capacity of the notice channel.
    pub notice_capacity: usize,
    /// Whether to reconcile changes missed while stopped when starting.
    pub catch_up_on_start: bool,
    /// Page size for listing remote assets during catch-up.
    pub catch_up_page_size: u32,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            echo_window: Duration::from_secs(2),
            local_timestamp: LocalTimestamp::Modified,
            retry: RetryConfig::default(),
            notice_capacity: 64,
            catch_up_on_start: true,
            catch_up_page_size: 100,
        }
    }

    /// Sets the echo suppression window.
    pub fn with_echo_window(mut self, window: Duration) -> Self {
        self.echo_window = window;
        self
    }

    /// Sets which local timestamp conflicts are decided on.
    pub fn with_local_timestamp(mut self, timestamp: LocalTimestamp) -> Self {
        self.local_timestamp = timestamp;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the notice channel capacity.
    pub fn with_notice_capacity(mut self, capacity: usize) -> Self {
        self.notice_capacity = capacity.max(1);
        self
    }

    /// Enables or disables catch-up when the engine starts.
    pub fn with_catch_up_on_start(mut self, enabled: bool) -> Self {
        self.catch_up_on_start = enabled;
        self
    }

    /// Sets the catch-up page size.
    pub fn with_catch_up_page_size(mut self, size: u32) -> Self {
        self.catch_up_page_size = size.max(1);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
///
/// `max_attempts` bounds both the number of back-to-back drain passes after
/// a reconnect and the number of failed attempts after which an action is
/// reported as persistently failing.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Initial delay between attempts.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with `max_attempts` attempts.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% on top.
            Duration::from_secs_f64(capped + capped * 0.25 * jitter_fraction())
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// A fraction in `[0, 1)` derived from the clock's sub-second nanos.
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}
