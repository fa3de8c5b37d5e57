//! Engine settings for the two scheduling disciplines.
//!
//! Per-request knobs (buffer size, read backoff, write attempts) live on the
//! [`Director`](crate::director::Director); these structs hold what is fixed
//! when an engine starts.

use std::time::Duration;

/// Settings for [`BlockingEngine`](crate::blocking::BlockingEngine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingConfig {
    idle_timeout: Duration,
    reap_interval: Duration,
    connect_timeout: Duration,
    upstream_read_timeout: Duration,
}

impl BlockingConfig {
    pub fn new() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            upstream_read_timeout: Duration::from_millis(50),
        }
    }

    /// An exchange with no reads for this long is closed by the reaper.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// How often the reaper scans live exchanges.
    #[must_use]
    pub fn with_reap_interval(mut self, reap_interval: Duration) -> Self {
        self.reap_interval = reap_interval;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Socket read timeout on TLS upstreams, bounding how long a reader
    /// holds the session lock.
    #[must_use]
    pub fn with_upstream_read_timeout(mut self, upstream_read_timeout: Duration) -> Self {
        self.upstream_read_timeout = upstream_read_timeout;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn reap_interval(&self) -> Duration {
        self.reap_interval
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn upstream_read_timeout(&self) -> Duration {
        self.upstream_read_timeout
    }
}

impl Default for BlockingConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings for [`EventLoopPool`](crate::selector::EventLoopPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorConfig {
    workers: usize,
    events_capacity: usize,
}

impl SelectorConfig {
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism().map_or(1, std::num::NonZero::get);
        Self { workers, events_capacity: 1024 }
    }

    /// Number of event-loop threads; at least one is always started.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Readiness events collected per poll.
    #[must_use]
    pub fn with_events_capacity(mut self, events_capacity: usize) -> Self {
        self.events_capacity = events_capacity.max(1);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn events_capacity(&self) -> usize {
        self.events_capacity
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self::new()
    }
}
