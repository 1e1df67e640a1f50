//! Connection options.
//!
//! Defaults follow the broker client library's own defaults where it has
//! them (reconnect attempts, pending limits, flush and drain timeouts).

use std::time::Duration;

/// Default client name announced to the broker.
pub const DEFAULT_CONNECTION_NAME: &str = "broker-client";
/// Default timeout for each connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Base delay for reconnect backoff.
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Upper bound for reconnect backoff.
pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
/// Random jitter added to every reconnect delay.
pub const DEFAULT_RECONNECT_JITTER: Duration = Duration::from_millis(100);
/// Reconnect attempts before the connection is closed.
pub const DEFAULT_MAX_RECONNECTS: u32 = 60;
/// Messages buffered locally before publish applies backpressure.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 65_536;
/// Deliveries queued per subscription before it is a slow consumer.
pub const DEFAULT_MAX_PENDING_PER_SUBSCRIPTION: usize = 512 * 1024;
/// Default timeout for [`crate::Connection::flush_default`].
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period for [`crate::Connection::drain`].
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
/// How often the NATS transport polls its connection state.
pub const DEFAULT_STATE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Options applied when establishing and running a [`crate::Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Client name announced to the broker.
    pub name: String,
    /// Timeout for a single connect attempt.
    pub connect_timeout: Duration,
    /// Extra attempts for the initial connect before giving up.
    pub connect_retries: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_jitter: Duration,
    /// Reconnect attempts after a transport loss; `None` retries forever.
    pub max_reconnects: Option<u32>,
    /// Outbound buffer size in messages.
    pub outbound_capacity: usize,
    /// Whether `publish` waits for buffer space while connected. When false
    /// a full buffer fails fast with backpressure.
    pub block_on_full: bool,
    pub max_pending_per_subscription: usize,
    pub flush_timeout: Duration,
    pub drain_timeout: Duration,
    /// Poll interval for transports that detect loss by polling.
    pub state_poll_interval: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            name: DEFAULT_CONNECTION_NAME.to_owned(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connect_retries: 0,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            reconnect_max_delay: DEFAULT_RECONNECT_MAX_DELAY,
            reconnect_jitter: DEFAULT_RECONNECT_JITTER,
            max_reconnects: Some(DEFAULT_MAX_RECONNECTS),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            block_on_full: true,
            max_pending_per_subscription: DEFAULT_MAX_PENDING_PER_SUBSCRIPTION,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            state_poll_interval: DEFAULT_STATE_POLL_INTERVAL,
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    /// Set base and max reconnect delay together.
    pub fn with_reconnect_delay(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base_delay = base;
        self.reconnect_max_delay = max.max(base);
        self
    }

    pub fn with_reconnect_jitter(mut self, jitter: Duration) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    pub fn with_max_reconnects(mut self, max: Option<u32>) -> Self {
        self.max_reconnects = max;
        self
    }

    /// Outbound capacity is clamped to at least one message.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    pub fn with_block_on_full(mut self, block: bool) -> Self {
        self.block_on_full = block;
        self
    }

    pub fn with_max_pending_per_subscription(mut self, max: usize) -> Self {
        self.max_pending_per_subscription = max.max(1);
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_state_poll_interval(mut self, interval: Duration) -> Self {
        self.state_poll_interval = interval;
        self
    }

    /// Delay before reconnect attempt `attempt` (zero based), without jitter.
    ///
    /// Doubles from `reconnect_base_delay` and saturates at
    /// `reconnect_max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.reconnect_base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.reconnect_max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = ConnectionOptions::default();
        assert_eq!(opts.max_reconnects, Some(60));
        assert_eq!(opts.outbound_capacity, DEFAULT_OUTBOUND_CAPACITY);
        assert_eq!(opts.max_pending_per_subscription, 524_288);
        assert!(opts.block_on_full);
        assert_eq!(opts.flush_timeout, Duration::from_secs(10));
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let opts = ConnectionOptions::default()
            .with_reconnect_delay(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(opts.backoff(0), Duration::from_millis(100));
        assert_eq!(opts.backoff(1), Duration::from_millis(200));
        assert_eq!(opts.backoff(3), Duration::from_millis(800));
        assert_eq!(opts.backoff(4), Duration::from_millis(1000));
        assert_eq!(opts.backoff(40), Duration::from_millis(1000));
    }

    #[test]
    fn builder_clamps_capacities() {
        let opts = ConnectionOptions::new()
            .with_outbound_capacity(0)
            .with_max_pending_per_subscription(0)
            .with_reconnect_delay(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(opts.outbound_capacity, 1);
        assert_eq!(opts.max_pending_per_subscription, 1);
        assert_eq!(opts.reconnect_max_delay, Duration::from_secs(2));
    }
}
