//! Socket and dispatcher options.

use std::time::Duration;

/// Default send timeout.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(1500);

/// Default receive timeout.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Default capacity of the outbound packet queue and the event channel.
pub const DEFAULT_BUFFER_SIZE: usize = 5;

/// Default bounded wait of one dispatcher iteration.
pub const DEFAULT_POLL_WAIT: Duration = Duration::from_millis(10);

/// Wait used while some socket is throttled on a full event channel.
pub const THROTTLE_POLL_WAIT: Duration = Duration::from_millis(1);

/// Default time a listener without free client slots is left unpolled.
pub const DEFAULT_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Per-socket options.
///
/// A zero timeout disables the corresponding check.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Maximum time a started send (or connect) may stay blocked.
    pub send_timeout: Duration,
    /// Maximum time without any traffic on a connected socket.
    pub receive_timeout: Duration,
    /// Capacity of the outbound packet queue.
    pub tx_queue_size: usize,
    /// Capacity of the channel carrying [`crate::SocketEvent`]s.
    pub event_queue_size: usize,
    /// Set TCP_NODELAY on connected streams.
    pub no_delay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            send_timeout: DEFAULT_SEND_TIMEOUT,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            tx_queue_size: DEFAULT_BUFFER_SIZE,
            event_queue_size: DEFAULT_BUFFER_SIZE,
            no_delay: true,
        }
    }
}

impl SocketOptions {
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn tx_queue_size(mut self, size: usize) -> Self {
        self.tx_queue_size = size.max(1);
        self
    }

    pub fn event_queue_size(mut self, size: usize) -> Self {
        self.event_queue_size = size.max(1);
        self
    }

    pub fn no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }
}

/// Dispatcher options.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Bounded wait of one iteration.
    pub poll_wait: Duration,
    /// Capacity of the mio event buffer.
    pub events_capacity: usize,
    /// Back-off applied to listeners that cannot accept.
    pub accept_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_wait: DEFAULT_POLL_WAIT,
            events_capacity: 256,
            accept_backoff: DEFAULT_ACCEPT_BACKOFF,
        }
    }
}

impl DispatcherConfig {
    pub fn poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait = wait;
        self
    }

    pub fn accept_backoff(mut self, backoff: Duration) -> Self {
        self.accept_backoff = backoff;
        self
    }
}
