use std::{net::SocketAddr, time::Duration};

use crate::codec::DEFAULT_MAX_FRAME_LEN;

/// Tunables for one relay instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// Pending-connection queue length handed to `listen(2)`.
    pub backlog: u32,
    /// How long the first accept may sit idle before the relay checks whether
    /// anyone is still online.
    pub initial_idle_timeout: Duration,
    /// Idle timeout used once the relay has survived its first idle check.
    pub idle_timeout: Duration,
    pub max_frame_len: usize,
    /// Frames queued per connection before deliveries to it are dropped.
    pub outbound_queue: usize,
    /// Grace period for sessions to wind down after the listener closes.
    pub drain_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 50_000)),
            backlog: 5,
            initial_idle_timeout: Duration::from_secs(180),
            idle_timeout: Duration::from_secs(120),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            outbound_queue: 128,
            drain_timeout: Duration::from_secs(5),
        }
    }
}
