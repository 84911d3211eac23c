use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonic dispatcher counters.
///
/// Timestamps are unix nanoseconds; byte and packet counters only ever
/// grow. The host reads these through
/// [`Dispatcher::stats`](crate::Dispatcher::stats) without copying.
#[derive(Debug, Default, Copy, Clone)]
#[non_exhaustive]
pub struct DispatchStats {
    /// When the dispatcher was constructed
    pub created_at: u64,
    /// When an endpoint was last bound
    pub bound_at: u64,
    /// When `listen` was called
    pub listen_at: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub packets_ignored: u64,
    pub server_sessions: u64,
    pub client_sessions: u64,
    pub stateless_reset_count: u64,
}

pub(crate) fn unix_nanos(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}
