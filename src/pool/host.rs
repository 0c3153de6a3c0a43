use std::{collections::VecDeque, time::Duration};

use crate::conn::Connection;

/// Per-host bookkeeping, owned by the pool's state mutex.
#[derive(Debug, Default)]
pub(crate) struct HostState {
    /// Connections ready for checkout, oldest first.
    pub(crate) idle: VecDeque<Connection>,

    /// Connections currently borrowed or being dialed for a borrower; counted against the
    /// per-host maximum.
    pub(crate) checked_out: u32,

    /// Failed health checks since the last success; hosts past the configured threshold are
    /// pruned.
    pub(crate) consecutive_failures: u32,

    /// The most recently measured handshake round trip.
    pub(crate) round_trip_time: Option<Duration>,
}

impl HostState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Idle plus borrowed connections; the number the per-host cap applies to.
    pub(crate) fn total_connections(&self) -> u32 {
        self.checked_out + self.idle.len() as u32
    }

    /// Removes and returns the next usable idle connection, dropping any closed or stale ones
    /// encountered on the way.
    pub(crate) fn pop_idle(&mut self, current_generation: u32) -> Option<Connection> {
        while let Some(conn) = self.idle.pop_front() {
            if conn.is_closed() || conn.is_stale(current_generation) {
                continue;
            }
            return Some(conn);
        }
        None
    }
}
