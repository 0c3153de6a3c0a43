use std::sync::atomic::{AtomicU64, Ordering};

/// A thread-safe numerator/denominator counter for derived averages (e.g. mean round-trip time).
///
/// Both halves advance independently under relaxed ordering; readers get a value that is exact
/// whenever the counter is quiescent and approximate while updates race, which is all the
/// statistics consumers need.
#[derive(Debug, Default)]
pub struct RatioCounter {
    numerator: AtomicU64,
    denominator: AtomicU64,
}

impl RatioCounter {
    /// A counter starting at 0/0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `value` to the numerator and 1 to the denominator.
    pub fn observe(&self, value: u64) {
        self.numerator.fetch_add(value, Ordering::Relaxed);
        self.denominator.fetch_add(1, Ordering::Relaxed);
    }

    /// The number of observations so far.
    pub fn count(&self) -> u64 {
        self.denominator.load(Ordering::Relaxed)
    }

    /// The current ratio, or `None` before the first observation.
    pub fn average(&self) -> Option<f64> {
        let denominator = self.denominator.load(Ordering::Relaxed);
        if denominator == 0 {
            return None;
        }
        Some(self.numerator.load(Ordering::Relaxed) as f64 / denominator as f64)
    }
}

/// Counters tracked per connection.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Commands written to the socket.
    pub commands_sent: AtomicU64,

    /// Correlated replies delivered to a waiter.
    pub replies_received: AtomicU64,

    /// Frames dropped because nothing was waiting on their correlation id.
    pub replies_discarded: AtomicU64,

    /// Mean request/reply round trip in microseconds.
    pub round_trip_micros: RatioCounter,
}

impl ConnectionStats {
    pub(crate) fn record_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.replies_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self) {
        self.replies_discarded.fetch_add(1, Ordering::Relaxed);
    }
}
