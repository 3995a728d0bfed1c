//! Connection and latency metrics.
//!
//! The connection loop only talks to the [`Metrics`] trait, so deployments can
//! forward to whatever metrics system they run. [`ServerMetrics`] is the
//! built-in implementation: a live-connection gauge plus read and write
//! latency histograms, all lock-free.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Sink for per-connection metrics.
pub trait Metrics: Send + Sync {
    /// A connection was accepted.
    fn connection_opened(&self);
    /// A connection was closed.
    fn connection_closed(&self);
    /// Time spent reading one request frame.
    fn record_read(&self, elapsed: Duration);
    /// Time spent writing one response frame.
    fn record_write(&self, elapsed: Duration);
}

/// Number of histogram buckets. Bucket `i` counts samples below `2^i` ms,
/// the last bucket catches everything slower.
pub const HISTOGRAM_BUCKETS: usize = 16;

/// Latency histogram with power-of-two millisecond buckets.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; HISTOGRAM_BUCKETS],
    count: AtomicU64,
    total_micros: AtomicU64,
}

impl LatencyHistogram {
    /// Create an empty histogram.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample.
    pub fn record(&self, elapsed: Duration) {
        let millis = elapsed.as_millis() as u64;
        let bucket = if millis == 0 {
            0
        } else {
            ((u64::BITS - millis.leading_zeros()) as usize).min(HISTOGRAM_BUCKETS - 1)
        };
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Number of samples recorded.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean of all samples, or zero when empty.
    pub fn mean(&self) -> Duration {
        let count = self.count();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_micros.load(Ordering::Relaxed) / count)
    }

    /// Copy of the bucket counters.
    pub fn snapshot(&self) -> [u64; HISTOGRAM_BUCKETS] {
        std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed))
    }
}

/// Default metrics: atomic gauge and counters.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    live_connections: AtomicI64,
    total_connections: AtomicU64,
    read_latency: LatencyHistogram,
    write_latency: LatencyHistogram,
}

impl ServerMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections currently open.
    pub fn live_connections(&self) -> i64 {
        self.live_connections.load(Ordering::Relaxed)
    }

    /// Connections accepted since start.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Read latency histogram.
    pub fn read_latency(&self) -> &LatencyHistogram {
        &self.read_latency
    }

    /// Write latency histogram.
    pub fn write_latency(&self) -> &LatencyHistogram {
        &self.write_latency
    }
}

impl Metrics for ServerMetrics {
    fn connection_opened(&self) {
        self.live_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.live_connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn record_read(&self, elapsed: Duration) {
        self.read_latency.record(elapsed);
    }

    fn record_write(&self, elapsed: Duration) {
        self.write_latency.record(elapsed);
    }
}
