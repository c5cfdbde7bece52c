//! Per-device dispatch counters.

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Metrics {
    kernels_launched: AtomicU64,
    transfers_to_device: AtomicU64,
    bytes_to_device: AtomicU64,
    transfers_to_host: AtomicU64,
    bytes_to_host: AtomicU64,
    grid_fallbacks: AtomicU64,
    executions: AtomicU64,
    events_allocated: AtomicU64,
    events_released: AtomicU64,

    // device kernel time, ns; only fed when profiling is on
    kernel_time_histogram: RwLock<Histogram<u64>>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        // 3 significant figures, max one hour in nanoseconds
        let histogram = Histogram::new_with_max(3_600_000_000_000, 3)
            .expect("Failed to create histogram");

        Self {
            kernels_launched: AtomicU64::new(0),
            transfers_to_device: AtomicU64::new(0),
            bytes_to_device: AtomicU64::new(0),
            transfers_to_host: AtomicU64::new(0),
            bytes_to_host: AtomicU64::new(0),
            grid_fallbacks: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            events_allocated: AtomicU64::new(0),
            events_released: AtomicU64::new(0),
            kernel_time_histogram: RwLock::new(histogram),
            start_time: Instant::now(),
        }
    }

    pub fn record_kernel_launch(&self) {
        self.kernels_launched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_kernel_time(&self, duration_ns: u64) {
        if let Some(mut hist) = self.kernel_time_histogram.try_write() {
            let _ = hist.record(duration_ns);
        }
    }

    pub fn record_transfer_to_device(&self, bytes: usize) {
        self.transfers_to_device.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_device.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_transfer_to_host(&self, bytes: usize) {
        self.transfers_to_host.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_host.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_grid_fallback(&self) {
        self.grid_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_allocated(&self) {
        self.events_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_released(&self) {
        self.events_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let histogram = self.kernel_time_histogram.read();

        MetricsSnapshot {
            timestamp: Instant::now(),
            uptime: self.start_time.elapsed(),
            kernels_launched: self.kernels_launched.load(Ordering::Relaxed),
            transfers_to_device: self.transfers_to_device.load(Ordering::Relaxed),
            bytes_to_device: self.bytes_to_device.load(Ordering::Relaxed),
            transfers_to_host: self.transfers_to_host.load(Ordering::Relaxed),
            bytes_to_host: self.bytes_to_host.load(Ordering::Relaxed),
            grid_fallbacks: self.grid_fallbacks.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            events_allocated: self.events_allocated.load(Ordering::Relaxed),
            events_released: self.events_released.load(Ordering::Relaxed),
            kernel_samples: histogram.len(),
            avg_kernel_ns: if histogram.len() > 0 {
                histogram.mean() as u64
            } else {
                0
            },
            p50_kernel_ns: histogram.value_at_quantile(0.50),
            p99_kernel_ns: histogram.value_at_quantile(0.99),
            max_kernel_ns: histogram.max(),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.kernels_launched,
            &self.transfers_to_device,
            &self.bytes_to_device,
            &self.transfers_to_host,
            &self.bytes_to_host,
            &self.grid_fallbacks,
            &self.executions,
            &self.events_allocated,
            &self.events_released,
        ] {
            counter.store(0, Ordering::Relaxed);
        }

        if let Some(mut hist) = self.kernel_time_histogram.try_write() {
            hist.reset();
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub timestamp: Instant,
    pub uptime: Duration,
    pub kernels_launched: u64,
    pub transfers_to_device: u64,
    pub bytes_to_device: u64,
    pub transfers_to_host: u64,
    pub bytes_to_host: u64,
    pub grid_fallbacks: u64,
    pub executions: u64,
    pub events_allocated: u64,
    pub events_released: u64,
    pub kernel_samples: u64,
    pub avg_kernel_ns: u64,
    pub p50_kernel_ns: u64,
    pub p99_kernel_ns: u64,
    pub max_kernel_ns: u64,
}

impl MetricsSnapshot {
    /// Events handed out by the pool and not yet returned.
    pub fn events_outstanding(&self) -> u64 {
        self.events_allocated.saturating_sub(self.events_released)
    }

    pub fn kernels_per_second(&self) -> f64 {
        let seconds = self.uptime.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        self.kernels_launched as f64 / seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_basic() {
        let metrics = Metrics::new();

        metrics.record_kernel_launch();
        metrics.record_kernel_launch();
        metrics.record_kernel_time(1_000);
        metrics.record_kernel_time(3_000);
        metrics.record_transfer_to_device(256);
        metrics.record_transfer_to_host(64);
        metrics.record_event_allocated();
        metrics.record_event_allocated();
        metrics.record_event_released();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.kernels_launched, 2);
        assert_eq!(snapshot.kernel_samples, 2);
        assert!(snapshot.avg_kernel_ns > 0);
        assert_eq!(snapshot.bytes_to_device, 256);
        assert_eq!(snapshot.transfers_to_host, 1);
        assert_eq!(snapshot.events_outstanding(), 1);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = Metrics::new();

        metrics.record_grid_fallback();
        metrics.record_execution();
        assert_eq!(metrics.snapshot().grid_fallbacks, 1);

        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.grid_fallbacks, 0);
        assert_eq!(snapshot.executions, 0);
    }
}
