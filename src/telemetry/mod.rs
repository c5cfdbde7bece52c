//! Dispatch metrics.
//!
//! Counts launches, transfers, grid fallbacks and event traffic per device, with
//! a histogram of measured kernel times.

#[cfg(feature = "telemetry")]
pub mod metrics;

#[cfg(feature = "telemetry")]
pub mod export;

#[cfg(feature = "telemetry")]
pub use metrics::{Metrics, MetricsSnapshot};

#[cfg(feature = "telemetry")]
pub use export::{ConsoleExporter, JsonExporter, MetricsExporter};

// Stub implementations when telemetry is disabled
#[cfg(not(feature = "telemetry"))]
pub mod metrics {
    #[derive(Debug, Clone, Default)]
    pub struct Metrics;

    impl Metrics {
        pub fn new() -> Self { Self }
        pub fn record_kernel_launch(&self) {}
        pub fn record_kernel_time(&self, _: u64) {}
        pub fn record_transfer_to_device(&self, _: usize) {}
        pub fn record_transfer_to_host(&self, _: usize) {}
        pub fn record_grid_fallback(&self) {}
        pub fn record_execution(&self) {}
        pub fn record_event_allocated(&self) {}
        pub fn record_event_released(&self) {}
        pub fn snapshot(&self) -> MetricsSnapshot { MetricsSnapshot::default() }
    }

    #[derive(Debug, Clone, Default)]
    pub struct MetricsSnapshot {
        pub kernels_launched: u64,
        pub transfers_to_device: u64,
        pub bytes_to_device: u64,
        pub transfers_to_host: u64,
        pub bytes_to_host: u64,
        pub grid_fallbacks: u64,
        pub executions: u64,
        pub events_allocated: u64,
        pub events_released: u64,
    }
}

#[cfg(not(feature = "telemetry"))]
pub use metrics::{Metrics, MetricsSnapshot};
