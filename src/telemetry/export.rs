//! Metrics export.

use super::metrics::MetricsSnapshot;
use crate::error::{Error, Result};
use serde::Serialize;
use std::path::PathBuf;

pub trait MetricsExporter: Send + Sync {
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()>;
}

/// Writes a pretty-printed JSON document to a file.
#[derive(Debug)]
pub struct JsonExporter {
    output_path: PathBuf,
}

impl JsonExporter {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }
}

impl MetricsExporter for JsonExporter {
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let serializable = SerializableSnapshot::from(snapshot);
        let json = serde_json::to_string_pretty(&serializable)
            .map_err(|e| Error::telemetry(format!("JSON serialization failed: {}", e)))?;

        std::fs::write(&self.output_path, json)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
struct SerializableSnapshot {
    uptime_secs: f64,
    kernels_launched: u64,
    kernels_per_second: f64,
    transfers_to_device: u64,
    bytes_to_device: u64,
    transfers_to_host: u64,
    bytes_to_host: u64,
    grid_fallbacks: u64,
    executions: u64,
    events_allocated: u64,
    events_released: u64,
    kernel_samples: u64,
    avg_kernel_us: f64,
    p50_kernel_us: f64,
    p99_kernel_us: f64,
    max_kernel_us: f64,
}

impl From<&MetricsSnapshot> for SerializableSnapshot {
    fn from(snapshot: &MetricsSnapshot) -> Self {
        Self {
            uptime_secs: snapshot.uptime.as_secs_f64(),
            kernels_launched: snapshot.kernels_launched,
            kernels_per_second: snapshot.kernels_per_second(),
            transfers_to_device: snapshot.transfers_to_device,
            bytes_to_device: snapshot.bytes_to_device,
            transfers_to_host: snapshot.transfers_to_host,
            bytes_to_host: snapshot.bytes_to_host,
            grid_fallbacks: snapshot.grid_fallbacks,
            executions: snapshot.executions,
            events_allocated: snapshot.events_allocated,
            events_released: snapshot.events_released,
            kernel_samples: snapshot.kernel_samples,
            avg_kernel_us: snapshot.avg_kernel_ns as f64 / 1_000.0,
            p50_kernel_us: snapshot.p50_kernel_ns as f64 / 1_000.0,
            p99_kernel_us: snapshot.p99_kernel_ns as f64 / 1_000.0,
            max_kernel_us: snapshot.max_kernel_ns as f64 / 1_000.0,
        }
    }
}

/// Prints a summary to stdout.
#[derive(Debug)]
pub struct ConsoleExporter {
    verbose: bool,
}

impl ConsoleExporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl MetricsExporter for ConsoleExporter {
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        println!("=== Tessera Dispatch Metrics ===");
        println!("Uptime: {:.2}s", snapshot.uptime.as_secs_f64());
        println!("Executions: {}", snapshot.executions);
        println!("Kernels launched: {}", snapshot.kernels_launched);
        println!(
            "To device: {} transfers, {} bytes",
            snapshot.transfers_to_device, snapshot.bytes_to_device
        );
        println!(
            "To host: {} transfers, {} bytes",
            snapshot.transfers_to_host, snapshot.bytes_to_host
        );
        println!("Grid fallbacks: {}", snapshot.grid_fallbacks);

        if self.verbose {
            println!("\nEvents:");
            println!("  Allocated: {}", snapshot.events_allocated);
            println!("  Released: {}", snapshot.events_released);
            println!("  Outstanding: {}", snapshot.events_outstanding());

            println!("\nKernel time ({} samples):", snapshot.kernel_samples);
            println!("  Average: {:.2}μs", snapshot.avg_kernel_ns as f64 / 1_000.0);
            println!("  P50: {:.2}μs", snapshot.p50_kernel_ns as f64 / 1_000.0);
            println!("  P99: {:.2}μs", snapshot.p99_kernel_ns as f64 / 1_000.0);
            println!("  Max: {:.2}μs", snapshot.max_kernel_ns as f64 / 1_000.0);
        }

        println!("================================");

        Ok(())
    }
}

impl Default for ConsoleExporter {
    fn default() -> Self {
        Self::new(false)
    }
}
