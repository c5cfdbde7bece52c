//! Tessera - task-graph dispatch for heterogeneous devices
//!
//! Tessera takes a declarative graph of compute tasks over host buffers and
//! runs it on an accelerator: it decides when host/device copies actually
//! happen, computes device-legal work geometry for every kernel, launches
//! kernels with ordered argument bindings and inter-task dependencies, and
//! tracks completion and timing through pooled events.
//!
//! # Quick Start
//!
//! ```no_run
//! use tessera_rs::prelude::*;
//!
//! let kernel = HostKernel::new("double", &[4], &[Access::ReadWrite], |inv| {
//!     let values: Vec<f32> = inv.read(0)?;
//!     let doubled: Vec<f32> = values.iter().map(|v| v * 2.0).collect();
//!     inv.write(0, &doubled)
//! })
//! .shared();
//!
//! let data = HostBuffer::from_slice(&[1.0f32, 2.0, 3.0, 4.0]);
//!
//! let mut graph = create_graph("s0");
//! graph.task("t0", kernel, vec![(&data).into()]).unwrap();
//! graph
//!     .transfer_to_device(TransferMode::FirstExecution, &[&data])
//!     .transfer_to_host(TransferMode::EveryExecution, &[&data]);
//!
//! let mut plan = graph.snapshot().unwrap();
//! plan.bind_device(DeviceHandle::host().unwrap());
//! plan.execute().unwrap();
//!
//! assert_eq!(data.to_vec::<f32>(), vec![2.0, 4.0, 6.0, 8.0]);
//! ```
//!
//! # Features
//!
//! - **Transfer modes**: copy once per device, on every execution, or only on request
//! - **Geometry planning**: divisor-based local sizes within device limits
//! - **Pooled events**: bounded native event usage with lazy status resolution
//! - **Telemetry**: launch, transfer and kernel-time metrics (optional)
//! - **GPU Support**: wgpu backend for WGSL kernels (optional)

#![warn(missing_debug_implementations)]

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod geometry;
pub mod graph;
pub mod kernel;
pub mod launch;
pub mod memory;
pub mod prelude;
pub mod runtime;
pub mod telemetry;

// Re-export key types at crate root
pub use config::{Config, ConfigBuilder};
pub use device::DeviceHandle;
pub use error::{Error, Result};
pub use event::{Event, EventStatus};
pub use graph::{create_graph, ExecutionPlan, ExecutionResult, TaskGraph, TransferMode};
pub use runtime::{init, init_with_config, shutdown};
