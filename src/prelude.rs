pub use crate::config::{Config, ConfigBuilder};
pub use crate::device::DeviceHandle;
pub use crate::error::{Error, Result};
pub use crate::event::{Event, EventDescriptor, EventStatus};
pub use crate::geometry::{GridScheduler, WorkGrid};
pub use crate::graph::{create_graph, ExecutionPlan, ExecutionResult, TaskGraph, TransferMode};
pub use crate::kernel::{Access, CompiledKernel, HostKernel, PrebuiltKernel};
pub use crate::memory::{HostBuffer, KernelArg, Scalar};
pub use crate::{init, init_with_config, shutdown};

pub use crate::backend::HostBackend;

#[cfg(feature = "telemetry")]
pub use crate::telemetry::{Metrics, MetricsSnapshot};
