//! Backend capability traits.
//!
//! Everything above this module is written once against [`Backend`] and
//! [`CommandQueue`]. A backend reports failures as [`NativeError`] carrying the
//! driver call name and its numeric code; status values follow OpenCL
//! numbering so every backend maps onto the same event state machine.

pub mod host;

#[cfg(feature = "gpu")]
pub mod wgpu;

use crate::kernel::CompiledKernel;
use crate::memory::Scalar;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use host::{HostBackend, HostStats};

/// Native command execution status values.
pub mod status {
    pub const COMPLETE: i32 = 0;
    pub const RUNNING: i32 = 1;
    pub const SUBMITTED: i32 = 2;
    pub const QUEUED: i32 = 3;
}

/// Native error codes shared by the backends.
pub mod codes {
    pub const OUT_OF_RESOURCES: i32 = -5;
    pub const PROFILING_INFO_NOT_AVAILABLE: i32 = -7;
    pub const EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST: i32 = -14;
    pub const INVALID_VALUE: i32 = -30;
    pub const INVALID_MEM_OBJECT: i32 = -38;
    pub const INVALID_BINARY: i32 = -42;
    pub const INVALID_PROGRAM_EXECUTABLE: i32 = -45;
    pub const INVALID_KERNEL: i32 = -48;
    pub const INVALID_ARG_INDEX: i32 = -49;
    pub const INVALID_KERNEL_ARGS: i32 = -52;
    pub const INVALID_WORK_GROUP_SIZE: i32 = -54;
    pub const INVALID_EVENT: i32 = -58;
    pub const WAIT_TIMEOUT: i32 = -1001;
    pub const HOST_KERNEL_FAILED: i32 = -1000;
}

/// A failed driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeError {
    pub call: &'static str,
    pub code: i32,
}

impl NativeError {
    pub fn new(call: &'static str, code: i32) -> Self {
        Self { call, code }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} returned {}", self.call, self.code)
    }
}

impl std::error::Error for NativeError {}

pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Driver-side event handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeEvent(pub u64);

/// Device allocation handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceBufferId(pub u64);

/// Driver-side kernel object, carrying an argument table and a group size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelObject(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilingInfo {
    Submit,
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    Host,
    Wgpu,
}

/// Static device properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: BackendKind,
    pub max_work_item_sizes: [u64; 3],
    pub max_work_group_size: u64,
    pub supports_profiling: bool,
    pub global_memory_bytes: u64,
}

/// Value bound to a kernel argument slot.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    /// Implicit device heap pointer, always slot 0.
    Heap,
    /// Implicit per-task frame, always slot 1.
    Frame(DeviceBufferId),
    Buffer(DeviceBufferId),
    Scalar(Scalar),
}

fn best_divisor(n: u64, max: u64) -> u64 {
    let cap = n.min(max);
    (1..=cap).rev().find(|d| n % d == 0).unwrap_or(1)
}

/// Driver-style group size suggestion: per active dimension, the largest
/// divisor of the global size within the item limit and the remaining
/// work-group budget.
pub(crate) fn suggested_group_size(info: &DeviceInfo, dims: usize, global: [u64; 3]) -> [u64; 3] {
    let limits = info.max_work_item_sizes;
    let mut budget = info.max_work_group_size.max(1);
    let mut suggested = [1u64; 3];
    for d in 0..dims.min(3) {
        let g = best_divisor(global[d].max(1), limits[d].min(budget).max(1));
        suggested[d] = g;
        budget = (budget / g).max(1);
    }
    suggested
}

/// An accelerator that can hand out command queues.
pub trait Backend: Send + Sync + fmt::Debug {
    fn info(&self) -> &DeviceInfo;

    fn max_work_item_sizes_per_dimension(&self) -> [u64; 3] {
        self.info().max_work_item_sizes
    }

    fn supports_profiling(&self) -> bool {
        self.info().supports_profiling
    }

    fn create_command_queue(&self, profiling: bool) -> NativeResult<Arc<dyn CommandQueue>>;
}

/// An in-order command queue on one device.
///
/// Enqueue operations return immediately with a native event; the event's
/// status advances as the device makes progress. `enqueue_read` is blocking.
pub trait CommandQueue: Send + Sync + fmt::Debug {
    fn allocate(&self, bytes: usize) -> NativeResult<DeviceBufferId>;

    fn free(&self, buffer: DeviceBufferId) -> NativeResult<()>;

    fn enqueue_write(
        &self,
        dst: DeviceBufferId,
        data: &[u8],
        wait_list: &[NativeEvent],
    ) -> NativeResult<NativeEvent>;

    fn enqueue_read(
        &self,
        src: DeviceBufferId,
        out: &mut [u8],
        wait_list: &[NativeEvent],
    ) -> NativeResult<NativeEvent>;

    fn create_kernel(&self, kernel: &dyn CompiledKernel) -> NativeResult<KernelObject>;

    fn release_kernel(&self, kernel: KernelObject) -> NativeResult<()>;

    fn set_kernel_arg(&self, kernel: KernelObject, index: u32, value: &ArgValue) -> NativeResult<()>;

    fn suggest_group_size(&self, kernel: KernelObject, global: [u64; 3]) -> NativeResult<[u64; 3]>;

    fn set_group_size(&self, kernel: KernelObject, local: [u64; 3]) -> NativeResult<()>;

    fn enqueue_kernel(
        &self,
        kernel: KernelObject,
        group_count: [u64; 3],
        wait_list: &[NativeEvent],
    ) -> NativeResult<NativeEvent>;

    fn enqueue_barrier(&self, wait_list: &[NativeEvent]) -> NativeResult<NativeEvent>;

    fn enqueue_marker(&self, wait_list: &[NativeEvent]) -> NativeResult<NativeEvent>;

    fn flush(&self) -> NativeResult<()>;

    /// Block until every enqueued command has finished.
    fn finish(&self) -> NativeResult<()>;

    fn event_status(&self, event: NativeEvent) -> NativeResult<i32>;

    fn wait_for_events(&self, events: &[NativeEvent], timeout: Option<Duration>) -> NativeResult<()>;

    /// Timestamp in nanoseconds.
    fn profiling_info(&self, event: NativeEvent, info: ProfilingInfo) -> NativeResult<u64>;

    fn release_event(&self, event: NativeEvent) -> NativeResult<()>;
}
