//! Kernel launch orchestration.
//!
//! A launch writes the task frame, binds arguments in a fixed order (heap
//! pointer at 0, frame at 1, user arguments from 2), commits a group size on
//! the kernel object, dispatches `global / local` groups behind the caller's
//! wait list and follows the dispatch with a device barrier.

use crate::backend::{ArgValue, DeviceBufferId, DeviceInfo, KernelObject, NativeEvent};
use crate::device::DeviceHandle;
use crate::error::{Error, Result};
use crate::event::{Event, EventDescriptor};
use crate::geometry::{effective_max_work_item_sizes, group_size, Geometry};
use crate::kernel::CompiledKernel;
use crate::memory::KernelArg;

/// Index of the first user argument.
pub const FIRST_USER_ARG: u32 = 2;

/// Driver-side objects created once per task and reused across executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedKernel {
    pub(crate) object: KernelObject,
    pub(crate) frame: DeviceBufferId,
    pub(crate) dims: usize,
}

impl PreparedKernel {
    pub fn new(device: &DeviceHandle, kernel: &dyn CompiledKernel) -> Result<Self> {
        let queue = &device.shared().queue;
        let object = queue.create_kernel(kernel).map_err(Error::launch)?;

        // one 64-bit slot per user argument
        let frame_bytes = kernel.argument_access_modes().len().max(1) * 8;
        let frame = match queue.allocate(frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                let _ = queue.release_kernel(object);
                return Err(Error::launch(err));
            }
        };

        Ok(Self {
            object,
            frame,
            dims: kernel.dims(),
        })
    }

    /// Release the kernel object and its frame.
    pub fn release(self, device: &DeviceHandle) -> Result<()> {
        let queue = &device.shared().queue;
        queue.release_kernel(self.object)?;
        queue.free(self.frame)?;
        Ok(())
    }
}

/// Result of one dispatch: its event and the geometry actually committed.
#[derive(Debug)]
pub struct Launched {
    pub event: Event,
    pub geometry: Geometry,
}

fn fits(local: [u64; 3], global: [u64; 3], dims: usize, info: &DeviceInfo) -> bool {
    let active = 0..dims;
    active.clone().all(|d| {
        local[d] >= 1 && local[d] <= info.max_work_item_sizes[d] && global[d] % local[d] == 0
    }) && local[..dims].iter().product::<u64>() <= info.max_work_group_size
        && local[dims..].iter().all(|l| *l == 1)
}

/// Final group size: the planned one if the device can run it, else the
/// driver's suggestion, else a per-dimension divisor of the global size.
pub fn reconcile(
    planned: Option<[u64; 3]>,
    suggested: [u64; 3],
    global: [u64; 3],
    dims: usize,
    info: &DeviceInfo,
) -> [u64; 3] {
    if let Some(local) = planned.filter(|l| fits(*l, global, dims, info)) {
        return local;
    }
    if fits(suggested, global, dims, info) {
        return suggested;
    }

    let effective = effective_max_work_item_sizes(dims, info.max_work_item_sizes);
    let mut local = [1u64; 3];
    for d in 0..dims {
        local[d] = group_size(effective[d], global[d]);
    }
    if fits(local, global, dims, info) {
        local
    } else {
        [1, 1, 1]
    }
}

fn resolve_args(device: &DeviceHandle, args: &[KernelArg]) -> Result<Vec<ArgValue>> {
    args.iter()
        .map(|arg| match arg {
            KernelArg::Buffer(buf) => device.ensure_allocated(buf).map(ArgValue::Buffer),
            KernelArg::Scalar(s) => Ok(ArgValue::Scalar(*s)),
        })
        .collect()
}

fn frame_bytes(values: &[ArgValue]) -> Vec<u8> {
    let slots: Vec<u64> = values
        .iter()
        .map(|v| match v {
            ArgValue::Buffer(id) | ArgValue::Frame(id) => id.0,
            ArgValue::Scalar(s) => s.to_bits(),
            ArgValue::Heap => 0,
        })
        .collect();
    bytemuck::cast_slice(&slots).to_vec()
}

/// Bind every argument, settle the group size and enqueue the kernel.
fn dispatch(
    device: &DeviceHandle,
    task: &str,
    prepared: &PreparedKernel,
    user_args: &[ArgValue],
    geometry: &Geometry,
    wait: &[NativeEvent],
) -> Result<(NativeEvent, [u64; 3])> {
    let queue = &device.shared().queue;
    queue
        .set_kernel_arg(prepared.object, 0, &ArgValue::Heap)
        .map_err(|e| Error::binding(0, e))?;
    queue
        .set_kernel_arg(prepared.object, 1, &ArgValue::Frame(prepared.frame))
        .map_err(|e| Error::binding(1, e))?;
    for (i, value) in user_args.iter().enumerate() {
        let index = FIRST_USER_ARG + i as u32;
        queue
            .set_kernel_arg(prepared.object, index, value)
            .map_err(|e| Error::binding(index, e))?;
    }

    let global = geometry.global_work;
    let suggested = queue
        .suggest_group_size(prepared.object, global)
        .map_err(Error::launch)?;
    let local = reconcile(
        geometry.local_work,
        suggested,
        global,
        geometry.dims,
        device.info(),
    );
    queue
        .set_group_size(prepared.object, local)
        .map_err(Error::launch)?;

    let groups = [global[0] / local[0], global[1] / local[1], global[2] / local[2]];

    if device.shared().print_thread_dims {
        log::info!(
            "task {}: dims={} global={:?} local={:?} groups={:?}",
            task,
            geometry.dims,
            &global[..geometry.dims],
            &local[..geometry.dims],
            &groups[..geometry.dims]
        );
    }
    log::debug!(
        "launch {} global={:?} local={:?} after {} events",
        task,
        global,
        local,
        wait.len()
    );

    let native = queue
        .enqueue_kernel(prepared.object, groups, wait)
        .map_err(Error::launch)?;
    Ok((native, local))
}

/// Launch `prepared` for task `task` over `geometry` once every event in
/// `wait_list` has completed.
pub fn launch(
    device: &DeviceHandle,
    task: &str,
    prepared: &PreparedKernel,
    args: &[KernelArg],
    geometry: &Geometry,
    wait_list: &[&Event],
) -> Result<Launched> {
    let queue = &device.shared().queue;
    let user_args = resolve_args(device, args)?;

    let frame = frame_bytes(&user_args);
    let frame_event = queue
        .enqueue_write(prepared.frame, &frame, &[])
        .map_err(Error::launch)?;

    // the kernel waits on its frame, so a failed frame write fails the kernel
    let mut wait: Vec<NativeEvent> = wait_list.iter().map(|e| e.native()).collect();
    wait.push(frame_event);
    let dispatched = dispatch(device, task, prepared, &user_args, geometry, &wait);
    if let Err(err) = queue.release_event(frame_event) {
        log::warn!("failed to release frame write event of {}: {}", task, err);
    }
    let (native, local) = dispatched?;
    let global = geometry.global_work;

    let final_geometry = Geometry {
        dims: geometry.dims,
        global_work: global,
        local_work: Some(local),
    };
    let descriptor = if final_geometry.is_serial() {
        EventDescriptor::SerialKernel
    } else {
        EventDescriptor::ParallelKernel
    };
    let event = device.register_event(native, descriptor)?;

    device.enqueue_barrier().map_err(Error::launch)?;

    if let Some(metrics) = device.metrics() {
        metrics.record_kernel_launch();
    }

    Ok(Launched {
        event,
        geometry: final_geometry,
    })
}
