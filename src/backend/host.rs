//! CPU reference backend.
//!
//! Emulates an accelerator with a deferred, in-order command queue. Enqueued
//! commands sit in `QUEUED` until a flush marks them `SUBMITTED`; they run when
//! something waits on them (an event wait, `finish`, or a blocking read) and
//! end `COMPLETE` or with a negative error code. Kernel bodies are Rust
//! closures over a [`HostInvocation`].

use super::{
    codes, status, suggested_group_size, ArgValue, Backend, BackendKind, CommandQueue,
    DeviceBufferId, DeviceInfo, KernelObject, NativeError, NativeEvent, NativeResult,
    ProfilingInfo,
};
use crate::config::HostDeviceConfig;
use crate::kernel::{CompiledKernel, KernelSource};
use crate::memory::{Element, Scalar};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type HostKernelFn =
    Arc<dyn Fn(&mut HostInvocation<'_>) -> std::result::Result<(), String> + Send + Sync>;

/// Driver call names reported in [`NativeError`] and accepted by
/// [`HostBackend::fail_call`].
pub mod calls {
    pub const QUEUE_CREATE: &str = "zeCommandQueueCreate";
    pub const MEM_ALLOC: &str = "zeMemAllocDevice";
    pub const MEM_FREE: &str = "zeMemFree";
    pub const MEMORY_COPY: &str = "zeCommandListAppendMemoryCopy";
    pub const KERNEL_CREATE: &str = "zeKernelCreate";
    pub const KERNEL_DESTROY: &str = "zeKernelDestroy";
    pub const SET_ARGUMENT: &str = "zeKernelSetArgumentValue";
    pub const SUGGEST_GROUP_SIZE: &str = "zeKernelSuggestGroupSize";
    pub const SET_GROUP_SIZE: &str = "zeKernelSetGroupSize";
    pub const LAUNCH_KERNEL: &str = "zeCommandListAppendLaunchKernel";
    pub const BARRIER: &str = "zeCommandListAppendBarrier";
    pub const SIGNAL_EVENT: &str = "zeCommandListAppendSignalEvent";
    pub const EXECUTE: &str = "zeCommandQueueExecuteCommandLists";
    pub const SYNCHRONIZE: &str = "zeCommandQueueSynchronize";
    pub const EVENT_QUERY: &str = "zeEventQueryStatus";
    pub const EVENT_SYNCHRONIZE: &str = "zeEventHostSynchronize";
    pub const EVENT_TIMESTAMP: &str = "zeEventQueryKernelTimestamp";
    pub const EVENT_DESTROY: &str = "zeEventDestroy";
}

/// One recorded kernel dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub entry: String,
    pub global: [u64; 3],
    pub local: [u64; 3],
    pub groups: [u64; 3],
    pub wait_list: Vec<NativeEvent>,
    pub event: NativeEvent,
}

/// Counters of every native call the host backend has served.
#[derive(Debug, Clone, Default)]
pub struct HostStats {
    pub writes: HashMap<DeviceBufferId, usize>,
    pub bytes_written: u64,
    pub reads: usize,
    pub bytes_read: u64,
    pub launches: Vec<LaunchRecord>,
    pub allocations: usize,
    pub frees: usize,
    pub kernels_created: usize,
    pub waits: usize,
    pub flushes: usize,
    pub barriers: usize,
    pub markers: usize,
    pub status_queries: usize,
    pub released_events: usize,
}

impl HostStats {
    pub fn writes_to(&self, buffer: DeviceBufferId) -> usize {
        self.writes.get(&buffer).copied().unwrap_or(0)
    }

    pub fn launches_of(&self, entry: &str) -> impl Iterator<Item = &LaunchRecord> {
        let entry = entry.to_string();
        self.launches.iter().filter(move |l| l.entry == entry)
    }
}

struct HostShared {
    info: DeviceInfo,
    registry: RwLock<HashMap<String, HostKernelFn>>,
    call_faults: Mutex<HashMap<&'static str, VecDeque<i32>>>,
    kernel_faults: Mutex<VecDeque<i32>>,
    write_faults: Mutex<VecDeque<i32>>,
    stats: Mutex<HostStats>,
    epoch: Instant,
}

impl HostShared {
    fn injected(&self, call: &'static str) -> NativeResult<()> {
        let mut faults = self.call_faults.lock();
        match faults.get_mut(call).and_then(VecDeque::pop_front) {
            Some(code) => Err(NativeError::new(call, code)),
            None => Ok(()),
        }
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// Reference accelerator running on the calling thread.
///
/// Clones share the kernel registry, fault table and statistics.
#[derive(Clone)]
pub struct HostBackend {
    shared: Arc<HostShared>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::from_config(&HostDeviceConfig::default())
    }

    pub fn from_config(config: &HostDeviceConfig) -> Self {
        let info = DeviceInfo {
            name: config.name.clone(),
            kind: BackendKind::Host,
            max_work_item_sizes: config.max_work_item_sizes,
            max_work_group_size: config.max_work_group_size,
            supports_profiling: config.supports_profiling,
            global_memory_bytes: config.global_memory_bytes,
        };

        Self {
            shared: Arc::new(HostShared {
                info,
                registry: RwLock::new(HashMap::new()),
                call_faults: Mutex::new(HashMap::new()),
                kernel_faults: Mutex::new(VecDeque::new()),
                write_faults: Mutex::new(VecDeque::new()),
                stats: Mutex::new(HostStats::default()),
                epoch: Instant::now(),
            }),
        }
    }

    /// Device with the given per-dimension work-item limits.
    pub fn with_limits(max_work_item_sizes: [u64; 3], max_work_group_size: u64) -> Self {
        Self::from_config(&HostDeviceConfig {
            max_work_item_sizes,
            max_work_group_size,
            ..HostDeviceConfig::default()
        })
    }

    /// Provide the body for kernels loaded from a binary with this entry name.
    pub fn register_kernel<F>(&self, entry: impl Into<String>, body: F)
    where
        F: Fn(&mut HostInvocation<'_>) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.shared.registry.write().insert(entry.into(), Arc::new(body));
    }

    /// Make the next invocation of `call` fail with `code`.
    pub fn fail_call(&self, call: &'static str, code: i32) {
        self.shared
            .call_faults
            .lock()
            .entry(call)
            .or_default()
            .push_back(code);
    }

    /// Make the next kernel to execute finish with status `code`.
    pub fn fail_next_kernel(&self, code: i32) {
        self.shared.kernel_faults.lock().push_back(code);
    }

    /// Make the next buffer write to execute finish with status `code`.
    pub fn fail_next_write(&self, code: i32) {
        self.shared.write_faults.lock().push_back(code);
    }

    pub fn stats(&self) -> HostStats {
        self.shared.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.shared.stats.lock() = HostStats::default();
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBackend")
            .field("info", &self.shared.info)
            .finish()
    }
}

impl Backend for HostBackend {
    fn info(&self) -> &DeviceInfo {
        &self.shared.info
    }

    fn create_command_queue(&self, profiling: bool) -> NativeResult<Arc<dyn CommandQueue>> {
        self.shared.injected(calls::QUEUE_CREATE)?;
        Ok(Arc::new(HostQueue {
            shared: self.shared.clone(),
            profiling: profiling && self.shared.info.supports_profiling,
            state: Mutex::new(QueueState::default()),
        }))
    }
}

/// View of one kernel dispatch handed to a host kernel body.
///
/// Argument indices count user arguments only, starting at 0.
pub struct HostInvocation<'a> {
    dims: usize,
    global: [u64; 3],
    local: [u64; 3],
    args: &'a [ArgValue],
    buffers: &'a mut HashMap<DeviceBufferId, Vec<u8>>,
}

impl fmt::Debug for HostInvocation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostInvocation")
            .field("dims", &self.dims)
            .field("global", &self.global)
            .field("local", &self.local)
            .field("args", &self.args)
            .finish()
    }
}

impl<'a> HostInvocation<'a> {
    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn global_size(&self, dim: usize) -> u64 {
        self.global.get(dim).copied().unwrap_or(1)
    }

    pub fn local_size(&self, dim: usize) -> u64 {
        self.local.get(dim).copied().unwrap_or(1)
    }

    pub fn group_count(&self, dim: usize) -> u64 {
        self.global_size(dim) / self.local_size(dim).max(1)
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    fn buffer_id(&self, arg: usize) -> std::result::Result<DeviceBufferId, String> {
        match self.args.get(arg) {
            Some(ArgValue::Buffer(id)) => Ok(*id),
            Some(other) => Err(format!("argument {} is not a buffer: {:?}", arg, other)),
            None => Err(format!("argument {} out of range", arg)),
        }
    }

    pub fn read<T: Element>(&self, arg: usize) -> std::result::Result<Vec<T>, String> {
        let id = self.buffer_id(arg)?;
        let bytes = self
            .buffers
            .get(&id)
            .ok_or_else(|| format!("buffer {:?} not allocated", id))?;
        Ok(bytes
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    pub fn write<T: Element>(&mut self, arg: usize, values: &[T]) -> std::result::Result<(), String> {
        self.write_at(arg, 0, values)
    }

    /// Write `values` starting at element `offset`.
    pub fn write_at<T: Element>(
        &mut self,
        arg: usize,
        offset: usize,
        values: &[T],
    ) -> std::result::Result<(), String> {
        let id = self.buffer_id(arg)?;
        let bytes = self
            .buffers
            .get_mut(&id)
            .ok_or_else(|| format!("buffer {:?} not allocated", id))?;
        let src: &[u8] = bytemuck::cast_slice(values);
        let start = offset * std::mem::size_of::<T>();
        let end = start + src.len();
        if end > bytes.len() {
            return Err(format!(
                "write of {} bytes at {} overflows buffer of {} bytes",
                src.len(),
                start,
                bytes.len()
            ));
        }
        bytes[start..end].copy_from_slice(src);
        Ok(())
    }

    pub fn scalar(&self, arg: usize) -> std::result::Result<Scalar, String> {
        match self.args.get(arg) {
            Some(ArgValue::Scalar(s)) => Ok(*s),
            Some(other) => Err(format!("argument {} is not a scalar: {:?}", arg, other)),
            None => Err(format!("argument {} out of range", arg)),
        }
    }
}

struct KernelState {
    entry: String,
    dims: usize,
    body: HostKernelFn,
    args: Vec<Option<ArgValue>>,
    group_size: Option<[u64; 3]>,
}

enum Op {
    Write {
        dst: DeviceBufferId,
        data: Vec<u8>,
    },
    Kernel {
        dims: usize,
        body: HostKernelFn,
        args: Vec<ArgValue>,
        global: [u64; 3],
        local: [u64; 3],
    },
    Sync,
}

struct Command {
    event: NativeEvent,
    op: Op,
    wait_list: Vec<NativeEvent>,
}

struct EventRecord {
    status: i32,
    /// Released by the caller, kept while pending work still needs it.
    released: bool,
    submit: Option<u64>,
    start: Option<u64>,
    end: Option<u64>,
}

#[derive(Default)]
struct QueueState {
    next_handle: u64,
    buffers: HashMap<DeviceBufferId, Vec<u8>>,
    kernels: HashMap<KernelObject, KernelState>,
    events: HashMap<NativeEvent, EventRecord>,
    pending: VecDeque<Command>,
}

impl QueueState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn new_event(&mut self, status: i32) -> NativeEvent {
        let event = NativeEvent(self.next_handle());
        self.events.insert(
            event,
            EventRecord {
                status,
                released: false,
                submit: None,
                start: None,
                end: None,
            },
        );
        event
    }

    fn any_failed(&self, wait_list: &[NativeEvent]) -> bool {
        wait_list
            .iter()
            .any(|e| self.events.get(e).map_or(false, |r| r.status < 0))
    }

    /// Live record of `event`, skipping released ones.
    fn record(&self, event: &NativeEvent) -> Option<&EventRecord> {
        self.events.get(event).filter(|r| !r.released)
    }

    /// Drop released records no longer pending nor awaited by pending work.
    fn collect_released(&mut self) {
        let QueueState {
            events, pending, ..
        } = self;
        events.retain(|event, record| {
            !record.released
                || record.status > status::COMPLETE
                || pending.iter().any(|cmd| cmd.wait_list.contains(event))
        });
    }
}

struct HostQueue {
    shared: Arc<HostShared>,
    profiling: bool,
    state: Mutex<QueueState>,
}

impl fmt::Debug for HostQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostQueue")
            .field("device", &self.shared.info.name)
            .field("profiling", &self.profiling)
            .finish()
    }
}

impl HostQueue {
    /// Run pending commands in order, up to and including `target`.
    fn drain(&self, state: &mut QueueState, target: Option<NativeEvent>) {
        while let Some(cmd) = state.pending.pop_front() {
            let done = Some(cmd.event) == target;
            self.execute(state, cmd);
            if done {
                break;
            }
        }
        state.collect_released();
    }

    fn execute(&self, state: &mut QueueState, cmd: Command) {
        let start = self.shared.now_ns();

        let outcome = if state.any_failed(&cmd.wait_list) {
            codes::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST
        } else {
            match cmd.op {
                Op::Write { dst, data } => {
                    let fault = self.shared.write_faults.lock().pop_front();
                    match (fault, state.buffers.get_mut(&dst)) {
                        (Some(code), _) => code,
                        (None, Some(buf)) if data.len() <= buf.len() => {
                            buf[..data.len()].copy_from_slice(&data);
                            status::COMPLETE
                        }
                        (None, Some(_)) => codes::INVALID_VALUE,
                        (None, None) => codes::INVALID_MEM_OBJECT,
                    }
                }
                Op::Kernel {
                    dims,
                    body,
                    args,
                    global,
                    local,
                } => {
                    let fault = self.shared.kernel_faults.lock().pop_front();
                    match fault {
                        Some(code) => code,
                        None => {
                            let mut invocation = HostInvocation {
                                dims,
                                global,
                                local,
                                args: &args,
                                buffers: &mut state.buffers,
                            };
                            match body(&mut invocation) {
                                Ok(()) => status::COMPLETE,
                                Err(msg) => {
                                    log::debug!("host kernel failed: {}", msg);
                                    codes::HOST_KERNEL_FAILED
                                }
                            }
                        }
                    }
                }
                Op::Sync => status::COMPLETE,
            }
        };

        let end = self.shared.now_ns();
        if let Some(record) = state.events.get_mut(&cmd.event) {
            record.status = outcome;
            record.submit.get_or_insert(start);
            record.start = Some(start);
            record.end = Some(end);
        }
    }

    fn enqueue(&self, state: &mut QueueState, op: Op, wait_list: &[NativeEvent]) -> NativeEvent {
        let event = state.new_event(status::QUEUED);
        state.pending.push_back(Command {
            event,
            op,
            wait_list: wait_list.to_vec(),
        });
        event
    }
}

impl CommandQueue for HostQueue {
    fn allocate(&self, bytes: usize) -> NativeResult<DeviceBufferId> {
        self.shared.injected(calls::MEM_ALLOC)?;
        if bytes as u64 > self.shared.info.global_memory_bytes {
            return Err(NativeError::new(calls::MEM_ALLOC, codes::OUT_OF_RESOURCES));
        }
        let mut state = self.state.lock();
        let id = DeviceBufferId(state.next_handle());
        state.buffers.insert(id, vec![0u8; bytes]);
        self.shared.stats.lock().allocations += 1;
        Ok(id)
    }

    fn free(&self, buffer: DeviceBufferId) -> NativeResult<()> {
        self.shared.injected(calls::MEM_FREE)?;
        let mut state = self.state.lock();
        self.drain(&mut state, None);
        state
            .buffers
            .remove(&buffer)
            .ok_or_else(|| NativeError::new(calls::MEM_FREE, codes::INVALID_MEM_OBJECT))?;
        self.shared.stats.lock().frees += 1;
        Ok(())
    }

    fn enqueue_write(
        &self,
        dst: DeviceBufferId,
        data: &[u8],
        wait_list: &[NativeEvent],
    ) -> NativeResult<NativeEvent> {
        self.shared.injected(calls::MEMORY_COPY)?;
        let mut state = self.state.lock();
        if !state.buffers.contains_key(&dst) {
            return Err(NativeError::new(calls::MEMORY_COPY, codes::INVALID_MEM_OBJECT));
        }
        let event = self.enqueue(
            &mut state,
            Op::Write {
                dst,
                data: data.to_vec(),
            },
            wait_list,
        );

        let mut stats = self.shared.stats.lock();
        *stats.writes.entry(dst).or_default() += 1;
        stats.bytes_written += data.len() as u64;
        Ok(event)
    }

    fn enqueue_read(
        &self,
        src: DeviceBufferId,
        out: &mut [u8],
        wait_list: &[NativeEvent],
    ) -> NativeResult<NativeEvent> {
        self.shared.injected(calls::MEMORY_COPY)?;
        let mut state = self.state.lock();
        self.drain(&mut state, None);

        if state.any_failed(wait_list) {
            return Err(NativeError::new(
                calls::MEMORY_COPY,
                codes::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST,
            ));
        }
        let bytes = state
            .buffers
            .get(&src)
            .ok_or_else(|| NativeError::new(calls::MEMORY_COPY, codes::INVALID_MEM_OBJECT))?;
        if out.len() > bytes.len() {
            return Err(NativeError::new(calls::MEMORY_COPY, codes::INVALID_VALUE));
        }

        let start = self.shared.now_ns();
        out.copy_from_slice(&bytes[..out.len()]);
        let end = self.shared.now_ns();

        let event = state.new_event(status::COMPLETE);
        if let Some(record) = state.events.get_mut(&event) {
            record.submit = Some(start);
            record.start = Some(start);
            record.end = Some(end);
        }

        let mut stats = self.shared.stats.lock();
        stats.reads += 1;
        stats.bytes_read += out.len() as u64;
        Ok(event)
    }

    fn create_kernel(&self, kernel: &dyn CompiledKernel) -> NativeResult<KernelObject> {
        self.shared.injected(calls::KERNEL_CREATE)?;
        let body = match kernel.source() {
            KernelSource::Host(body) => body,
            _ => self
                .shared
                .registry
                .read()
                .get(kernel.entry_name())
                .cloned()
                .ok_or_else(|| {
                    NativeError::new(calls::KERNEL_CREATE, codes::INVALID_PROGRAM_EXECUTABLE)
                })?,
        };

        let mut state = self.state.lock();
        let id = KernelObject(state.next_handle());
        state.kernels.insert(
            id,
            KernelState {
                entry: kernel.entry_name().to_string(),
                dims: kernel.dims(),
                body,
                args: vec![None; 2 + kernel.argument_access_modes().len()],
                group_size: None,
            },
        );
        self.shared.stats.lock().kernels_created += 1;
        Ok(id)
    }

    fn release_kernel(&self, kernel: KernelObject) -> NativeResult<()> {
        self.shared.injected(calls::KERNEL_DESTROY)?;
        self.state
            .lock()
            .kernels
            .remove(&kernel)
            .map(|_| ())
            .ok_or_else(|| NativeError::new(calls::KERNEL_DESTROY, codes::INVALID_KERNEL))
    }

    fn set_kernel_arg(&self, kernel: KernelObject, index: u32, value: &ArgValue) -> NativeResult<()> {
        self.shared.injected(calls::SET_ARGUMENT)?;
        let mut state = self.state.lock();

        if let ArgValue::Buffer(id) | ArgValue::Frame(id) = value {
            if !state.buffers.contains_key(id) {
                return Err(NativeError::new(calls::SET_ARGUMENT, codes::INVALID_MEM_OBJECT));
            }
        }

        let k = state
            .kernels
            .get_mut(&kernel)
            .ok_or_else(|| NativeError::new(calls::SET_ARGUMENT, codes::INVALID_KERNEL))?;
        let slot = k
            .args
            .get_mut(index as usize)
            .ok_or_else(|| NativeError::new(calls::SET_ARGUMENT, codes::INVALID_ARG_INDEX))?;
        *slot = Some(value.clone());
        Ok(())
    }

    fn suggest_group_size(&self, kernel: KernelObject, global: [u64; 3]) -> NativeResult<[u64; 3]> {
        self.shared.injected(calls::SUGGEST_GROUP_SIZE)?;
        let state = self.state.lock();
        let k = state
            .kernels
            .get(&kernel)
            .ok_or_else(|| NativeError::new(calls::SUGGEST_GROUP_SIZE, codes::INVALID_KERNEL))?;

        Ok(suggested_group_size(&self.shared.info, k.dims, global))
    }

    fn set_group_size(&self, kernel: KernelObject, local: [u64; 3]) -> NativeResult<()> {
        self.shared.injected(calls::SET_GROUP_SIZE)?;
        let info = &self.shared.info;
        let within_limits = local
            .iter()
            .zip(info.max_work_item_sizes.iter())
            .all(|(l, max)| *l >= 1 && l <= max);
        if !within_limits || local.iter().product::<u64>() > info.max_work_group_size {
            return Err(NativeError::new(
                calls::SET_GROUP_SIZE,
                codes::INVALID_WORK_GROUP_SIZE,
            ));
        }

        let mut state = self.state.lock();
        let k = state
            .kernels
            .get_mut(&kernel)
            .ok_or_else(|| NativeError::new(calls::SET_GROUP_SIZE, codes::INVALID_KERNEL))?;
        k.group_size = Some(local);
        Ok(())
    }

    fn enqueue_kernel(
        &self,
        kernel: KernelObject,
        group_count: [u64; 3],
        wait_list: &[NativeEvent],
    ) -> NativeResult<NativeEvent> {
        self.shared.injected(calls::LAUNCH_KERNEL)?;
        let mut state = self.state.lock();
        let k = state
            .kernels
            .get(&kernel)
            .ok_or_else(|| NativeError::new(calls::LAUNCH_KERNEL, codes::INVALID_KERNEL))?;

        let local = k
            .group_size
            .ok_or_else(|| NativeError::new(calls::LAUNCH_KERNEL, codes::INVALID_WORK_GROUP_SIZE))?;
        if group_count.iter().any(|g| *g == 0) {
            return Err(NativeError::new(calls::LAUNCH_KERNEL, codes::INVALID_VALUE));
        }
        let bound: Option<Vec<ArgValue>> = k.args.iter().cloned().collect();
        let bound =
            bound.ok_or_else(|| NativeError::new(calls::LAUNCH_KERNEL, codes::INVALID_KERNEL_ARGS))?;

        let global = [
            group_count[0] * local[0],
            group_count[1] * local[1],
            group_count[2] * local[2],
        ];
        let entry = k.entry.clone();
        let op = Op::Kernel {
            dims: k.dims,
            body: k.body.clone(),
            args: bound[2..].to_vec(),
            global,
            local,
        };
        let event = self.enqueue(&mut state, op, wait_list);

        self.shared.stats.lock().launches.push(LaunchRecord {
            entry,
            global,
            local,
            groups: group_count,
            wait_list: wait_list.to_vec(),
            event,
        });
        Ok(event)
    }

    fn enqueue_barrier(&self, wait_list: &[NativeEvent]) -> NativeResult<NativeEvent> {
        self.shared.injected(calls::BARRIER)?;
        let mut state = self.state.lock();
        let event = self.enqueue(&mut state, Op::Sync, wait_list);
        self.shared.stats.lock().barriers += 1;
        Ok(event)
    }

    fn enqueue_marker(&self, wait_list: &[NativeEvent]) -> NativeResult<NativeEvent> {
        self.shared.injected(calls::SIGNAL_EVENT)?;
        let mut state = self.state.lock();
        let event = self.enqueue(&mut state, Op::Sync, wait_list);
        self.shared.stats.lock().markers += 1;
        Ok(event)
    }

    fn flush(&self) -> NativeResult<()> {
        self.shared.injected(calls::EXECUTE)?;
        let now = self.shared.now_ns();
        let mut state = self.state.lock();
        let QueueState {
            pending, events, ..
        } = &mut *state;
        for cmd in pending.iter() {
            if let Some(record) = events.get_mut(&cmd.event) {
                if record.status == status::QUEUED {
                    record.status = status::SUBMITTED;
                    record.submit = Some(now);
                }
            }
        }
        self.shared.stats.lock().flushes += 1;
        Ok(())
    }

    fn finish(&self) -> NativeResult<()> {
        self.shared.injected(calls::SYNCHRONIZE)?;
        let mut state = self.state.lock();
        self.drain(&mut state, None);
        Ok(())
    }

    fn event_status(&self, event: NativeEvent) -> NativeResult<i32> {
        self.shared.injected(calls::EVENT_QUERY)?;
        self.shared.stats.lock().status_queries += 1;
        self.state
            .lock()
            .record(&event)
            .map(|r| r.status)
            .ok_or_else(|| NativeError::new(calls::EVENT_QUERY, codes::INVALID_EVENT))
    }

    /// Pending work runs inside the wait, so a timeout never elapses here.
    fn wait_for_events(&self, events: &[NativeEvent], _timeout: Option<Duration>) -> NativeResult<()> {
        self.shared.injected(calls::EVENT_SYNCHRONIZE)?;
        self.shared.stats.lock().waits += 1;
        let mut state = self.state.lock();
        for event in events {
            let status = state
                .record(event)
                .map(|r| r.status)
                .ok_or_else(|| NativeError::new(calls::EVENT_SYNCHRONIZE, codes::INVALID_EVENT))?;
            if status > status::COMPLETE {
                self.drain(&mut state, Some(*event));
            }
        }
        Ok(())
    }

    fn profiling_info(&self, event: NativeEvent, info: ProfilingInfo) -> NativeResult<u64> {
        self.shared.injected(calls::EVENT_TIMESTAMP)?;
        let unavailable = || NativeError::new(calls::EVENT_TIMESTAMP, codes::PROFILING_INFO_NOT_AVAILABLE);
        if !self.profiling {
            return Err(unavailable());
        }
        let state = self.state.lock();
        let record = state
            .record(&event)
            .ok_or_else(|| NativeError::new(calls::EVENT_TIMESTAMP, codes::INVALID_EVENT))?;
        let value = match info {
            ProfilingInfo::Submit => record.submit,
            ProfilingInfo::Start => record.start,
            ProfilingInfo::End => record.end,
        };
        value.ok_or_else(unavailable)
    }

    fn release_event(&self, event: NativeEvent) -> NativeResult<()> {
        self.shared.injected(calls::EVENT_DESTROY)?;
        let mut state = self.state.lock();
        match state.events.get_mut(&event) {
            Some(record) if !record.released => record.released = true,
            _ => return Err(NativeError::new(calls::EVENT_DESTROY, codes::INVALID_EVENT)),
        }
        state.collect_released();
        self.shared.stats.lock().released_events += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Access, HostKernel};

    fn fill_kernel() -> HostKernel {
        HostKernel::new("fill", &[8], &[Access::Write, Access::Read], |inv| {
            let value = inv.scalar(1)?.as_i64() as i32;
            let n = inv.global_size(0) as usize;
            inv.write(0, &vec![value; n])
        })
    }

    #[test]
    fn test_deferred_execution() {
        let backend = HostBackend::new();
        let queue = backend.create_command_queue(true).unwrap();
        let buf = queue.allocate(8).unwrap();

        let ev = queue.enqueue_write(buf, &[1, 2, 3, 4, 5, 6, 7, 8], &[]).unwrap();
        assert_eq!(queue.event_status(ev).unwrap(), status::QUEUED);

        queue.flush().unwrap();
        assert_eq!(queue.event_status(ev).unwrap(), status::SUBMITTED);

        queue.wait_for_events(&[ev], None).unwrap();
        assert_eq!(queue.event_status(ev).unwrap(), status::COMPLETE);

        let mut out = [0u8; 8];
        queue.enqueue_read(buf, &mut out, &[ev]).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);

        let start = queue.profiling_info(ev, ProfilingInfo::Start).unwrap();
        let end = queue.profiling_info(ev, ProfilingInfo::End).unwrap();
        assert!(end >= start);
    }

    #[test]
    fn test_dispatch_requires_committed_group_size() {
        let backend = HostBackend::new();
        let queue = backend.create_command_queue(false).unwrap();
        let kernel = fill_kernel();
        let k = queue.create_kernel(&kernel).unwrap();
        let frame = queue.allocate(16).unwrap();
        let out = queue.allocate(32).unwrap();

        queue.set_kernel_arg(k, 0, &ArgValue::Heap).unwrap();
        queue.set_kernel_arg(k, 1, &ArgValue::Frame(frame)).unwrap();
        queue.set_kernel_arg(k, 2, &ArgValue::Buffer(out)).unwrap();
        queue.set_kernel_arg(k, 3, &ArgValue::Scalar(Scalar::I32(9))).unwrap();

        let err = queue.enqueue_kernel(k, [2, 1, 1], &[]).unwrap_err();
        assert_eq!(err.code, codes::INVALID_WORK_GROUP_SIZE);

        queue.set_group_size(k, [4, 1, 1]).unwrap();
        let ev = queue.enqueue_kernel(k, [2, 1, 1], &[]).unwrap();
        queue.wait_for_events(&[ev], None).unwrap();
        assert_eq!(queue.event_status(ev).unwrap(), status::COMPLETE);

        let mut bytes = [0u8; 32];
        queue.enqueue_read(out, &mut bytes, &[]).unwrap();
        let values: Vec<i32> = bytemuck::cast_slice(&bytes).to_vec();
        assert_eq!(values, vec![9; 8]);

        let launch = &backend.stats().launches[0];
        assert_eq!(launch.global, [8, 1, 1]);
        assert_eq!(launch.local, [4, 1, 1]);
    }

    #[test]
    fn test_unbound_arguments_rejected() {
        let backend = HostBackend::new();
        let queue = backend.create_command_queue(false).unwrap();
        let k = queue.create_kernel(&fill_kernel()).unwrap();
        queue.set_group_size(k, [8, 1, 1]).unwrap();
        let err = queue.enqueue_kernel(k, [1, 1, 1], &[]).unwrap_err();
        assert_eq!(err.code, codes::INVALID_KERNEL_ARGS);
        assert_eq!(
            queue.set_kernel_arg(k, 9, &ArgValue::Heap).unwrap_err().code,
            codes::INVALID_ARG_INDEX
        );
    }

    #[test]
    fn test_wait_list_error_propagates() {
        let backend = HostBackend::new();
        let queue = backend.create_command_queue(false).unwrap();
        let buf = queue.allocate(4).unwrap();
        let first = queue.enqueue_write(buf, &[0u8; 16], &[]).unwrap();
        let second = queue.enqueue_barrier(&[first]).unwrap();
        queue.finish().unwrap();
        assert_eq!(queue.event_status(first).unwrap(), codes::INVALID_VALUE);
        assert_eq!(
            queue.event_status(second).unwrap(),
            codes::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST
        );
    }

    #[test]
    fn test_fault_injection() {
        let backend = HostBackend::new();
        backend.fail_call(calls::MEM_ALLOC, codes::OUT_OF_RESOURCES);
        let queue = backend.create_command_queue(false).unwrap();
        let err = queue.allocate(4).unwrap_err();
        assert_eq!(err, NativeError::new(calls::MEM_ALLOC, codes::OUT_OF_RESOURCES));
        assert!(queue.allocate(4).is_ok());
    }

    #[test]
    fn test_profiling_unavailable_without_flag() {
        let backend = HostBackend::new();
        let queue = backend.create_command_queue(false).unwrap();
        let ev = queue.enqueue_marker(&[]).unwrap();
        queue.finish().unwrap();
        let err = queue.profiling_info(ev, ProfilingInfo::End).unwrap_err();
        assert_eq!(err.code, codes::PROFILING_INFO_NOT_AVAILABLE);
    }

    #[test]
    fn test_release_event() {
        let backend = HostBackend::new();
        let queue = backend.create_command_queue(false).unwrap();
        let ev = queue.enqueue_marker(&[]).unwrap();
        queue.release_event(ev).unwrap();
        assert_eq!(queue.event_status(ev).unwrap_err().code, codes::INVALID_EVENT);
        assert_eq!(backend.stats().released_events, 1);
    }

    #[test]
    fn test_released_event_still_gates_dependents() {
        let backend = HostBackend::new();
        backend.fail_next_write(codes::OUT_OF_RESOURCES);
        let queue = backend.create_command_queue(false).unwrap();
        let buf = queue.allocate(8).unwrap();
        let write = queue.enqueue_write(buf, &[1u8; 8], &[]).unwrap();
        let after = queue.enqueue_marker(&[write]).unwrap();
        queue.release_event(write).unwrap();
        assert_eq!(queue.release_event(write).unwrap_err().code, codes::INVALID_EVENT);

        queue.finish().unwrap();
        assert_eq!(
            queue.event_status(after).unwrap(),
            codes::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST
        );
        assert_eq!(queue.event_status(write).unwrap_err().code, codes::INVALID_EVENT);
    }

    #[test]
    fn test_registered_kernel_for_binary_source() {
        use crate::kernel::PrebuiltKernel;

        let backend = HostBackend::new();
        let queue = backend.create_command_queue(false).unwrap();
        let kernel = PrebuiltKernel::wgsl("main", "@compute fn main() {}", &[], &[1]);
        let err = queue.create_kernel(&kernel).unwrap_err();
        assert_eq!(err.code, codes::INVALID_PROGRAM_EXECUTABLE);

        backend.register_kernel("main", |_| Ok(()));
        assert!(queue.create_kernel(&kernel).is_ok());
    }
}
