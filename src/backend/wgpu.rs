//! wgpu compute backend.
//!
//! Runs WGSL kernels. Bind group 0 carries the task frame at binding 0
//! (read-only `array<u32>`, two words per argument slot, scalars included) and
//! the buffer argument with user index `i` at binding `1 + i`. Kernels declare
//! `@workgroup_size(WG_X, WG_Y, WG_Z)`; the committed group size is substituted
//! before the pipeline is built, one pipeline per group size.
//!
//! wgpu queues are in order and submit eagerly, so events start `SUBMITTED`
//! and complete from `on_submitted_work_done`.

use super::{
    codes, status, suggested_group_size, ArgValue, Backend, BackendKind, CommandQueue,
    DeviceBufferId, DeviceInfo, KernelObject, NativeError, NativeEvent, NativeResult,
    ProfilingInfo,
};
use crate::error::{Error, Result};
use crate::kernel::{Access, CompiledKernel, KernelSource};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod calls {
    pub const CREATE_BUFFER: &str = "wgpuDeviceCreateBuffer";
    pub const DESTROY_BUFFER: &str = "wgpuBufferDestroy";
    pub const WRITE_BUFFER: &str = "wgpuQueueWriteBuffer";
    pub const MAP_ASYNC: &str = "wgpuBufferMapAsync";
    pub const CREATE_SHADER_MODULE: &str = "wgpuDeviceCreateShaderModule";
    pub const CREATE_COMPUTE_PIPELINE: &str = "wgpuDeviceCreateComputePipeline";
    pub const SET_BIND_GROUP: &str = "wgpuComputePassEncoderSetBindGroup";
    pub const DISPATCH: &str = "wgpuComputePassEncoderDispatchWorkgroups";
    pub const SUBMIT: &str = "wgpuQueueSubmit";
    pub const POLL: &str = "wgpuDevicePoll";
    pub const WORK_DONE: &str = "wgpuQueueOnSubmittedWorkDone";
    pub const RELEASE: &str = "wgpuRelease";
}

struct WgpuShared {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter: wgpu::AdapterInfo,
    info: DeviceInfo,
}

/// A GPU reached through wgpu.
#[derive(Clone)]
pub struct WgpuBackend {
    shared: Arc<WgpuShared>,
}

impl WgpuBackend {
    /// Open the highest-performance adapter available.
    pub fn new() -> Result<Self> {
        futures::executor::block_on(Self::request())
    }

    async fn request() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| Error::gpu("No GPU adapter found"))?;

        let adapter_info = adapter.get_info();

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("tessera-gpu-device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .map_err(|e| Error::gpu(format!("Failed to request device: {}", e)))?;

        let limits = device.limits();
        let info = DeviceInfo {
            name: adapter_info.name.clone(),
            kind: BackendKind::Wgpu,
            max_work_item_sizes: [
                limits.max_compute_workgroup_size_x as u64,
                limits.max_compute_workgroup_size_y as u64,
                limits.max_compute_workgroup_size_z as u64,
            ],
            max_work_group_size: limits.max_compute_invocations_per_workgroup as u64,
            supports_profiling: false,
            global_memory_bytes: limits.max_buffer_size,
        };

        log::debug!("opened wgpu adapter {} ({:?})", adapter_info.name, adapter_info.backend);

        Ok(Self {
            shared: Arc::new(WgpuShared {
                device,
                queue,
                adapter: adapter_info,
                info,
            }),
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.shared.adapter
    }
}

impl fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("info", &self.shared.info)
            .finish()
    }
}

impl Backend for WgpuBackend {
    fn info(&self) -> &DeviceInfo {
        &self.shared.info
    }

    fn create_command_queue(&self, _profiling: bool) -> NativeResult<Arc<dyn CommandQueue>> {
        Ok(Arc::new(WgpuQueue {
            shared: self.shared.clone(),
            state: Mutex::new(QueueState::default()),
        }))
    }
}

struct DeviceBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

struct Pipeline {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

struct KernelState {
    entry: String,
    dims: usize,
    source: Arc<str>,
    accesses: Vec<Access>,
    args: Vec<Option<ArgValue>>,
    group_size: Option<[u64; 3]>,
    pipelines: HashMap<[u64; 3], Arc<Pipeline>>,
}

#[derive(Default)]
struct QueueState {
    next_handle: u64,
    buffers: HashMap<DeviceBufferId, DeviceBuffer>,
    kernels: HashMap<KernelObject, KernelState>,
    events: HashMap<NativeEvent, Arc<AtomicI32>>,
}

impl QueueState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn any_failed(&self, wait_list: &[NativeEvent]) -> bool {
        wait_list.iter().any(|e| {
            self.events
                .get(e)
                .map_or(false, |s| s.load(Ordering::Acquire) < 0)
        })
    }
}

struct WgpuQueue {
    shared: Arc<WgpuShared>,
    state: Mutex<QueueState>,
}

impl fmt::Debug for WgpuQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuQueue")
            .field("device", &self.shared.info.name)
            .finish()
    }
}

fn with_group_size(source: &str, local: [u64; 3]) -> String {
    source
        .replace("WG_X", &local[0].to_string())
        .replace("WG_Y", &local[1].to_string())
        .replace("WG_Z", &local[2].to_string())
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl WgpuQueue {
    /// Submit recorded work (or nothing) and return an event that completes
    /// with it.
    fn submit(
        &self,
        state: &mut QueueState,
        commands: Option<wgpu::CommandBuffer>,
        wait_list: &[NativeEvent],
    ) -> NativeEvent {
        let event = NativeEvent(state.next_handle());
        if state.any_failed(wait_list) {
            let failed = Arc::new(AtomicI32::new(codes::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST));
            state.events.insert(event, failed);
            return event;
        }

        let flag = Arc::new(AtomicI32::new(status::SUBMITTED));
        state.events.insert(event, flag.clone());
        self.shared.queue.submit(commands);
        self.shared.queue.on_submitted_work_done(move || {
            flag.store(status::COMPLETE, Ordering::Release);
        });
        event
    }

    fn pipeline(&self, kernel: &mut KernelState, local: [u64; 3]) -> NativeResult<Arc<Pipeline>> {
        if let Some(pipeline) = kernel.pipelines.get(&local) {
            return Ok(pipeline.clone());
        }

        let device = &self.shared.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(kernel.entry.as_str()),
            source: wgpu::ShaderSource::Wgsl(with_group_size(&kernel.source, local).into()),
        });

        let mut entries = vec![storage_entry(0, true)];
        for (i, access) in kernel.accesses.iter().enumerate() {
            if let Some(Some(ArgValue::Buffer(_))) = kernel.args.get(2 + i) {
                entries.push(storage_entry(1 + i as u32, !access.writes()));
            }
        }
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("tessera-kernel-layout"),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("tessera-pipeline-layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(kernel.entry.as_str()),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: &kernel.entry,
        });

        if let Some(err) = futures::executor::block_on(device.pop_error_scope()) {
            log::warn!("pipeline for {} rejected: {}", kernel.entry, err);
            return Err(NativeError::new(
                calls::CREATE_COMPUTE_PIPELINE,
                codes::INVALID_PROGRAM_EXECUTABLE,
            ));
        }

        let pipeline = Arc::new(Pipeline { pipeline, layout });
        kernel.pipelines.insert(local, pipeline.clone());
        Ok(pipeline)
    }
}

impl CommandQueue for WgpuQueue {
    fn allocate(&self, bytes: usize) -> NativeResult<DeviceBufferId> {
        // storage bindings need a 4-byte multiple
        let size = ((bytes.max(4) + 3) & !3) as u64;
        if size > self.shared.info.global_memory_bytes {
            return Err(NativeError::new(calls::CREATE_BUFFER, codes::OUT_OF_RESOURCES));
        }
        let buffer = self.shared.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tessera-device-buffer"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let mut state = self.state.lock();
        let id = DeviceBufferId(state.next_handle());
        state.buffers.insert(id, DeviceBuffer { buffer, size });
        Ok(id)
    }

    fn free(&self, buffer: DeviceBufferId) -> NativeResult<()> {
        let removed = self.state.lock().buffers.remove(&buffer);
        match removed {
            Some(b) => {
                b.buffer.destroy();
                Ok(())
            }
            None => Err(NativeError::new(calls::DESTROY_BUFFER, codes::INVALID_MEM_OBJECT)),
        }
    }

    fn enqueue_write(
        &self,
        dst: DeviceBufferId,
        data: &[u8],
        wait_list: &[NativeEvent],
    ) -> NativeResult<NativeEvent> {
        let mut state = self.state.lock();
        let target = state
            .buffers
            .get(&dst)
            .ok_or_else(|| NativeError::new(calls::WRITE_BUFFER, codes::INVALID_MEM_OBJECT))?;
        if data.len() as u64 > target.size {
            return Err(NativeError::new(calls::WRITE_BUFFER, codes::INVALID_VALUE));
        }

        // write_buffer needs a 4-byte multiple
        if data.len() % 4 == 0 {
            self.shared.queue.write_buffer(&target.buffer, 0, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize((data.len() + 3) & !3, 0);
            self.shared.queue.write_buffer(&target.buffer, 0, &padded);
        }
        Ok(self.submit(&mut state, None, wait_list))
    }

    fn enqueue_read(
        &self,
        src: DeviceBufferId,
        out: &mut [u8],
        wait_list: &[NativeEvent],
    ) -> NativeResult<NativeEvent> {
        let mut state = self.state.lock();
        if state.any_failed(wait_list) {
            return Err(NativeError::new(
                calls::MAP_ASYNC,
                codes::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST,
            ));
        }
        let source = state
            .buffers
            .get(&src)
            .ok_or_else(|| NativeError::new(calls::MAP_ASYNC, codes::INVALID_MEM_OBJECT))?;
        if out.len() as u64 > source.size {
            return Err(NativeError::new(calls::MAP_ASYNC, codes::INVALID_VALUE));
        }

        let device = &self.shared.device;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tessera-staging-buffer"),
            size: source.size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("tessera-read-encoder"),
        });
        encoder.copy_buffer_to_buffer(&source.buffer, 0, &staging, 0, source.size);
        self.shared.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = device.poll(wgpu::Maintain::Wait);

        match futures::executor::block_on(receiver) {
            Ok(Ok(())) => {}
            _ => return Err(NativeError::new(calls::MAP_ASYNC, codes::OUT_OF_RESOURCES)),
        }
        {
            let mapped = slice.get_mapped_range();
            out.copy_from_slice(&mapped[..out.len()]);
        }
        staging.unmap();

        let event = NativeEvent(state.next_handle());
        state
            .events
            .insert(event, Arc::new(AtomicI32::new(status::COMPLETE)));
        Ok(event)
    }

    fn create_kernel(&self, kernel: &dyn CompiledKernel) -> NativeResult<KernelObject> {
        let source = match kernel.source() {
            KernelSource::Wgsl(source) => source,
            KernelSource::Binary { .. } => {
                return Err(NativeError::new(calls::CREATE_SHADER_MODULE, codes::INVALID_BINARY))
            }
            KernelSource::Host(_) => {
                return Err(NativeError::new(
                    calls::CREATE_SHADER_MODULE,
                    codes::INVALID_PROGRAM_EXECUTABLE,
                ))
            }
        };

        let accesses = kernel.argument_access_modes().to_vec();
        let mut state = self.state.lock();
        let id = KernelObject(state.next_handle());
        state.kernels.insert(
            id,
            KernelState {
                entry: kernel.entry_name().to_string(),
                dims: kernel.dims(),
                source,
                args: vec![None; 2 + accesses.len()],
                accesses,
                group_size: None,
                pipelines: HashMap::new(),
            },
        );
        Ok(id)
    }

    fn release_kernel(&self, kernel: KernelObject) -> NativeResult<()> {
        self.state
            .lock()
            .kernels
            .remove(&kernel)
            .map(|_| ())
            .ok_or_else(|| NativeError::new(calls::RELEASE, codes::INVALID_KERNEL))
    }

    fn set_kernel_arg(&self, kernel: KernelObject, index: u32, value: &ArgValue) -> NativeResult<()> {
        let mut state = self.state.lock();
        if let ArgValue::Buffer(id) | ArgValue::Frame(id) = value {
            if !state.buffers.contains_key(id) {
                return Err(NativeError::new(calls::SET_BIND_GROUP, codes::INVALID_MEM_OBJECT));
            }
        }
        let k = state
            .kernels
            .get_mut(&kernel)
            .ok_or_else(|| NativeError::new(calls::SET_BIND_GROUP, codes::INVALID_KERNEL))?;
        let slot = k
            .args
            .get_mut(index as usize)
            .ok_or_else(|| NativeError::new(calls::SET_BIND_GROUP, codes::INVALID_ARG_INDEX))?;
        *slot = Some(value.clone());
        Ok(())
    }

    fn suggest_group_size(&self, kernel: KernelObject, global: [u64; 3]) -> NativeResult<[u64; 3]> {
        let state = self.state.lock();
        let k = state
            .kernels
            .get(&kernel)
            .ok_or_else(|| NativeError::new(calls::DISPATCH, codes::INVALID_KERNEL))?;
        Ok(suggested_group_size(&self.shared.info, k.dims, global))
    }

    fn set_group_size(&self, kernel: KernelObject, local: [u64; 3]) -> NativeResult<()> {
        let info = &self.shared.info;
        let within_limits = local
            .iter()
            .zip(info.max_work_item_sizes.iter())
            .all(|(l, max)| *l >= 1 && l <= max);
        if !within_limits || local.iter().product::<u64>() > info.max_work_group_size {
            return Err(NativeError::new(calls::DISPATCH, codes::INVALID_WORK_GROUP_SIZE));
        }
        let mut state = self.state.lock();
        let k = state
            .kernels
            .get_mut(&kernel)
            .ok_or_else(|| NativeError::new(calls::DISPATCH, codes::INVALID_KERNEL))?;
        k.group_size = Some(local);
        Ok(())
    }

    fn enqueue_kernel(
        &self,
        kernel: KernelObject,
        group_count: [u64; 3],
        wait_list: &[NativeEvent],
    ) -> NativeResult<NativeEvent> {
        let mut state = self.state.lock();
        let mut k = state
            .kernels
            .remove(&kernel)
            .ok_or_else(|| NativeError::new(calls::DISPATCH, codes::INVALID_KERNEL))?;
        let result = self.record_dispatch(&mut state, &mut k, group_count, wait_list);
        state.kernels.insert(kernel, k);
        result
    }

    fn enqueue_barrier(&self, wait_list: &[NativeEvent]) -> NativeResult<NativeEvent> {
        let mut state = self.state.lock();
        Ok(self.submit(&mut state, None, wait_list))
    }

    fn enqueue_marker(&self, wait_list: &[NativeEvent]) -> NativeResult<NativeEvent> {
        let mut state = self.state.lock();
        Ok(self.submit(&mut state, None, wait_list))
    }

    fn flush(&self) -> NativeResult<()> {
        let _ = self.shared.device.poll(wgpu::Maintain::Poll);
        Ok(())
    }

    fn finish(&self) -> NativeResult<()> {
        let _ = self.shared.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn event_status(&self, event: NativeEvent) -> NativeResult<i32> {
        let _ = self.shared.device.poll(wgpu::Maintain::Poll);
        self.state
            .lock()
            .events
            .get(&event)
            .map(|s| s.load(Ordering::Acquire))
            .ok_or_else(|| NativeError::new(calls::WORK_DONE, codes::INVALID_EVENT))
    }

    fn wait_for_events(&self, events: &[NativeEvent], timeout: Option<Duration>) -> NativeResult<()> {
        let statuses: Vec<Arc<AtomicI32>> = {
            let state = self.state.lock();
            events
                .iter()
                .map(|e| {
                    state
                        .events
                        .get(e)
                        .cloned()
                        .ok_or_else(|| NativeError::new(calls::POLL, codes::INVALID_EVENT))
                })
                .collect::<NativeResult<_>>()?
        };
        let pending = || statuses.iter().any(|s| s.load(Ordering::Acquire) > status::COMPLETE);

        match timeout {
            None => {
                let _ = self.shared.device.poll(wgpu::Maintain::Wait);
            }
            Some(limit) => {
                let deadline = Instant::now() + limit;
                while pending() && Instant::now() < deadline {
                    let _ = self.shared.device.poll(wgpu::Maintain::Poll);
                    std::thread::sleep(Duration::from_micros(50));
                }
            }
        }
        Ok(())
    }

    fn profiling_info(&self, _event: NativeEvent, _info: ProfilingInfo) -> NativeResult<u64> {
        Err(NativeError::new(calls::WORK_DONE, codes::PROFILING_INFO_NOT_AVAILABLE))
    }

    fn release_event(&self, event: NativeEvent) -> NativeResult<()> {
        self.state
            .lock()
            .events
            .remove(&event)
            .map(|_| ())
            .ok_or_else(|| NativeError::new(calls::RELEASE, codes::INVALID_EVENT))
    }
}

impl WgpuQueue {
    fn record_dispatch(
        &self,
        state: &mut QueueState,
        kernel: &mut KernelState,
        group_count: [u64; 3],
        wait_list: &[NativeEvent],
    ) -> NativeResult<NativeEvent> {
        let local = kernel
            .group_size
            .ok_or_else(|| NativeError::new(calls::DISPATCH, codes::INVALID_WORK_GROUP_SIZE))?;
        if group_count.iter().any(|g| *g == 0 || *g > u32::MAX as u64) {
            return Err(NativeError::new(calls::DISPATCH, codes::INVALID_VALUE));
        }
        if kernel.args.iter().any(Option::is_none) {
            return Err(NativeError::new(calls::DISPATCH, codes::INVALID_KERNEL_ARGS));
        }

        let pipeline = self.pipeline(kernel, local)?;

        let mut bindings: Vec<(u32, DeviceBufferId)> = Vec::new();
        if let Some(Some(ArgValue::Frame(frame))) = kernel.args.get(1) {
            bindings.push((0, *frame));
        }
        for (i, arg) in kernel.args.iter().skip(2).enumerate() {
            if let Some(ArgValue::Buffer(id)) = arg {
                bindings.push((1 + i as u32, *id));
            }
        }

        let mut entries = Vec::with_capacity(bindings.len());
        for (binding, id) in &bindings {
            let buffer = state
                .buffers
                .get(id)
                .ok_or_else(|| NativeError::new(calls::SET_BIND_GROUP, codes::INVALID_MEM_OBJECT))?;
            entries.push(wgpu::BindGroupEntry {
                binding: *binding,
                resource: buffer.buffer.as_entire_binding(),
            });
        }

        let device = &self.shared.device;
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("tessera-kernel-bind-group"),
            layout: &pipeline.layout,
            entries: &entries,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("tessera-kernel-encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.entry.as_str()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                group_count[0] as u32,
                group_count[1] as u32,
                group_count[2] as u32,
            );
        }

        drop(entries);
        Ok(self.submit(state, Some(encoder.finish()), wait_list))
    }
}
