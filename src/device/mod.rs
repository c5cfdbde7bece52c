//! Device handle and command-queue façade.
//!
//! A [`DeviceHandle`] bundles one backend, one command queue, one event pool
//! and the table of device allocations backing host objects. Handles are
//! cheap to clone and `Send`; clones refer to the same device state.

mod memory;

use crate::backend::{
    Backend, CommandQueue, DeviceBufferId, DeviceInfo, HostBackend, NativeEvent, NativeResult,
};
use crate::config::{BackendPreference, Config};
use crate::error::{Error, Result};
use crate::event::{Event, EventDescriptor, EventPool, DEFAULT_TAG};
use crate::geometry::GeometryPlanner;
use crate::memory::ObjectId;
use crate::runtime;
use crate::telemetry::Metrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memory::Allocation;

pub(crate) struct DeviceShared {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) queue: Arc<dyn CommandQueue>,
    pub(crate) events: EventPool,
    pub(crate) allocations: Mutex<HashMap<ObjectId, Allocation>>,
    // most recent post-launch barrier; never handed out
    pub(crate) last_barrier: Mutex<Option<NativeEvent>>,
    pub(crate) planner: GeometryPlanner,
    pub(crate) wait_timeout: Option<Duration>,
    pub(crate) print_thread_dims: bool,
    metrics: Option<Arc<Metrics>>,
    next_tag: AtomicU64,
}

impl DeviceShared {
    pub(crate) fn next_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_deref()
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        let _ = self.queue.finish();
        if let Some(barrier) = self.last_barrier.get_mut().take() {
            let _ = self.queue.release_event(barrier);
        }
        for (_, allocation) in self.allocations.get_mut().drain() {
            let _ = self.queue.free(allocation.buffer);
        }
    }
}

#[derive(Clone)]
pub struct DeviceHandle {
    shared: Arc<DeviceShared>,
}

impl DeviceHandle {
    /// Wrap `backend`, configured from the running runtime (or defaults).
    pub fn new(backend: impl Backend + 'static) -> Result<Self> {
        Self::with_config(Arc::new(backend), &runtime::current_config())
    }

    /// A CPU reference device with the configured host limits.
    pub fn host() -> Result<Self> {
        let config = runtime::current_config();
        Self::with_config(Arc::new(HostBackend::from_config(&config.host_device)), &config)
    }

    /// The device `config.backend` asks for.
    pub fn from_config(config: &Config) -> Result<Self> {
        let backend: Arc<dyn Backend> = match config.backend {
            BackendPreference::Host => Arc::new(HostBackend::from_config(&config.host_device)),

            #[cfg(feature = "gpu")]
            BackendPreference::Wgpu => Arc::new(crate::backend::wgpu::WgpuBackend::new()?),
        };
        Self::with_config(backend, config)
    }

    pub fn with_config(backend: Arc<dyn Backend>, config: &Config) -> Result<Self> {
        config.validate()?;

        // Timestamps are always collected when the device can; reads are gated
        // by the process-wide profiling flag.
        let queue = backend
            .create_command_queue(backend.supports_profiling())
            .map_err(Error::from)?;

        #[cfg(feature = "telemetry")]
        let metrics = config.enable_telemetry.then(|| Arc::new(Metrics::new()));
        #[cfg(not(feature = "telemetry"))]
        let metrics: Option<Arc<Metrics>> = None;

        Ok(Self {
            shared: Arc::new(DeviceShared {
                backend,
                queue,
                events: EventPool::new(config.event_pool_capacity),
                allocations: Mutex::new(HashMap::new()),
                last_barrier: Mutex::new(None),
                planner: GeometryPlanner::from_config(config),
                wait_timeout: config.wait_timeout,
                print_thread_dims: config.print_thread_dims,
                metrics,
                next_tag: AtomicU64::new(DEFAULT_TAG),
            }),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    pub fn info(&self) -> &DeviceInfo {
        self.shared.backend.info()
    }

    pub fn max_work_item_sizes(&self) -> [u64; 3] {
        self.shared.backend.max_work_item_sizes_per_dimension()
    }

    pub fn supports_profiling(&self) -> bool {
        self.shared.backend.supports_profiling()
    }

    pub fn event_pool(&self) -> &EventPool {
        &self.shared.events
    }

    pub fn planner(&self) -> &GeometryPlanner {
        &self.shared.planner
    }

    /// `None` when telemetry is disabled.
    pub fn metrics(&self) -> Option<&Metrics> {
        self.shared.metrics()
    }

    /// Device allocation currently backing `object`.
    pub fn device_buffer(&self, object: ObjectId) -> Option<DeviceBufferId> {
        self.shared
            .allocations
            .lock()
            .get(&object)
            .map(|a| a.buffer)
    }

    /// Whether two handles refer to the same device state.
    pub fn same_device(&self, other: &DeviceHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn flush(&self) -> Result<()> {
        self.shared.queue.flush().map_err(Error::from)
    }

    /// Block until every enqueued command has finished.
    pub fn synchronize(&self) -> Result<()> {
        self.shared.queue.finish().map_err(Error::from)
    }

    /// Enqueue a marker that completes once all earlier commands have.
    pub fn enqueue_marker(&self) -> Result<Event> {
        let native = self.shared.queue.enqueue_marker(&[])?;
        Event::register(&self.shared, native, EventDescriptor::SyncMarker)
    }

    /// Enqueue a barrier and keep its event as the device's latest barrier,
    /// releasing the previous one.
    pub(crate) fn enqueue_barrier(&self) -> NativeResult<()> {
        let native = self.shared.queue.enqueue_barrier(&[])?;
        let previous = self.shared.last_barrier.lock().replace(native);
        if let Some(previous) = previous {
            if let Err(err) = self.shared.queue.release_event(previous) {
                log::warn!("failed to release barrier event: {}", err);
            }
        }
        Ok(())
    }

    pub(crate) fn register_event(
        &self,
        native: NativeEvent,
        descriptor: EventDescriptor,
    ) -> Result<Event> {
        Event::register(&self.shared, native, descriptor)
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device", &self.info().name)
            .field("kind", &self.info().kind)
            .field("events_in_use", &self.shared.events.in_use())
            .finish()
    }
}
