//! Execution plans: a frozen graph bound to a device.

use super::executor::{self, ExecutionResult};
use super::{FrozenGraph, TransferDirection};
use crate::backend::DeviceBufferId;
use crate::device::DeviceHandle;
use crate::error::{Error, Result};
use crate::geometry::{GridScheduler, WorkGrid};
use crate::launch::PreparedKernel;
use crate::memory::{HostBuffer, ObjectId};
use crate::runtime;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Per plan and device pairing. Reset when the plan moves to another device.
#[derive(Debug, Default)]
pub(crate) struct PlanState {
    /// FIRST_EXECUTION transfers already done, with the device buffer each
    /// one went to. A copy counts only while that buffer still backs the
    /// object.
    pub(crate) performed: HashMap<(ObjectId, TransferDirection), DeviceBufferId>,
    /// Kernel objects and frames, keyed by task id.
    pub(crate) kernels: HashMap<String, PreparedKernel>,
}

impl PlanState {
    fn release(&mut self, device: &DeviceHandle) {
        for (task, prepared) in self.kernels.drain() {
            if let Err(err) = prepared.release(device) {
                log::warn!("failed to release kernel of task {}: {}", task, err);
            }
        }
        self.performed.clear();
    }
}

pub struct ExecutionPlan {
    graph: Arc<FrozenGraph>,
    device: Option<DeviceHandle>,
    grids: HashMap<String, WorkGrid>,
    batch_threads: u64,
    state: PlanState,
    execution_count: u64,
}

impl ExecutionPlan {
    pub(crate) fn new(graph: Arc<FrozenGraph>) -> Self {
        Self {
            graph,
            device: None,
            grids: HashMap::new(),
            batch_threads: 0,
            state: PlanState::default(),
            execution_count: 0,
        }
    }

    pub fn graph_name(&self) -> &str {
        &self.graph.name
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.graph.tasks.iter().map(|t| t.id.as_str())
    }

    /// Run on `device` from now on. Moving to a different device frees what
    /// the plan held on the old one and re-arms FIRST_EXECUTION transfers.
    pub fn bind_device(&mut self, device: DeviceHandle) -> &mut Self {
        if let Some(current) = self.device.take() {
            if current.same_device(&device) {
                self.device = Some(current);
                return self;
            }
            self.leave_device(&current);
        }
        self.device = Some(device);
        self
    }

    /// Drop everything this plan holds on `old`, graph buffers included.
    fn leave_device(&mut self, old: &DeviceHandle) {
        if let Err(err) = old.synchronize() {
            log::warn!(
                "failed to synchronize device before rebinding {}: {}",
                self.graph.name,
                err
            );
        }
        self.state.release(old);
        for buffer in self.graph.buffers() {
            if let Err(err) = old.free_buffer(buffer.id()) {
                log::warn!("failed to free {} on previous device: {}", buffer.id(), err);
            }
        }
    }

    pub fn device(&self) -> Option<&DeviceHandle> {
        self.device.as_ref()
    }

    /// Override the geometry of one task.
    pub fn with_worker_grid(&mut self, task_id: &str, grid: WorkGrid) -> Result<&mut Self> {
        let task = self.graph.task(task_id).ok_or_else(|| {
            Error::config(format!(
                "graph '{}' has no task '{}'",
                self.graph.name, task_id
            ))
        })?;
        if task.kernel.dims() != grid.dims() {
            return Err(Error::config(format!(
                "worker grid for '{}' has {} dimensions, kernel has {}",
                task_id,
                grid.dims(),
                task.kernel.dims()
            )));
        }
        self.grids.insert(task_id.to_string(), grid);
        Ok(self)
    }

    /// Apply every `"<graph>.<task>"` entry naming this plan's graph.
    pub fn with_grid_scheduler(&mut self, scheduler: &GridScheduler) -> Result<&mut Self> {
        let prefix = format!("{}.", self.graph.name);
        let entries: Vec<(String, WorkGrid)> = scheduler
            .iter()
            .filter_map(|(name, grid)| {
                name.strip_prefix(&prefix)
                    .map(|task| (task.to_string(), grid.clone()))
            })
            .collect();
        for (task, grid) in entries {
            self.with_worker_grid(&task, grid)?;
        }
        Ok(self)
    }

    /// Launch `threads` threads per active dimension instead of the kernel's
    /// domain. Zero restores the default.
    pub fn with_batch_threads(&mut self, threads: u64) -> &mut Self {
        self.batch_threads = threads;
        self
    }

    /// Create kernel objects, frames and device allocations now instead of on
    /// the first execution.
    pub fn with_warm_up(&mut self) -> Result<&mut Self> {
        let device = self.ensure_device()?;
        for task in &self.graph.tasks {
            if !self.state.kernels.contains_key(&task.id) {
                let prepared = PreparedKernel::new(&device, task.kernel.as_ref())?;
                self.state.kernels.insert(task.id.clone(), prepared);
            }
        }
        for buffer in self.graph.buffers() {
            device.ensure_allocated(&buffer)?;
        }
        Ok(self)
    }

    fn ensure_device(&mut self) -> Result<DeviceHandle> {
        if let Some(device) = &self.device {
            return Ok(device.clone());
        }
        let device = runtime::default_device()?;
        self.device = Some(device.clone());
        Ok(device)
    }

    pub fn execute(&mut self) -> Result<ExecutionResult> {
        let device = self.ensure_device()?;
        let result = executor::run(
            &self.graph,
            &device,
            &self.grids,
            self.batch_threads,
            &mut self.state,
        )?;
        self.execution_count += 1;
        Ok(result)
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    fn check_known(&self, objects: &[&HostBuffer]) -> Result<()> {
        match objects.iter().find(|o| !self.graph.references(o.id())) {
            Some(unknown) => Err(Error::config(format!(
                "{} is not part of graph '{}'",
                unknown.id(),
                self.graph.name
            ))),
            None => Ok(()),
        }
    }

    /// Copy `objects` to the device now, regardless of their transfer mode.
    pub fn transfer_to_device(&mut self, objects: &[&HostBuffer]) -> Result<()> {
        self.check_known(objects)?;
        let device = self.ensure_device()?;
        for object in objects {
            device.write_buffer(object, &[])?.wait_on()?;
        }
        Ok(())
    }

    /// Copy `objects` back to the host now, after all enqueued work.
    pub fn transfer_to_host(&mut self, objects: &[&HostBuffer]) -> Result<()> {
        self.check_known(objects)?;
        let device = self.ensure_device()?;
        for object in objects {
            device.read_buffer(object, &[])?.wait_on()?;
        }
        Ok(())
    }

    /// Release kernel objects and every device allocation of the graph's
    /// buffers. The next execution starts as if on a fresh device.
    pub fn free_device_memory(&mut self) -> Result<()> {
        let Some(device) = self.device.clone() else {
            return Ok(());
        };
        device.synchronize()?;
        self.state.release(&device);
        for buffer in self.graph.buffers() {
            device.free_buffer(buffer.id())?;
        }
        Ok(())
    }
}

impl Drop for ExecutionPlan {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            self.state.release(&device);
        }
    }
}

impl fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("graph", &self.graph.name)
            .field("tasks", &self.graph.tasks.len())
            .field("device", &self.device)
            .field("execution_count", &self.execution_count)
            .finish()
    }
}
