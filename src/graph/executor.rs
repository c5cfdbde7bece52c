//! The execution driver.
//!
//! One `execute()` runs device-bound transfers, launches every task in
//! declaration order behind the events it depends on, then copies results
//! back to the host once their producers have finished.

use super::plan::PlanState;
use super::{DataTransfer, FrozenGraph, TaskNode, TransferDirection, TransferMode};
use crate::backend::DeviceBufferId;
use crate::device::DeviceHandle;
use crate::error::Result;
use crate::event::Event;
use crate::geometry::{Geometry, WorkGrid};
use crate::launch::{self, PreparedKernel};
use crate::memory::ObjectId;
use crate::runtime;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Timing and traffic of one execution. Device times are `-1` when profiling
/// is disabled or a counter could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProfilerResult {
    pub total_time_ns: u64,
    pub device_kernel_time_ns: i64,
    pub device_write_time_ns: i64,
    pub device_read_time_ns: i64,
    pub bytes_to_device: u64,
    pub bytes_to_host: u64,
}

impl ProfilerResult {
    #[cfg(feature = "telemetry")]
    pub fn to_json(&self) -> crate::error::Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| crate::error::Error::telemetry(format!("serialization failed: {}", e)))
    }
}

#[derive(Debug)]
pub struct TaskRecord {
    pub id: String,
    pub event: Event,
    pub geometry: Geometry,
    /// Earlier tasks this launch waited on.
    pub dependencies: Vec<String>,
}

#[derive(Debug)]
pub struct ExecutionResult {
    tasks: Vec<TaskRecord>,
    profiler: ProfilerResult,
}

impl ExecutionResult {
    fn record(&self, task_id: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn per_task_event(&self, task_id: &str) -> Option<&Event> {
        self.record(task_id).map(|t| &t.event)
    }

    pub fn geometry(&self, task_id: &str) -> Option<&Geometry> {
        self.record(task_id).map(|t| &t.geometry)
    }

    pub fn dependencies(&self, task_id: &str) -> Option<&[String]> {
        self.record(task_id).map(|t| t.dependencies.as_slice())
    }

    pub fn tasks(&self) -> &[TaskRecord] {
        &self.tasks
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.id.as_str())
    }

    /// Wall-clock time of the whole execution.
    pub fn total_time(&self) -> Duration {
        Duration::from_nanos(self.profiler.total_time_ns)
    }

    /// Sum of kernel execution times in nanoseconds, `-1` if unavailable.
    pub fn device_kernel_time(&self) -> i64 {
        self.profiler.device_kernel_time_ns
    }

    pub fn profiler(&self) -> &ProfilerResult {
        &self.profiler
    }

    pub fn wait_all(&self) -> Result<()> {
        for task in &self.tasks {
            task.event.wait_on()?;
        }
        Ok(())
    }
}

/// Whether `entry` copies this execution. `current` is the device buffer
/// now backing the object, if any.
fn should_run(entry: &DataTransfer, state: &PlanState, current: Option<DeviceBufferId>) -> bool {
    match entry.mode {
        TransferMode::FirstExecution => {
            let key = (entry.object.id(), entry.direction);
            current.is_none() || state.performed.get(&key).copied() != current
        }
        TransferMode::EveryExecution => true,
        TransferMode::UserDefined => false,
    }
}

fn mark_done(entry: &DataTransfer, state: &mut PlanState, buffer: DeviceBufferId) {
    if entry.mode == TransferMode::FirstExecution {
        state
            .performed
            .insert((entry.object.id(), entry.direction), buffer);
    }
}

fn sum_times<'a>(events: impl IntoIterator<Item = &'a Event>) -> i64 {
    if !runtime::profiling_enabled() {
        return -1;
    }
    let mut total = 0i64;
    for event in events {
        let t = event.execution_time();
        if t < 0 {
            return -1;
        }
        total += t;
    }
    total
}

fn plan_geometry(
    device: &DeviceHandle,
    task: &TaskNode,
    grid: Option<&WorkGrid>,
    batch: u64,
) -> Result<Geometry> {
    match grid {
        Some(grid) => {
            let (geometry, fell_back) = device.planner().plan_grid(grid, device.info())?;
            if fell_back {
                if let Some(metrics) = device.metrics() {
                    metrics.record_grid_fallback();
                }
            }
            Ok(geometry)
        }
        None => {
            let dims = task.kernel.dims();
            let domain: Vec<u64> = (0..dims).map(|d| task.kernel.domain_cardinality(d)).collect();
            device
                .planner()
                .plan(dims, &domain, batch, device.max_work_item_sizes())
        }
    }
}

/// Tasks whose completion must precede a host copy of `object`: its writers,
/// or every task using it when none writes it.
fn producers<'r>(graph: &FrozenGraph, records: &'r [TaskRecord], object: ObjectId) -> Vec<&'r Event> {
    let writers: Vec<&Event> = graph
        .tasks
        .iter()
        .zip(records)
        .filter(|(task, _)| task.writes(object))
        .map(|(_, record)| &record.event)
        .collect();
    if !writers.is_empty() {
        return writers;
    }
    graph
        .tasks
        .iter()
        .zip(records)
        .filter(|(task, _)| task.references(object))
        .map(|(_, record)| &record.event)
        .collect()
}

pub(crate) fn run(
    graph: &FrozenGraph,
    device: &DeviceHandle,
    grids: &HashMap<String, WorkGrid>,
    batch: u64,
    state: &mut PlanState,
) -> Result<ExecutionResult> {
    let started = Instant::now();
    let mut bytes_to_device = 0u64;
    let mut bytes_to_host = 0u64;

    // device-bound copies of this execution, keyed by object
    let mut writes: HashMap<ObjectId, Event> = HashMap::new();
    for entry in graph
        .transfers
        .iter()
        .filter(|t| t.direction == TransferDirection::ToDevice)
    {
        if entry.mode == TransferMode::UserDefined {
            continue;
        }
        // allocates or grows first, so a fresh buffer always gets the copy
        let buffer = device.ensure_allocated(&entry.object)?;
        if !should_run(entry, state, Some(buffer)) {
            continue;
        }
        let event = device.write_buffer(&entry.object, &[])?;
        mark_done(entry, state, buffer);
        bytes_to_device += entry.object.len_bytes() as u64;
        writes.insert(entry.object.id(), event);
    }

    let mut records: Vec<TaskRecord> = Vec::with_capacity(graph.tasks.len());
    for (index, task) in graph.tasks.iter().enumerate() {
        let mut wait: Vec<&Event> = Vec::new();
        for object in task.objects() {
            if let Some(event) = writes.get(&object) {
                if !wait.iter().any(|e| std::ptr::eq(*e, event)) {
                    wait.push(event);
                }
            }
        }

        let mut dependencies = Vec::new();
        for (earlier, record) in graph.tasks[..index].iter().zip(&records) {
            if task.shares_object_with(earlier) {
                wait.push(&record.event);
                dependencies.push(record.id.clone());
            }
        }

        let grid = grids.get(&task.id).or(task.grid.as_ref());
        let geometry = plan_geometry(device, task, grid, batch)?;

        let prepared = match state.kernels.get(&task.id) {
            Some(prepared) => *prepared,
            None => {
                let prepared = PreparedKernel::new(device, task.kernel.as_ref())?;
                state.kernels.insert(task.id.clone(), prepared);
                prepared
            }
        };

        let launched = launch::launch(device, &task.id, &prepared, &task.args, &geometry, &wait)?;

        records.push(TaskRecord {
            id: task.id.clone(),
            event: launched.event,
            geometry: launched.geometry,
            dependencies,
        });
    }

    let mut reads: Vec<Event> = Vec::new();
    for entry in graph
        .transfers
        .iter()
        .filter(|t| t.direction == TransferDirection::ToHost)
    {
        let current = device.device_buffer(entry.object.id());
        if !should_run(entry, state, current) {
            continue;
        }
        let after = producers(graph, &records, entry.object.id());
        for event in &after {
            event.wait_on()?;
        }
        let event = device.read_buffer(&entry.object, &after)?;
        event.wait_on()?;
        if let Some(buffer) = current {
            mark_done(entry, state, buffer);
        }
        bytes_to_host += entry.object.len_bytes() as u64;
        reads.push(event);
    }

    for event in writes.values() {
        event.wait_on()?;
    }
    for record in &records {
        record.event.wait_on()?;
    }

    let profiler = ProfilerResult {
        total_time_ns: started.elapsed().as_nanos() as u64,
        device_kernel_time_ns: sum_times(records.iter().map(|r| &r.event)),
        device_write_time_ns: sum_times(writes.values()),
        device_read_time_ns: sum_times(&reads),
        bytes_to_device,
        bytes_to_host,
    };

    if let Some(metrics) = device.metrics() {
        metrics.record_execution();
        for record in &records {
            let t = record.event.execution_time();
            if t >= 0 {
                metrics.record_kernel_time(t as u64);
            }
        }
    }

    log::debug!(
        "executed graph {}: {} tasks, {} bytes in, {} bytes out",
        graph.name,
        records.len(),
        bytes_to_device,
        bytes_to_host
    );

    Ok(ExecutionResult {
        tasks: records,
        profiler,
    })
}
