//! Declarative task graphs.
//!
//! A [`TaskGraph`] is an ordered list of kernel launches over host buffers plus
//! the data transfers that move those buffers to and from the device. It stays
//! mutable until [`TaskGraph::snapshot`], which validates it and freezes a copy
//! into an [`ExecutionPlan`].

pub mod executor;
pub mod plan;

use crate::error::{Error, Result};
use crate::geometry::WorkGrid;
use crate::kernel::{Access, CompiledKernel, PrebuiltKernel};
use crate::memory::{HostBuffer, KernelArg, ObjectId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub use executor::{ExecutionResult, ProfilerResult, TaskRecord};
pub use plan::ExecutionPlan;

/// When a declared transfer actually runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferMode {
    /// Once per plan and device pairing.
    FirstExecution,
    /// On every `execute()`.
    EveryExecution,
    /// Only through the plan's explicit transfer calls.
    UserDefined,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferMode::FirstExecution => "FIRST_EXECUTION",
            TransferMode::EveryExecution => "EVERY_EXECUTION",
            TransferMode::UserDefined => "USER_DEFINED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferDirection {
    ToDevice,
    ToHost,
}

#[derive(Debug, Clone)]
pub struct DataTransfer {
    pub object: HostBuffer,
    pub mode: TransferMode,
    pub direction: TransferDirection,
}

/// One kernel launch in a graph.
#[derive(Clone)]
pub struct TaskNode {
    pub(crate) id: String,
    pub(crate) kernel: Arc<dyn CompiledKernel>,
    pub(crate) args: Vec<KernelArg>,
    pub(crate) grid: Option<WorkGrid>,
}

impl TaskNode {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kernel(&self) -> &Arc<dyn CompiledKernel> {
        &self.kernel
    }

    pub fn args(&self) -> &[KernelArg] {
        &self.args
    }

    pub fn grid(&self) -> Option<&WorkGrid> {
        self.grid.as_ref()
    }

    /// Buffers referenced by this task, in argument order.
    pub fn objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.args.iter().filter_map(KernelArg::object_id)
    }

    pub fn references(&self, object: ObjectId) -> bool {
        self.objects().any(|o| o == object)
    }

    /// Whether any parameter bound to `object` is written.
    pub fn writes(&self, object: ObjectId) -> bool {
        self.args
            .iter()
            .zip(self.kernel.argument_access_modes())
            .any(|(arg, access)| arg.object_id() == Some(object) && access.writes())
    }

    pub fn shares_object_with(&self, other: &TaskNode) -> bool {
        self.objects().any(|o| other.references(o))
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("entry", &self.kernel.entry_name())
            .field("args", &self.args.len())
            .field("grid", &self.grid)
            .finish()
    }
}

/// Immutable copy of a graph held by execution plans.
#[derive(Debug, Clone)]
pub(crate) struct FrozenGraph {
    pub(crate) name: String,
    pub(crate) tasks: Vec<TaskNode>,
    pub(crate) transfers: Vec<DataTransfer>,
}

impl FrozenGraph {
    pub(crate) fn task(&self, id: &str) -> Option<&TaskNode> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub(crate) fn references(&self, object: ObjectId) -> bool {
        self.tasks.iter().any(|t| t.references(object))
            || self.transfers.iter().any(|t| t.object.id() == object)
    }

    /// Every distinct buffer the graph touches.
    pub(crate) fn buffers(&self) -> Vec<HostBuffer> {
        let mut seen = HashSet::new();
        let from_tasks = self
            .tasks
            .iter()
            .flat_map(|t| t.args.iter().filter_map(KernelArg::buffer));
        let from_transfers = self.transfers.iter().map(|t| &t.object);
        from_tasks
            .chain(from_transfers)
            .filter(|b| seen.insert(b.id()))
            .cloned()
            .collect()
    }
}

pub fn create_graph(name: impl Into<String>) -> TaskGraph {
    TaskGraph::new(name)
}

#[derive(Debug, Clone)]
pub struct TaskGraph {
    name: String,
    tasks: Vec<TaskNode>,
    transfers: Vec<DataTransfer>,
}

impl TaskGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
            transfers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tasks(&self) -> &[TaskNode] {
        &self.tasks
    }

    pub fn transfers(&self) -> &[DataTransfer] {
        &self.transfers
    }

    /// Append a task. Ids must be unique and `args` must match the kernel's
    /// parameter list.
    pub fn task(
        &mut self,
        id: impl Into<String>,
        kernel: Arc<dyn CompiledKernel>,
        args: Vec<KernelArg>,
    ) -> Result<&mut Self> {
        self.push_task(id.into(), kernel, args, None)
    }

    /// Append a task that runs over an explicit worker grid.
    pub fn task_with_grid(
        &mut self,
        id: impl Into<String>,
        kernel: Arc<dyn CompiledKernel>,
        args: Vec<KernelArg>,
        grid: WorkGrid,
    ) -> Result<&mut Self> {
        self.push_task(id.into(), kernel, args, Some(grid))
    }

    /// Append a task whose kernel is loaded from `path`.
    pub fn prebuilt_task(
        &mut self,
        id: impl Into<String>,
        entry: impl Into<String>,
        path: impl AsRef<Path>,
        args: Vec<KernelArg>,
        accesses: &[Access],
        dimensions: &[u64],
    ) -> Result<&mut Self> {
        let kernel = PrebuiltKernel::from_file(entry, path, accesses, dimensions)?;
        self.push_task(id.into(), Arc::new(kernel), args, None)
    }

    fn push_task(
        &mut self,
        id: String,
        kernel: Arc<dyn CompiledKernel>,
        args: Vec<KernelArg>,
        grid: Option<WorkGrid>,
    ) -> Result<&mut Self> {
        if self.tasks.iter().any(|t| t.id == id) {
            return Err(Error::config(format!(
                "duplicate task id '{}' in graph '{}'",
                id, self.name
            )));
        }
        let dims = kernel.dims();
        if dims == 0 || dims > 3 {
            return Err(Error::config(format!(
                "task '{}': kernel '{}' has {} dimensions, expected 1 to 3",
                id,
                kernel.entry_name(),
                dims
            )));
        }
        let expected = kernel.argument_access_modes().len();
        if args.len() != expected {
            return Err(Error::config(format!(
                "task '{}': kernel '{}' takes {} arguments, {} given",
                id,
                kernel.entry_name(),
                expected,
                args.len()
            )));
        }
        if let Some(grid) = &grid {
            if grid.dims() != dims {
                return Err(Error::config(format!(
                    "task '{}': worker grid has {} dimensions, kernel has {}",
                    id,
                    grid.dims(),
                    dims
                )));
            }
        }

        self.tasks.push(TaskNode {
            id,
            kernel,
            args,
            grid,
        });
        Ok(self)
    }

    pub fn transfer_to_device(&mut self, mode: TransferMode, objects: &[&HostBuffer]) -> &mut Self {
        self.add_transfers(mode, TransferDirection::ToDevice, objects)
    }

    pub fn transfer_to_host(&mut self, mode: TransferMode, objects: &[&HostBuffer]) -> &mut Self {
        self.add_transfers(mode, TransferDirection::ToHost, objects)
    }

    // a later entry for the same object and direction replaces the earlier one
    fn add_transfers(
        &mut self,
        mode: TransferMode,
        direction: TransferDirection,
        objects: &[&HostBuffer],
    ) -> &mut Self {
        for object in objects {
            self.transfers
                .retain(|t| !(t.direction == direction && t.object.id() == object.id()));
            self.transfers.push(DataTransfer {
                object: (*object).clone(),
                mode,
                direction,
            });
        }
        self
    }

    fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(Error::config(format!("graph '{}' has no tasks", self.name)));
        }

        for task in &self.tasks {
            for object in task.objects() {
                if !self.transfers.iter().any(|t| t.object.id() == object) {
                    return Err(Error::config(format!(
                        "task '{}' uses {} but no transfer declares it",
                        task.id, object
                    )));
                }
            }
        }

        for transfer in &self.transfers {
            let object = transfer.object.id();
            if !self.tasks.iter().any(|t| t.references(object)) {
                return Err(Error::config(format!(
                    "{} is transferred {:?} but no task uses it",
                    object, transfer.direction
                )));
            }
        }

        Ok(())
    }

    /// Validate and freeze the graph. Later edits do not affect the plan.
    pub fn snapshot(&self) -> Result<ExecutionPlan> {
        self.validate()?;
        let frozen = FrozenGraph {
            name: self.name.clone(),
            tasks: self.tasks.clone(),
            transfers: self.transfers.clone(),
        };
        Ok(ExecutionPlan::new(Arc::new(frozen)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::HostKernel;
    use crate::memory::Scalar;

    fn copy_kernel() -> Arc<dyn CompiledKernel> {
        HostKernel::new("copy", &[4], &[Access::Read, Access::Write], |inv| {
            let src: Vec<f32> = inv.read(0)?;
            inv.write(1, &src)
        })
        .shared()
    }

    #[test]
    fn test_transfer_mode_names() {
        assert_eq!(TransferMode::FirstExecution.to_string(), "FIRST_EXECUTION");
        assert_eq!(TransferMode::UserDefined.to_string(), "USER_DEFINED");
    }

    #[cfg(feature = "telemetry")]
    #[test]
    fn test_transfer_mode_serde() {
        let json = serde_json::to_string(&TransferMode::EveryExecution).unwrap();
        assert_eq!(json, "\"EVERY_EXECUTION\"");
        let mode: TransferMode = serde_json::from_str("\"FIRST_EXECUTION\"").unwrap();
        assert_eq!(mode, TransferMode::FirstExecution);
    }

    #[test]
    fn test_duplicate_task_id() {
        let a = HostBuffer::zeroed::<f32>(4);
        let b = HostBuffer::zeroed::<f32>(4);
        let mut graph = create_graph("g");
        graph.task("t0", copy_kernel(), vec![(&a).into(), (&b).into()]).unwrap();
        let err = graph
            .task("t0", copy_kernel(), vec![(&a).into(), (&b).into()])
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(graph.tasks().len(), 1);
    }

    #[test]
    fn test_argument_count_checked() {
        let a = HostBuffer::zeroed::<f32>(4);
        let mut graph = create_graph("g");
        let err = graph.task("t0", copy_kernel(), vec![(&a).into()]).unwrap_err();
        assert!(err.to_string().contains("takes 2 arguments, 1 given"));
    }

    #[test]
    fn test_grid_dims_must_match() {
        let a = HostBuffer::zeroed::<f32>(4);
        let b = HostBuffer::zeroed::<f32>(4);
        let mut graph = create_graph("g");
        assert!(graph
            .task_with_grid("t0", copy_kernel(), vec![(&a).into(), (&b).into()], WorkGrid::d2(2, 2))
            .is_err());
    }

    #[test]
    fn test_later_transfer_replaces_earlier() {
        let a = HostBuffer::zeroed::<f32>(4);
        let mut graph = create_graph("g");
        graph
            .transfer_to_device(TransferMode::FirstExecution, &[&a])
            .transfer_to_device(TransferMode::EveryExecution, &[&a])
            .transfer_to_host(TransferMode::EveryExecution, &[&a]);
        assert_eq!(graph.transfers().len(), 2);
        assert_eq!(graph.transfers()[0].direction, TransferDirection::ToDevice);
        assert_eq!(graph.transfers()[0].mode, TransferMode::EveryExecution);
    }

    #[test]
    fn test_snapshot_validation() {
        let a = HostBuffer::zeroed::<f32>(4);
        let b = HostBuffer::zeroed::<f32>(4);
        let stray = HostBuffer::zeroed::<f32>(4);

        assert!(create_graph("empty").snapshot().is_err());

        let mut graph = create_graph("g");
        graph.task("t0", copy_kernel(), vec![(&a).into(), (&b).into()]).unwrap();
        graph.transfer_to_device(TransferMode::EveryExecution, &[&a]);
        // b has no transfer entry
        assert!(graph.snapshot().is_err());

        graph.transfer_to_host(TransferMode::EveryExecution, &[&b]);
        assert!(graph.snapshot().is_ok());

        graph.transfer_to_device(TransferMode::EveryExecution, &[&stray]);
        let err = graph.snapshot().unwrap_err();
        assert!(err.to_string().contains("no task uses it"));
    }

    #[test]
    fn test_access_queries() {
        let a = HostBuffer::zeroed::<f32>(4);
        let b = HostBuffer::zeroed::<f32>(4);
        let mut graph = create_graph("g");
        graph
            .task("t0", copy_kernel(), vec![(&a).into(), (&b).into()])
            .unwrap();
        let scale = HostKernel::new("scale", &[4], &[Access::ReadWrite, Access::Read], |_| Ok(()))
            .shared();
        graph
            .task("t1", scale, vec![(&b).into(), Scalar::F32(2.0).into()])
            .unwrap();

        let tasks = graph.tasks();
        assert!(!tasks[0].writes(a.id()));
        assert!(tasks[0].writes(b.id()));
        assert!(tasks[1].writes(b.id()));
        assert!(tasks[0].shares_object_with(&tasks[1]));
        assert_eq!(tasks[1].objects().count(), 1);
    }

    #[test]
    fn test_snapshot_is_isolated() {
        let a = HostBuffer::zeroed::<f32>(4);
        let b = HostBuffer::zeroed::<f32>(4);
        let mut graph = create_graph("g");
        graph.task("t0", copy_kernel(), vec![(&a).into(), (&b).into()]).unwrap();
        graph.transfer_to_device(TransferMode::EveryExecution, &[&a]);
        graph.transfer_to_host(TransferMode::EveryExecution, &[&b]);
        let plan = graph.snapshot().unwrap();

        graph.task("t1", copy_kernel(), vec![(&b).into(), (&a).into()]).unwrap();
        assert_eq!(plan.task_ids().count(), 1);
        assert_eq!(plan.graph_name(), "g");
    }
}
