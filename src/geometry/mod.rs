//! Work geometry: user-facing worker grids and the planner that turns a
//! kernel's domain into device-legal global and local sizes.

pub mod planner;
pub mod validator;

use std::collections::HashMap;

pub use planner::{effective_max_work_item_sizes, group_size, GeometryPlanner};
pub use validator::{validate, GridViolation};

/// Explicit thread geometry for one task.
///
/// Inactive dimensions are fixed to 1. `local_work` of `None` lets the
/// driver choose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkGrid {
    dims: usize,
    global: [u64; 3],
    local: Option<[u64; 3]>,
}

impl WorkGrid {
    pub fn d1(x: u64) -> Self {
        Self {
            dims: 1,
            global: [x, 1, 1],
            local: None,
        }
    }

    pub fn d2(x: u64, y: u64) -> Self {
        Self {
            dims: 2,
            global: [x, y, 1],
            local: None,
        }
    }

    pub fn d3(x: u64, y: u64, z: u64) -> Self {
        Self {
            dims: 3,
            global: [x, y, z],
            local: None,
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn global_work(&self) -> [u64; 3] {
        self.global
    }

    pub fn local_work(&self) -> Option<[u64; 3]> {
        self.local
    }

    pub fn set_global_work(&mut self, x: u64, y: u64, z: u64) -> &mut Self {
        self.global = mask([x, y, z], self.dims);
        self
    }

    pub fn set_local_work(&mut self, x: u64, y: u64, z: u64) -> &mut Self {
        self.local = Some(mask([x, y, z], self.dims));
        self
    }

    pub fn clear_local_work(&mut self) -> &mut Self {
        self.local = None;
        self
    }

    /// Groups per dimension when a local size is set and divides the global one.
    pub fn number_of_workgroups(&self) -> Option<[u64; 3]> {
        let local = self.local?;
        let mut groups = [1u64; 3];
        for d in 0..3 {
            if local[d] == 0 || self.global[d] % local[d] != 0 {
                return None;
            }
            groups[d] = self.global[d] / local[d];
        }
        Some(groups)
    }
}

fn mask(values: [u64; 3], dims: usize) -> [u64; 3] {
    let mut out = [1u64; 3];
    out[..dims].copy_from_slice(&values[..dims]);
    out
}

/// Worker grids keyed by `"<graph>.<task>"`.
#[derive(Debug, Clone, Default)]
pub struct GridScheduler {
    grids: HashMap<String, WorkGrid>,
}

impl GridScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, grid: WorkGrid) -> Self {
        self.add_worker_grid(name, grid);
        self
    }

    pub fn add_worker_grid(&mut self, name: impl Into<String>, grid: WorkGrid) -> &mut Self {
        self.grids.insert(name.into(), grid);
        self
    }

    pub fn get(&self, name: &str) -> Option<&WorkGrid> {
        self.grids.get(name)
    }

    pub fn len(&self) -> usize {
        self.grids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &WorkGrid)> {
        self.grids.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Sizes a launch is dispatched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub dims: usize,
    pub global_work: [u64; 3],
    pub local_work: Option<[u64; 3]>,
}

impl Geometry {
    pub fn dispatch_groups(&self) -> Option<[u64; 3]> {
        let local = self.local_work?;
        Some([
            self.global_work[0] / local[0].max(1),
            self.global_work[1] / local[1].max(1),
            self.global_work[2] / local[2].max(1),
        ])
    }

    pub fn total_threads(&self) -> u64 {
        self.global_work.iter().product()
    }

    /// A single work-item launch.
    pub fn is_serial(&self) -> bool {
        self.total_threads() == 1
    }
}
