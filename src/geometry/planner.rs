//! Global and local work-size computation.

use super::{validator, Geometry, WorkGrid};
use crate::backend::DeviceInfo;
use crate::config::Config;
use crate::error::{Error, Result};

/// Largest group size `<= effective_max` that divides `global`.
///
/// A maximum equal to the global size is quartered first, so a launch is
/// never a single group covering the whole problem.
pub fn group_size(effective_max: u64, global: u64) -> u64 {
    let max = if effective_max == global {
        effective_max / 4
    } else {
        effective_max
    };

    let mut candidate = max.min(global);
    if candidate == 0 {
        return 1;
    }
    while global % candidate != 0 {
        candidate -= 1;
    }
    candidate
}

/// Per-dimension capacity used when splitting the device limit across
/// several active dimensions.
pub fn effective_max_work_item_sizes(dims: usize, device_max: [u64; 3]) -> [u64; 3] {
    let mut effective = [1u64; 3];
    match dims {
        1 => effective[0] = device_max[0],
        2 | 3 => {
            for d in 0..dims {
                effective[d] = (device_max[d] as f64).sqrt() as u64;
            }
        }
        _ => {}
    }
    effective
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryPlanner {
    adjust_irregular: bool,
    granularity: u64,
}

impl Default for GeometryPlanner {
    fn default() -> Self {
        Self {
            adjust_irregular: false,
            granularity: 32,
        }
    }
}

impl GeometryPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            adjust_irregular: config.adjust_irregular,
            granularity: config.thread_group_granularity.max(1),
        }
    }

    /// Round global sizes up to a multiple of the granularity.
    pub fn with_adjust_irregular(mut self, adjust: bool) -> Self {
        self.adjust_irregular = adjust;
        self
    }

    pub fn with_granularity(mut self, granularity: u64) -> Self {
        self.granularity = granularity.max(1);
        self
    }

    pub fn adjust_irregular(&self) -> bool {
        self.adjust_irregular
    }

    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    fn global_size(&self, value: u64) -> u64 {
        if self.adjust_irregular && value % self.granularity != 0 {
            (value / self.granularity + 1) * self.granularity
        } else {
            value
        }
    }

    /// Geometry for a kernel over `domain`, or `batch` threads per dimension
    /// when `batch > 0`.
    pub fn plan(
        &self,
        dims: usize,
        domain: &[u64],
        batch: u64,
        device_max: [u64; 3],
    ) -> Result<Geometry> {
        if dims == 0 || dims > 3 {
            return Err(Error::config(format!(
                "kernel dimensionality must be 1, 2 or 3 (got {})",
                dims
            )));
        }
        if domain.len() < dims {
            return Err(Error::config(format!(
                "domain has {} dimensions, kernel needs {}",
                domain.len(),
                dims
            )));
        }

        let mut global = [1u64; 3];
        for d in 0..dims {
            let raw = if batch > 0 { batch } else { domain[d] };
            if raw == 0 {
                return Err(Error::config(format!("global work size is 0 in dimension {}", d)));
            }
            global[d] = self.global_size(raw);
        }

        let effective = effective_max_work_item_sizes(dims, device_max);
        let mut local = [1u64; 3];
        for d in 0..dims {
            local[d] = group_size(effective[d], global[d]);
        }

        Ok(Geometry {
            dims,
            global_work: global,
            local_work: Some(local),
        })
    }

    /// Geometry for an explicit worker grid.
    ///
    /// A local size the device cannot run is dropped with a warning, leaving
    /// the choice to the driver. The second value reports that fallback.
    pub fn plan_grid(&self, grid: &WorkGrid, device: &DeviceInfo) -> Result<(Geometry, bool)> {
        let global = grid.global_work();
        if let Some(d) = (0..grid.dims()).find(|d| global[*d] == 0) {
            return Err(Error::config(format!("global work size is 0 in dimension {}", d)));
        }

        let mut geometry = Geometry {
            dims: grid.dims(),
            global_work: global,
            local_work: grid.local_work(),
        };

        let mut fell_back = false;
        if let Some(local) = grid.local_work() {
            if let Err(violation) = validator::validate(grid, device) {
                log::warn!(
                    "local work size {:?} is not valid for global {:?} on {} ({}); \
                     letting the driver choose",
                    local,
                    global,
                    device.name,
                    violation
                );
                geometry.local_work = None;
                fell_back = true;
            }
        }

        Ok((geometry, fell_back))
    }
}
