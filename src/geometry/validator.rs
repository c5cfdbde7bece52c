//! Checks a user-supplied local work size against device limits.

use super::WorkGrid;
use crate::backend::DeviceInfo;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GridViolation {
    #[error("local size is 0 in dimension {dim}")]
    ZeroLocal { dim: usize },

    #[error("local size {local} exceeds device limit {max} in dimension {dim}")]
    ExceedsItemLimit { dim: usize, local: u64, max: u64 },

    #[error("work-group of {threads} threads exceeds device limit {max}")]
    ExceedsGroupLimit { threads: u64, max: u64 },

    #[error("local size {local} does not divide global size {global} in dimension {dim}")]
    NotDivisor { dim: usize, global: u64, local: u64 },
}

/// Whether `grid`'s local size can run on `device`. A grid without a local
/// size always passes.
pub fn validate(grid: &WorkGrid, device: &DeviceInfo) -> Result<(), GridViolation> {
    let Some(local) = grid.local_work() else {
        return Ok(());
    };
    let global = grid.global_work();

    for dim in 0..grid.dims() {
        if local[dim] == 0 {
            return Err(GridViolation::ZeroLocal { dim });
        }
        let max = device.max_work_item_sizes[dim];
        if local[dim] > max {
            return Err(GridViolation::ExceedsItemLimit {
                dim,
                local: local[dim],
                max,
            });
        }
    }

    let threads: u64 = local[..grid.dims()].iter().product();
    if threads > device.max_work_group_size {
        return Err(GridViolation::ExceedsGroupLimit {
            threads,
            max: device.max_work_group_size,
        });
    }

    for dim in 0..grid.dims() {
        if global[dim] % local[dim] != 0 {
            return Err(GridViolation::NotDivisor {
                dim,
                global: global[dim],
                local: local[dim],
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;

    fn device() -> DeviceInfo {
        DeviceInfo {
            name: "test".to_string(),
            kind: BackendKind::Host,
            max_work_item_sizes: [256, 256, 64],
            max_work_group_size: 256,
            supports_profiling: false,
            global_memory_bytes: 1 << 20,
        }
    }

    #[test]
    fn test_no_local_passes() {
        assert!(validate(&WorkGrid::d3(7, 7, 7), &device()).is_ok());
    }

    #[test]
    fn test_valid_local() {
        let mut grid = WorkGrid::d2(256, 64);
        grid.set_local_work(16, 16, 1);
        assert!(validate(&grid, &device()).is_ok());
    }

    #[test]
    fn test_violations() {
        let mut grid = WorkGrid::d1(1024);

        grid.set_local_work(0, 1, 1);
        assert_eq!(validate(&grid, &device()), Err(GridViolation::ZeroLocal { dim: 0 }));

        grid.set_local_work(512, 1, 1);
        assert!(matches!(
            validate(&grid, &device()),
            Err(GridViolation::ExceedsItemLimit { dim: 0, .. })
        ));

        let mut grid = WorkGrid::d2(1024, 1024);
        grid.set_local_work(32, 32, 1);
        assert_eq!(
            validate(&grid, &device()),
            Err(GridViolation::ExceedsGroupLimit {
                threads: 1024,
                max: 256
            })
        );

        let mut grid = WorkGrid::d1(1000);
        grid.set_local_work(128, 1, 1);
        assert!(matches!(
            validate(&grid, &device()),
            Err(GridViolation::NotDivisor { dim: 0, .. })
        ));
    }
}
