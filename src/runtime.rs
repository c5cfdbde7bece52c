use crate::config::Config;
use crate::device::DeviceHandle;
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Runtime {
    config: Config,
    default_device: Mutex<Option<DeviceHandle>>,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            default_device: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The device used by plans that were never bound, created on first use.
    pub fn default_device(&self) -> Result<DeviceHandle> {
        let mut slot = self.default_device.lock();
        if let Some(device) = slot.as_ref() {
            return Ok(device.clone());
        }
        let device = DeviceHandle::from_config(&self.config)?;
        *slot = Some(device.clone());
        Ok(device)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("default_device", &self.default_device.lock().is_some())
            .finish()
    }
}

// Global runtime for simple API
static GLOBAL_RUNTIME: RwLock<Option<Arc<Runtime>>> = RwLock::new(None);

// Read by every profiling query; independent of the runtime's lifetime
static PROFILING: AtomicBool = AtomicBool::new(false);

pub fn init() -> Result<()> {
    init_with_config(Config::default())
}

pub fn init_with_config(config: Config) -> Result<()> {
    let mut runtime = GLOBAL_RUNTIME.write();

    if runtime.is_some() {
        return Err(Error::AlreadyInitialized);
    }

    let rt = Runtime::new(config)?;
    set_profiling(rt.config.enable_profiling);
    *runtime = Some(Arc::new(rt));

    Ok(())
}

pub fn current() -> Result<Arc<Runtime>> {
    GLOBAL_RUNTIME
        .read()
        .as_ref()
        .cloned()
        .ok_or(Error::NotInitialized)
}

/// The running runtime's configuration, or defaults when none is running.
pub fn current_config() -> Config {
    GLOBAL_RUNTIME
        .read()
        .as_ref()
        .map(|rt| rt.config.clone())
        .unwrap_or_default()
}

/// The runtime's default device.
pub fn default_device() -> Result<DeviceHandle> {
    current()?.default_device()
}

/// Whether event timestamps are read from devices.
pub fn profiling_enabled() -> bool {
    PROFILING.load(Ordering::Relaxed)
}

pub fn set_profiling(enabled: bool) {
    PROFILING.store(enabled, Ordering::Relaxed);
}

pub fn shutdown() {
    let mut runtime = GLOBAL_RUNTIME.write();
    *runtime = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_lifecycle() {
        shutdown();
        assert!(matches!(current(), Err(Error::NotInitialized)));
        assert!(matches!(default_device(), Err(Error::NotInitialized)));

        let config = Config::builder().event_pool_capacity(64).build().unwrap();
        init_with_config(config).unwrap();
        assert!(matches!(init(), Err(Error::AlreadyInitialized)));

        let rt = current().unwrap();
        assert_eq!(rt.config().event_pool_capacity, 64);
        assert_eq!(current_config().event_pool_capacity, 64);

        let a = default_device().unwrap();
        let b = default_device().unwrap();
        assert!(a.same_device(&b));
        assert_eq!(a.event_pool().capacity(), 64);

        shutdown();
        assert_eq!(current_config().event_pool_capacity, 1024);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = Config {
            event_pool_capacity: 0,
            ..Config::default()
        };
        assert!(Runtime::new(config).is_err());
    }
}
