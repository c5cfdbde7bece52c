use crate::error::{Error, Result};
use std::time::Duration;

/// Which backend the runtime's default device uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPreference {
    Host,

    #[cfg(feature = "gpu")]
    Wgpu,
}

impl Default for BackendPreference {
    fn default() -> Self {
        BackendPreference::Host
    }
}

/// Limits of the CPU reference device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDeviceConfig {
    pub name: String,
    pub max_work_item_sizes: [u64; 3],
    pub max_work_group_size: u64,
    pub supports_profiling: bool,
    pub global_memory_bytes: u64,
}

impl Default for HostDeviceConfig {
    fn default() -> Self {
        Self {
            name: "tessera-host".to_string(),
            max_work_item_sizes: [1024, 1024, 64],
            max_work_group_size: 1024,
            supports_profiling: true,
            global_memory_bytes: 1 << 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub enable_profiling: bool,
    pub event_pool_capacity: usize,
    pub adjust_irregular: bool,
    pub thread_group_granularity: u64,
    pub wait_timeout: Option<Duration>,
    pub print_thread_dims: bool,
    pub backend: BackendPreference,
    pub host_device: HostDeviceConfig,

    #[cfg(feature = "telemetry")]
    pub enable_telemetry: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_profiling: false,
            event_pool_capacity: 1024,
            adjust_irregular: false,
            thread_group_granularity: 32,
            wait_timeout: None,
            print_thread_dims: false,
            backend: BackendPreference::default(),
            host_device: HostDeviceConfig::default(),

            #[cfg(feature = "telemetry")]
            enable_telemetry: true,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Defaults overlaid with `TESSERA_*` environment variables. Values that
    /// fail to parse leave the default in place.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(v) = env_flag("TESSERA_PROFILING") {
            config.enable_profiling = v;
        }
        if let Some(n) = env_parse::<usize>("TESSERA_EVENT_POOL_SIZE") {
            config.event_pool_capacity = n;
        }
        if let Some(v) = env_flag("TESSERA_ADJUST_IRREGULAR") {
            config.adjust_irregular = v;
        }
        if let Some(ms) = env_parse::<u64>("TESSERA_WAIT_TIMEOUT_MS") {
            config.wait_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(v) = env_flag("TESSERA_PRINT_THREADS") {
            config.print_thread_dims = v;
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_pool_capacity == 0 {
            return Err(Error::config("event_pool_capacity must be > 0"));
        }
        if self.event_pool_capacity > 1 << 20 {
            return Err(Error::config("event_pool_capacity too large (max 1048576)"));
        }

        if self.thread_group_granularity == 0 {
            return Err(Error::config("thread_group_granularity must be > 0"));
        }

        if let Some(timeout) = self.wait_timeout {
            if timeout.is_zero() {
                return Err(Error::config("wait_timeout must be > 0 when set"));
            }
        }

        let device = &self.host_device;
        if device.max_work_item_sizes.iter().any(|s| *s == 0) {
            return Err(Error::config("host_device.max_work_item_sizes must be > 0"));
        }
        if device.max_work_group_size == 0 {
            return Err(Error::config("host_device.max_work_group_size must be > 0"));
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn enable_profiling(mut self, enable: bool) -> Self {
        self.config.enable_profiling = enable;
        self
    }

    pub fn event_pool_capacity(mut self, capacity: usize) -> Self {
        self.config.event_pool_capacity = capacity;
        self
    }

    pub fn adjust_irregular(mut self, adjust: bool) -> Self {
        self.config.adjust_irregular = adjust;
        self
    }

    pub fn thread_group_granularity(mut self, granularity: u64) -> Self {
        self.config.thread_group_granularity = granularity;
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.wait_timeout = Some(timeout);
        self
    }

    pub fn print_thread_dims(mut self, print: bool) -> Self {
        self.config.print_thread_dims = print;
        self
    }

    pub fn backend(mut self, backend: BackendPreference) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn host_device(mut self, device: HostDeviceConfig) -> Self {
        self.config.host_device = device;
        self
    }

    #[cfg(feature = "telemetry")]
    pub fn enable_telemetry(mut self, enable: bool) -> Self {
        self.config.enable_telemetry = enable;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
