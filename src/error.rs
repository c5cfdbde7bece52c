use crate::backend::NativeError;
use crate::event::EventDescriptor;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid graph, geometry or runtime configuration. Never silently corrected.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to bind kernel argument {index}: {call} returned {code}")]
    ArgumentBinding {
        index: u32,
        call: &'static str,
        code: i32,
    },

    #[error("kernel launch failed: {call} returned {code}")]
    Launch { call: &'static str, code: i32 },

    #[error("data transfer failed: {call} returned {code}")]
    Transfer { call: &'static str, code: i32 },

    #[error("device call failed: {call} returned {code}")]
    Device { call: &'static str, code: i32 },

    #[error("error on event: {descriptor}: {tag:#x} (native status {status})")]
    EventStatus {
        descriptor: EventDescriptor,
        tag: u64,
        status: i32,
    },

    #[error("event pool exhausted (capacity {capacity})")]
    EventPoolExhausted { capacity: usize },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("runtime not initialized")]
    NotInitialized,

    #[error("already initialized")]
    AlreadyInitialized,

    #[cfg(feature = "gpu")]
    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Error::InvalidState(msg.into())
    }

    pub fn binding(index: u32, err: NativeError) -> Self {
        Error::ArgumentBinding {
            index,
            call: err.call,
            code: err.code,
        }
    }

    pub fn launch(err: NativeError) -> Self {
        Error::Launch {
            call: err.call,
            code: err.code,
        }
    }

    pub fn transfer(err: NativeError) -> Self {
        Error::Transfer {
            call: err.call,
            code: err.code,
        }
    }

    #[cfg(feature = "gpu")]
    pub fn gpu<S: Into<String>>(msg: S) -> Self {
        Error::Gpu(msg.into())
    }

    #[cfg(feature = "telemetry")]
    pub fn telemetry<S: Into<String>>(msg: S) -> Self {
        Error::Other(format!("telemetry: {}", msg.into()))
    }

    /// Native call name and code, for errors that wrap a driver failure.
    pub fn native_code(&self) -> Option<(&'static str, i32)> {
        match self {
            Error::ArgumentBinding { call, code, .. }
            | Error::Launch { call, code }
            | Error::Transfer { call, code }
            | Error::Device { call, code } => Some((call, *code)),
            _ => None,
        }
    }
}

impl From<NativeError> for Error {
    fn from(err: NativeError) -> Self {
        Error::Device {
            call: err.call,
            code: err.code,
        }
    }
}
