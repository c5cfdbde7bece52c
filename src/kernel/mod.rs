//! Compiled kernel handles.
//!
//! The runtime never compiles kernels. It consumes an opaque [`CompiledKernel`]
//! that exposes its dimensionality, per-dimension domain, argument access
//! modes and entry name, plus a [`KernelSource`] the backend turns into a
//! kernel object.

pub mod prebuilt;

use crate::backend::host::{HostInvocation, HostKernelFn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use prebuilt::PrebuiltKernel;

/// How a kernel parameter touches its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn writes(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }

    pub fn reads(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryFormat {
    Spirv,
    OpenCl,
    Ptx,
    Opaque,
}

/// What the backend receives when it creates a kernel object.
#[derive(Clone)]
pub enum KernelSource {
    /// Rust closure executed by the host backend.
    Host(HostKernelFn),
    Wgsl(Arc<str>),
    Binary {
        format: BinaryFormat,
        bytes: Arc<[u8]>,
    },
}

impl fmt::Debug for KernelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelSource::Host(_) => f.write_str("Host(..)"),
            KernelSource::Wgsl(src) => write!(f, "Wgsl({} bytes)", src.len()),
            KernelSource::Binary { format, bytes } => {
                write!(f, "Binary({:?}, {} bytes)", format, bytes.len())
            }
        }
    }
}

/// Opaque compiled kernel consumed by the launch path.
pub trait CompiledKernel: Send + Sync + fmt::Debug {
    fn entry_name(&self) -> &str;

    /// Number of active dimensions, 1 to 3.
    fn dims(&self) -> usize;

    /// Iteration-space size along `dim`. Zero for dimensions the kernel does
    /// not define.
    fn domain_cardinality(&self, dim: usize) -> u64;

    /// One entry per user argument, in parameter order.
    fn argument_access_modes(&self) -> &[Access];

    fn source(&self) -> KernelSource;
}

/// A kernel whose body is a Rust closure, run by the host backend.
pub struct HostKernel {
    entry: String,
    domain: Vec<u64>,
    accesses: Vec<Access>,
    body: HostKernelFn,
}

impl HostKernel {
    pub fn new<F>(entry: impl Into<String>, domain: &[u64], accesses: &[Access], body: F) -> Self
    where
        F: Fn(&mut HostInvocation<'_>) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        Self {
            entry: entry.into(),
            domain: domain.to_vec(),
            accesses: accesses.to_vec(),
            body: Arc::new(body),
        }
    }

    pub fn shared(self) -> Arc<dyn CompiledKernel> {
        Arc::new(self)
    }
}

impl fmt::Debug for HostKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKernel")
            .field("entry", &self.entry)
            .field("domain", &self.domain)
            .field("accesses", &self.accesses)
            .finish()
    }
}

impl CompiledKernel for HostKernel {
    fn entry_name(&self) -> &str {
        &self.entry
    }

    fn dims(&self) -> usize {
        self.domain.len()
    }

    fn domain_cardinality(&self, dim: usize) -> u64 {
        self.domain.get(dim).copied().unwrap_or(0)
    }

    fn argument_access_modes(&self) -> &[Access] {
        &self.accesses
    }

    fn source(&self) -> KernelSource {
        KernelSource::Host(self.body.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_modes() {
        assert!(Access::Write.writes());
        assert!(Access::ReadWrite.writes());
        assert!(!Access::Read.writes());
        assert!(Access::ReadWrite.reads());
    }

    #[test]
    fn test_host_kernel_shape() {
        let k = HostKernel::new("saxpy", &[64, 8], &[Access::Read, Access::Write], |_| Ok(()));
        assert_eq!(k.entry_name(), "saxpy");
        assert_eq!(k.dims(), 2);
        assert_eq!(k.domain_cardinality(1), 8);
        assert_eq!(k.domain_cardinality(2), 0);
        assert_eq!(k.argument_access_modes().len(), 2);
        assert!(matches!(k.source(), KernelSource::Host(_)));
    }
}
