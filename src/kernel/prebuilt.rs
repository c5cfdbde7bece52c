//! Kernels loaded from a binary or source file instead of a closure.

use super::{Access, BinaryFormat, CompiledKernel, KernelSource};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Clone)]
pub struct PrebuiltKernel {
    entry: String,
    path: Option<PathBuf>,
    domain: Vec<u64>,
    accesses: Vec<Access>,
    source: KernelSource,
}

impl PrebuiltKernel {
    /// Load a kernel file. The format follows the extension: `.wgsl`, `.spv`,
    /// `.cl` and `.ptx`; anything else is passed through as opaque bytes.
    pub fn from_file(
        entry: impl Into<String>,
        path: impl AsRef<Path>,
        accesses: &[Access],
        domain: &[u64],
    ) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        if bytes.is_empty() {
            return Err(Error::config(format!(
                "prebuilt kernel file {} is empty",
                path.display()
            )));
        }

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        let source = match extension.as_deref() {
            Some("wgsl") => {
                let text = String::from_utf8(bytes).map_err(|_| {
                    Error::config(format!("{} is not valid UTF-8", path.display()))
                })?;
                KernelSource::Wgsl(text.into())
            }
            Some("spv") => {
                if !has_spirv_magic(&bytes) {
                    return Err(Error::config(format!(
                        "{} is not a SPIR-V module",
                        path.display()
                    )));
                }
                binary(BinaryFormat::Spirv, bytes)
            }
            Some("cl") => binary(BinaryFormat::OpenCl, bytes),
            Some("ptx") => binary(BinaryFormat::Ptx, bytes),
            _ => binary(BinaryFormat::Opaque, bytes),
        };

        Ok(Self {
            entry: entry.into(),
            path: Some(path.to_path_buf()),
            domain: domain.to_vec(),
            accesses: accesses.to_vec(),
            source,
        })
    }

    pub fn wgsl(
        entry: impl Into<String>,
        source: impl Into<String>,
        accesses: &[Access],
        domain: &[u64],
    ) -> Self {
        Self {
            entry: entry.into(),
            path: None,
            domain: domain.to_vec(),
            accesses: accesses.to_vec(),
            source: KernelSource::Wgsl(source.into().into()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn format(&self) -> Option<BinaryFormat> {
        match &self.source {
            KernelSource::Binary { format, .. } => Some(*format),
            _ => None,
        }
    }
}

fn binary(format: BinaryFormat, bytes: Vec<u8>) -> KernelSource {
    KernelSource::Binary {
        format,
        bytes: bytes.into(),
    }
}

fn has_spirv_magic(bytes: &[u8]) -> bool {
    bytes.len() >= 4
        && (u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == SPIRV_MAGIC
            || u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == SPIRV_MAGIC)
}

impl CompiledKernel for PrebuiltKernel {
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
        self.source.clone()
    }
}
