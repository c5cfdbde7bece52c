//! Host-resident buffers and kernel arguments.
//!
//! A [`HostBuffer`] is the unit of data movement: transfers and dependency
//! tracking key on its [`ObjectId`], never on its contents. Clones share the
//! same storage and the same identity.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a host object referenced by tasks and transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    fn next() -> Self {
        ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Element type of a buffer, used to describe transfer events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
}

impl ElementKind {
    pub fn size(&self) -> usize {
        match self {
            ElementKind::Byte => 1,
            ElementKind::Short => 2,
            ElementKind::Int | ElementKind::Float => 4,
            ElementKind::Long | ElementKind::Double => 8,
        }
    }

    pub fn array_name(&self) -> &'static str {
        match self {
            ElementKind::Byte => "byte[]",
            ElementKind::Short => "short[]",
            ElementKind::Int => "int[]",
            ElementKind::Long => "long[]",
            ElementKind::Float => "float[]",
            ElementKind::Double => "double[]",
        }
    }
}

/// Plain-old-data element that can live in a [`HostBuffer`].
pub trait Element: bytemuck::Pod {
    const KIND: ElementKind;
}

macro_rules! impl_element {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(impl Element for $ty {
            const KIND: ElementKind = ElementKind::$kind;
        })*
    };
}

impl_element! {
    u8 => Byte,
    i8 => Byte,
    i16 => Short,
    u16 => Short,
    i32 => Int,
    u32 => Int,
    i64 => Long,
    u64 => Long,
    f32 => Float,
    f64 => Double,
}

/// Shared, identity-carrying host buffer.
#[derive(Clone)]
pub struct HostBuffer {
    id: ObjectId,
    kind: ElementKind,
    data: Arc<RwLock<Vec<u8>>>,
}

impl HostBuffer {
    pub fn from_slice<T: Element>(values: &[T]) -> Self {
        Self::from_bytes(T::KIND, bytemuck::cast_slice(values).to_vec())
    }

    pub fn zeroed<T: Element>(len: usize) -> Self {
        Self::from_bytes(T::KIND, vec![0u8; len * std::mem::size_of::<T>()])
    }

    pub fn from_bytes(kind: ElementKind, bytes: Vec<u8>) -> Self {
        Self {
            id: ObjectId::next(),
            kind,
            data: Arc::new(RwLock::new(bytes)),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn element_kind(&self) -> ElementKind {
        self.kind
    }

    pub fn len_bytes(&self) -> usize {
        self.data.read().len()
    }

    /// Number of elements of the buffer's element kind.
    pub fn len(&self) -> usize {
        self.len_bytes() / self.kind.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len_bytes() == 0
    }

    /// Copy the contents out as `T`. Trailing bytes that do not form a whole
    /// element are ignored.
    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        self.data
            .read()
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    /// Replace the contents with `values`.
    pub fn write<T: Element>(&self, values: &[T]) {
        let mut data = self.data.write();
        data.clear();
        data.extend_from_slice(bytemuck::cast_slice(values));
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.read())
    }

    pub(crate) fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.write())
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("len_bytes", &self.len_bytes())
            .finish()
    }
}

/// Scalar kernel argument, passed by value through the task frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    I32(i32),
    I64(i64),
    U32(u32),
    F32(f32),
    F64(f64),
}

impl Scalar {
    /// Raw 64-bit frame slot encoding.
    pub fn to_bits(&self) -> u64 {
        match *self {
            Scalar::I32(v) => v as u32 as u64,
            Scalar::I64(v) => v as u64,
            Scalar::U32(v) => v as u64,
            Scalar::F32(v) => v.to_bits() as u64,
            Scalar::F64(v) => v.to_bits(),
        }
    }

    /// Little-endian bytes at the scalar's natural width.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match *self {
            Scalar::I32(v) => v.to_le_bytes().to_vec(),
            Scalar::I64(v) => v.to_le_bytes().to_vec(),
            Scalar::U32(v) => v.to_le_bytes().to_vec(),
            Scalar::F32(v) => v.to_le_bytes().to_vec(),
            Scalar::F64(v) => v.to_le_bytes().to_vec(),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Scalar::I32(v) => v as f64,
            Scalar::I64(v) => v as f64,
            Scalar::U32(v) => v as f64,
            Scalar::F32(v) => v as f64,
            Scalar::F64(v) => v,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match *self {
            Scalar::I32(v) => v as i64,
            Scalar::I64(v) => v,
            Scalar::U32(v) => v as i64,
            Scalar::F32(v) => v as i64,
            Scalar::F64(v) => v as i64,
        }
    }
}

macro_rules! impl_scalar_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Scalar {
            fn from(v: $ty) -> Self {
                Scalar::$variant(v)
            }
        })*
    };
}

impl_scalar_from! {
    i32 => I32,
    i64 => I64,
    u32 => U32,
    f32 => F32,
    f64 => F64,
}

/// Argument bound to a task, in kernel parameter order.
#[derive(Debug, Clone)]
pub enum KernelArg {
    Buffer(HostBuffer),
    Scalar(Scalar),
}

impl KernelArg {
    pub fn buffer(&self) -> Option<&HostBuffer> {
        match self {
            KernelArg::Buffer(buf) => Some(buf),
            KernelArg::Scalar(_) => None,
        }
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        self.buffer().map(HostBuffer::id)
    }
}

impl From<&HostBuffer> for KernelArg {
    fn from(buf: &HostBuffer) -> Self {
        KernelArg::Buffer(buf.clone())
    }
}

impl From<HostBuffer> for KernelArg {
    fn from(buf: HostBuffer) -> Self {
        KernelArg::Buffer(buf)
    }
}

impl From<Scalar> for KernelArg {
    fn from(s: Scalar) -> Self {
        KernelArg::Scalar(s)
    }
}
