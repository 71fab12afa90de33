use std::{any::Any, fmt::Debug, sync::Arc};

use derive_more::{BitAnd, BitOr, Display, From, Into};
use thiserror::Error;
use uuid::Uuid;

use super::{context::Context, error::ErrorKind};

pub use allocator::{Allocator, DataBlock, DataBlockDescriptor};
pub use heap::{Heap, HeapFlow, HostBuffer};

pub mod allocator;
pub mod heap;

pub const KB: u64 = 1_000;
pub const MB: u64 = 1_000_000;
pub const GB: u64 = 1_000_000_000;

/// A byte count, displayed in decimal units.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
pub struct DataSize(pub u64);

impl std::fmt::Display for DataSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let size = self.0;
        let (unit, name) = match size {
            size if size >= GB => (GB, "GB"),
            size if size >= MB => (MB, "MB"),
            size if size >= KB => (KB, "KB"),
            size => return write!(f, "{size} B"),
        };
        write!(f, "{:.1} {name}", size as f64 / unit as f64)
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("not enough memory in {memory}: {requested} requested, {available} available")]
    Budget {
        memory: String,
        requested: DataSize,
        available: DataSize,
    },
    #[error("too many allocations in {memory}: at most {max} live blocks")]
    AllocationCount { memory: String, max: u64 },
    #[error("data block {0} is weak")]
    Weak(Uuid),
    #[error("data block {0} is already freed")]
    DoubleFree(Uuid),
    #[error("data block {block} was not allocated by {memory}")]
    ForeignBlock { block: Uuid, memory: String },
    #[error("backend of {memory} failed to release data block {block}")]
    Release { block: Uuid, memory: String },
    #[error("{access} access to data block {block} refused")]
    AccessRefused { block: Uuid, access: Access },
    #[error("no {access} access held on data block {block}")]
    NotHeld { block: Uuid, access: Access },
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoryError::Budget { .. } | MemoryError::AllocationCount { .. } => {
                ErrorKind::NotEnoughMemory
            }
            MemoryError::Weak(_) => ErrorKind::NullPointer,
            MemoryError::DoubleFree(_) | MemoryError::ForeignBlock { .. } => {
                ErrorKind::IllegalArgument
            }
            MemoryError::Release { .. } => ErrorKind::Unknown,
            MemoryError::AccessRefused { .. } => ErrorKind::IllegalState,
            MemoryError::NotHeld { .. } => ErrorKind::IllegalArgument,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemoryKind {
    #[display("host-heap")]
    HostHeap,
    #[display("device-shared")]
    DeviceShared,
    #[display("device-only")]
    DeviceOnly,
    #[display("swap")]
    Swap,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, BitAnd, BitOr, From, Into)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Capabilities(pub u8);

impl Capabilities {
    pub const ASYNC_IO: Self = Self(1 << 0);
    pub const KEEP_ALLOCATION_VIEW: Self = Self(1 << 1);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Static description of a memory pool.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryDescriptor {
    pub id: Uuid,
    pub kind: MemoryKind,
    pub capabilities: Capabilities,
    /// Byte alignment of allocations, `0` for none.
    pub alignment: u8,
    /// Budget in bytes.
    pub max_usage: u64,
    /// Maximum number of live blocks.
    pub max_allocation_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Access {
    #[display("read")]
    Read,
    #[display("write")]
    Write,
}

/// Opaque backend allocation. Cheap to clone; only the backend knows its concrete type.
#[derive(Clone)]
pub struct Handle(Arc<dyn Any + Send + Sync>);

impl Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({:p})", Arc::as_ptr(&self.0))
    }
}

impl Handle {
    #[inline]
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    #[inline]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.0).downcast_ref::<T>()
    }

    /// Returns a shared reference-counted view of the concrete allocation.
    #[inline]
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.0.clone().downcast::<T>().ok()
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Pool-specific reservation, implemented once per kind of memory.
pub trait MemoryBackend: Send + Sync + Debug {
    /// Reserves `size` bytes. Returns `None` if the underlying reservation fails.
    fn allocate(&self, size: u64, descriptor: &MemoryDescriptor) -> Option<Handle>;
    /// Gives back a reservation. Returns `false` on failure.
    fn release(&self, handle: &Handle) -> bool;
}

/// A named memory pool bound to exactly one [`Allocator`].
#[derive(Debug)]
pub struct Memory {
    name: String,
    allocator: Arc<Allocator>,
}

impl Memory {
    /// Creates the pool and registers it in `context`. The descriptor's id is drawn from the context.
    pub fn new(
        context: &Context,
        name: impl Into<String>,
        descriptor: MemoryDescriptor,
        backend: impl MemoryBackend + 'static,
    ) -> Arc<Self> {
        let name = name.into();
        let descriptor = MemoryDescriptor {
            id: context.generate_uuid(),
            ..descriptor
        };
        log::debug!(
            "memory {name} ({}, {}) created with budget {}",
            descriptor.id,
            descriptor.kind,
            DataSize(descriptor.max_usage)
        );
        let allocator = Arc::new(Allocator::new(name.clone(), descriptor, Box::new(backend)));
        let memory = Arc::new(Self { name, allocator });
        context.register_memory(memory.clone());
        memory
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.allocator.id()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn descriptor(&self) -> &MemoryDescriptor {
        self.allocator.descriptor()
    }

    #[inline]
    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }
}
