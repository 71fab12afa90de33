use std::sync::Arc;

use derive_more::Display;
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use super::{
    error::ErrorKind,
    memory::{Access, DataBlock, Handle, HostBuffer, MemoryError},
    num::{DType, Scalar},
    shape::{ShapeError, SlicedTensorShape, TensorShape},
};

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("tensor type error: data type {0} mismatches {1}")]
    Type(DType, DType),
    #[error("descriptor names tensor {found}, expected {expected}")]
    Descriptor { expected: Uuid, found: Uuid },
    #[error("slice parent {found} does not match tensor shape {expected}")]
    ParentShape {
        expected: TensorShape,
        found: TensorShape,
    },
    #[error("data block {block} holds {size} bytes, {required} required")]
    Capacity { block: Uuid, size: u64, required: u64 },
    #[error("{found} elements given, slice holds {expected}")]
    Length { expected: u64, found: u64 },
    #[error("tensor block {0} is write-locked")]
    WriteLocked(Uuid),
    #[error("tensor block {0} is read-locked")]
    ReadLocked(Uuid),
    #[error("tensor block {0} is garbage")]
    Garbage(Uuid),
    #[error("tensor block {0} has never been written")]
    Future(Uuid),
    #[error("no {access} access held on tensor block {block}")]
    NotHeld { block: Uuid, access: Access },
    #[error("data block {0} is not host memory")]
    Storage(Uuid),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

impl TensorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TensorError::Type(_, _)
            | TensorError::Descriptor { .. }
            | TensorError::ParentShape { .. }
            | TensorError::Capacity { .. }
            | TensorError::Length { .. }
            | TensorError::NotHeld { .. }
            | TensorError::Storage(_) => ErrorKind::IllegalArgument,
            TensorError::WriteLocked(_)
            | TensorError::ReadLocked(_)
            | TensorError::Garbage(_)
            | TensorError::Future(_) => ErrorKind::IllegalState,
            TensorError::Memory(err) => err.kind(),
            TensorError::Shape(err) => err.kind(),
        }
    }
}

/// A shaped, typed tensor. Its data lives in one or more [`TensorBlock`]s.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tensor {
    id: Uuid,
    shape: TensorShape,
    dtype: DType,
}

impl Tensor {
    #[inline]
    pub fn new(id: Uuid, shape: TensorShape, dtype: DType) -> Self {
        Self { id, shape, dtype }
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[inline]
    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    #[inline]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of elements.
    #[inline]
    pub fn size(&self) -> u64 {
        self.shape.size()
    }

    /// Number of bytes, or `None` if it does not fit in a `u64`.
    #[inline]
    pub fn memsize(&self) -> Option<u64> {
        self.shape.size().checked_mul(self.dtype.size())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TensorBlockDescriptor {
    pub tensor: Uuid,
    pub id: Uuid,
    pub sliced: SlicedTensorShape,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TensorBlockState {
    /// Nothing has been written yet.
    #[default]
    Future,
    ReadLocked,
    WriteLocked,
    /// Released and readable.
    Freezing,
    /// Terminal.
    Garbage,
}

#[derive(Debug, Default)]
struct AccessState {
    readers: u32,
    writers: u32,
    state: TensorBlockState,
}

/// A data block viewed as one slice of a tensor.
///
/// Holds write access on the data block for its whole lifetime and arbitrates
/// access to it through its own state machine.
#[derive(Debug)]
pub struct TensorBlock {
    tensor: Arc<Tensor>,
    block: Arc<DataBlock>,
    descriptor: TensorBlockDescriptor,
    access: Mutex<AccessState>,
}

impl TensorBlock {
    pub fn new(
        tensor: Arc<Tensor>,
        block: Arc<DataBlock>,
        descriptor: TensorBlockDescriptor,
    ) -> Result<Self, TensorError> {
        if descriptor.tensor != tensor.id() {
            return Err(TensorError::Descriptor {
                expected: tensor.id(),
                found: descriptor.tensor,
            });
        }
        if descriptor.sliced.parent() != tensor.shape() {
            return Err(TensorError::ParentShape {
                expected: tensor.shape().clone(),
                found: descriptor.sliced.parent().clone(),
            });
        }
        let required = tensor
            .dtype()
            .size()
            .checked_mul(descriptor.sliced.size())
            .ok_or(ShapeError::Overflow)?;
        let size = block.size();
        if size < required {
            return Err(TensorError::Capacity {
                block: block.id(),
                size,
                required,
            });
        }

        block.acquire_safe_write_access()?;
        log::debug!(
            "tensor block {} created over data block {}: {}",
            descriptor.id,
            block.id(),
            descriptor.sliced
        );
        let access = Mutex::new(AccessState::default());
        Ok(Self {
            tensor,
            block,
            descriptor,
            access,
        })
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.descriptor.id
    }

    #[inline]
    pub fn tensor(&self) -> &Arc<Tensor> {
        &self.tensor
    }

    #[inline]
    pub fn block(&self) -> &Arc<DataBlock> {
        &self.block
    }

    #[inline]
    pub fn descriptor(&self) -> &TensorBlockDescriptor {
        &self.descriptor
    }

    #[inline]
    pub fn sliced(&self) -> &SlicedTensorShape {
        &self.descriptor.sliced
    }

    #[inline]
    pub fn state(&self) -> TensorBlockState {
        self.access.lock().state
    }

    #[inline]
    pub fn readers(&self) -> u32 {
        self.access.lock().readers
    }

    #[inline]
    pub fn writers(&self) -> u32 {
        self.access.lock().writers
    }

    fn refuse(&self, err: TensorError) -> Result<Handle, TensorError> {
        log::error!("{err}");
        Err(err)
    }

    /// Grants shared access once the block has been written, unless a writer holds it.
    pub fn acquire_read_access(&self) -> Result<Handle, TensorError> {
        let id = self.id();
        let mut access = self.access.lock();
        if access.writers > 0 {
            return self.refuse(TensorError::WriteLocked(id));
        }
        match access.state {
            TensorBlockState::Garbage => return self.refuse(TensorError::Garbage(id)),
            TensorBlockState::Future => return self.refuse(TensorError::Future(id)),
            _ => {}
        }
        let handle = self.block.handle()?;
        access.readers += 1;
        access.state = TensorBlockState::ReadLocked;
        Ok(handle)
    }

    /// Grants exclusive access unless any reader or writer holds the block.
    pub fn acquire_write_access(&self) -> Result<Handle, TensorError> {
        let id = self.id();
        let mut access = self.access.lock();
        if access.readers > 0 {
            return self.refuse(TensorError::ReadLocked(id));
        }
        if access.writers > 0 {
            return self.refuse(TensorError::WriteLocked(id));
        }
        if access.state == TensorBlockState::Garbage {
            return self.refuse(TensorError::Garbage(id));
        }
        let handle = self.block.handle()?;
        access.writers += 1;
        access.state = TensorBlockState::WriteLocked;
        Ok(handle)
    }

    pub fn release_read_access(&self) -> Result<(), TensorError> {
        let mut access = self.access.lock();
        if access.readers == 0 {
            let err = TensorError::NotHeld {
                block: self.id(),
                access: Access::Read,
            };
            log::error!("{err}");
            return Err(err);
        }
        access.readers -= 1;
        if access.readers == 0 {
            access.state = TensorBlockState::Freezing;
        }
        Ok(())
    }

    pub fn release_write_access(&self) -> Result<(), TensorError> {
        let mut access = self.access.lock();
        if access.writers != 1 {
            let err = TensorError::NotHeld {
                block: self.id(),
                access: Access::Write,
            };
            log::error!("{err}");
            return Err(err);
        }
        access.writers -= 1;
        access.state = TensorBlockState::Freezing;
        Ok(())
    }

    /// Retires the block for good. Fails while any access is outstanding.
    pub fn mark_as_garbage(&self) -> Result<(), TensorError> {
        let id = self.id();
        let mut access = self.access.lock();
        let err = match (access.readers, access.writers) {
            (0, 0) => {
                access.state = TensorBlockState::Garbage;
                log::debug!("tensor block {id} marked as garbage");
                return Ok(());
            }
            (_, 0) => TensorError::ReadLocked(id),
            _ => TensorError::WriteLocked(id),
        };
        log::error!("{err}");
        Err(err)
    }

    fn check_type<T: Scalar>(&self) -> Result<(), TensorError> {
        match self.tensor.dtype() {
            dtype if dtype == T::DTYPE => Ok(()),
            dtype => Err(TensorError::Type(T::DTYPE, dtype)),
        }
    }

    /// Copies the packed elements of the slice out of host memory.
    pub fn read_elements<T: Scalar>(&self) -> Result<Vec<T>, TensorError> {
        self.check_type::<T>()?;
        let handle = self.acquire_read_access()?;
        let count = self.sliced().size();
        let elements = handle
            .downcast_ref::<HostBuffer>()
            .ok_or(TensorError::Storage(self.block.id()))
            .and_then(|buffer| {
                usize::try_from(count)
                    .ok()
                    .and_then(|count| buffer.read_pod(0, count))
                    .ok_or(TensorError::Capacity {
                        block: self.block.id(),
                        size: buffer.len() as u64,
                        required: count.saturating_mul(T::DTYPE.size()),
                    })
            });
        self.release_read_access()?;
        elements
    }

    /// Writes the packed elements of the slice into host memory.
    pub fn write_elements<T: Scalar>(&self, values: &[T]) -> Result<(), TensorError> {
        self.check_type::<T>()?;
        let expected = self.sliced().size();
        if values.len() as u64 != expected {
            return Err(TensorError::Length {
                expected,
                found: values.len() as u64,
            });
        }
        let handle = self.acquire_write_access()?;
        let result = handle
            .downcast_ref::<HostBuffer>()
            .ok_or(TensorError::Storage(self.block.id()))
            .and_then(|buffer| {
                buffer.write_pod(0, values).ok_or(TensorError::Capacity {
                    block: self.block.id(),
                    size: buffer.len() as u64,
                    required: expected.saturating_mul(T::DTYPE.size()),
                })
            });
        self.release_write_access()?;
        result
    }
}

impl Drop for TensorBlock {
    fn drop(&mut self) {
        log::debug!("tensor block {} destroyed", self.descriptor.id);
        if let Err(err) = self.block.release_write_access() {
            log::error!("tensor block {}: {err}", self.descriptor.id);
        }
    }
}
