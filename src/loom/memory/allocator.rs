use std::{fmt::Debug, sync::Arc};

use parking_lot::Mutex;
use uuid::Uuid;

use super::{Access, DataSize, Handle, MemoryBackend, MemoryDescriptor, MemoryError};

#[derive(Debug, Default)]
struct Usage {
    current: u64,
    cumulated: u64,
    count: u64,
}

/// Budgeted allocator of a memory pool.
///
/// `alloc` and `free` are serialized by one lock; access acquisition on blocks never takes it.
#[derive(Debug)]
pub struct Allocator {
    name: String,
    descriptor: MemoryDescriptor,
    backend: Box<dyn MemoryBackend>,
    usage: Mutex<Usage>,
}

impl Allocator {
    pub fn new(
        name: impl Into<String>,
        descriptor: MemoryDescriptor,
        backend: Box<dyn MemoryBackend>,
    ) -> Self {
        let name = name.into();
        let usage = Mutex::new(Usage::default());
        Self {
            name,
            descriptor,
            backend,
            usage,
        }
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.descriptor.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn descriptor(&self) -> &MemoryDescriptor {
        &self.descriptor
    }

    #[inline]
    pub fn max_usage(&self) -> u64 {
        self.descriptor.max_usage
    }

    /// Sum of the sizes of all live blocks.
    #[inline]
    pub fn current_usage(&self) -> u64 {
        self.usage.lock().current
    }

    /// Sum of the sizes of all blocks ever allocated.
    #[inline]
    pub fn cumulated_usage(&self) -> u64 {
        self.usage.lock().cumulated
    }

    /// Number of live blocks.
    #[inline]
    pub fn allocation_count(&self) -> u64 {
        self.usage.lock().count
    }

    /// Allocates a block of `size` bytes.
    ///
    /// Fails if the budget or the allocation count would be exceeded. Returns `Ok(None)`
    /// if the backend itself cannot reserve the memory.
    pub fn alloc(self: &Arc<Self>, size: u64) -> Result<Option<Arc<DataBlock>>, MemoryError> {
        let mut usage = self.usage.lock();

        let max = self.descriptor.max_usage;
        if usage.current.checked_add(size).is_none_or(|total| total > max) {
            let err = MemoryError::Budget {
                memory: self.name.clone(),
                requested: DataSize(size),
                available: DataSize(max.saturating_sub(usage.current)),
            };
            log::error!("{err}");
            return Err(err);
        }
        let max = self.descriptor.max_allocation_count;
        if usage.count >= max {
            let err = MemoryError::AllocationCount {
                memory: self.name.clone(),
                max,
            };
            log::error!("{err}");
            return Err(err);
        }

        let Some(handle) = self.backend.allocate(size, &self.descriptor) else {
            log::warn!("{}: backend failed to reserve {}", self.name, DataSize(size));
            return Ok(None);
        };

        usage.current += size;
        usage.cumulated += size;
        usage.count += 1;

        let id = Uuid::new_v4();
        let memory = self.descriptor.id;
        let state = Mutex::new(BlockState {
            size,
            handle: Some(handle),
            allocator: Some(self.clone()),
        });
        let access = Mutex::new(AccessCount::default());
        log::info!(
            "{}: allocated {} as block {id} ({} in use)",
            self.name,
            DataSize(size),
            DataSize(usage.current)
        );
        Ok(Some(Arc::new(DataBlock {
            id,
            memory,
            state,
            access,
        })))
    }

    /// Releases `block` back to the backend and marks it weak.
    ///
    /// Fails if the block is already weak or was allocated by another allocator.
    pub fn free(&self, block: &DataBlock) -> Result<(), MemoryError> {
        let mut usage = self.usage.lock();
        let mut state = block.state.lock();

        let Some(owner) = state.allocator.as_ref() else {
            let err = MemoryError::DoubleFree(block.id);
            log::error!("{err}");
            return Err(err);
        };
        if !std::ptr::eq(Arc::as_ptr(owner), self) {
            let err = MemoryError::ForeignBlock {
                block: block.id,
                memory: self.name.clone(),
            };
            log::error!("{err}");
            return Err(err);
        }
        let Some(handle) = state.handle.take() else {
            let err = MemoryError::Weak(block.id);
            log::error!("{err}");
            return Err(err);
        };
        if !self.backend.release(&handle) {
            state.handle = Some(handle);
            let err = MemoryError::Release {
                block: block.id,
                memory: self.name.clone(),
            };
            log::error!("{err}");
            return Err(err);
        }

        let size = std::mem::take(&mut state.size);
        usage.current -= size;
        usage.count -= 1;
        let owner = state.allocator.take();
        log::debug!(
            "{}: freed block {} of {} ({} in use)",
            self.name,
            block.id,
            DataSize(size),
            DataSize(usage.current)
        );

        drop(state);
        drop(usage);
        drop(owner);
        Ok(())
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        let usage = self.usage.get_mut();
        log::info!(
            "{}: cumulated usage {} over the allocator's lifetime",
            self.name,
            DataSize(usage.cumulated)
        );
        if usage.current != 0 {
            log::warn!(
                "{}: leaking {} in {} blocks",
                self.name,
                DataSize(usage.current),
                usage.count
            );
        }
    }
}

/// Plain description of a [`DataBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataBlockDescriptor {
    pub id: Uuid,
    pub memory: Uuid,
    pub size: u64,
}

struct BlockState {
    size: u64,
    handle: Option<Handle>,
    allocator: Option<Arc<Allocator>>,
}

#[derive(Debug, Default)]
struct AccessCount {
    readers: u32,
    writers: u32,
}

/// One allocation within a memory pool.
///
/// Guarded by a reader/writer rule: any number of readers or exactly one writer.
/// Becomes weak exactly once, when freed; a weak block has no handle and zero size.
pub struct DataBlock {
    id: Uuid,
    memory: Uuid,
    state: Mutex<BlockState>,
    access: Mutex<AccessCount>,
}

impl Debug for DataBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DataBlock")
            .field("id", &self.id)
            .field("memory", &self.memory)
            .field("size", &state.size)
            .field("weak", &state.handle.is_none())
            .field("access", &*self.access.lock())
            .finish()
    }
}

impl DataBlock {
    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Id of the memory pool the block was allocated in.
    #[inline]
    pub fn memory(&self) -> Uuid {
        self.memory
    }

    /// Size in bytes; `0` once weak.
    #[inline]
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    #[inline]
    pub fn is_weak(&self) -> bool {
        self.state.lock().handle.is_none()
    }

    pub fn descriptor(&self) -> DataBlockDescriptor {
        DataBlockDescriptor {
            id: self.id,
            memory: self.memory,
            size: self.size(),
        }
    }

    /// The backend allocation. Fails once the block is weak.
    pub fn handle(&self) -> Result<Handle, MemoryError> {
        self.state
            .lock()
            .handle
            .clone()
            .ok_or(MemoryError::Weak(self.id))
    }

    /// The allocator that owns the block, if it is still alive.
    #[inline]
    pub fn allocator(&self) -> Option<Arc<Allocator>> {
        self.state.lock().allocator.clone()
    }

    #[inline]
    pub fn readers(&self) -> u32 {
        self.access.lock().readers
    }

    #[inline]
    pub fn writers(&self) -> u32 {
        self.access.lock().writers
    }

    /// Returns `true` if any reader or writer is outstanding.
    #[inline]
    pub fn is_locked(&self) -> bool {
        let access = self.access.lock();
        access.readers > 0 || access.writers > 0
    }

    fn check_alive(&self) -> Result<(), MemoryError> {
        match self.is_weak() {
            true => Err(MemoryError::Weak(self.id)),
            false => Ok(()),
        }
    }

    /// Grants read access unless a writer is outstanding.
    pub fn try_acquire_safe_read_access(&self) -> Result<bool, MemoryError> {
        self.check_alive()?;
        let mut access = self.access.lock();
        if access.writers > 0 {
            return Ok(false);
        }
        access.readers += 1;
        Ok(true)
    }

    /// Grants write access unless any reader or writer is outstanding.
    pub fn try_acquire_safe_write_access(&self) -> Result<bool, MemoryError> {
        self.check_alive()?;
        let mut access = self.access.lock();
        if access.readers > 0 || access.writers > 0 {
            return Ok(false);
        }
        access.writers += 1;
        Ok(true)
    }

    /// Like [`DataBlock::try_acquire_safe_read_access`], but refusal is an error.
    pub fn acquire_safe_read_access(&self) -> Result<(), MemoryError> {
        match self.try_acquire_safe_read_access()? {
            true => Ok(()),
            false => {
                let err = MemoryError::AccessRefused {
                    block: self.id,
                    access: Access::Read,
                };
                log::error!("{err}");
                Err(err)
            }
        }
    }

    /// Like [`DataBlock::try_acquire_safe_write_access`], but refusal is an error.
    pub fn acquire_safe_write_access(&self) -> Result<(), MemoryError> {
        match self.try_acquire_safe_write_access()? {
            true => Ok(()),
            false => {
                let err = MemoryError::AccessRefused {
                    block: self.id,
                    access: Access::Write,
                };
                log::error!("{err}");
                Err(err)
            }
        }
    }

    pub fn release_read_access(&self) -> Result<(), MemoryError> {
        self.check_alive()?;
        let mut access = self.access.lock();
        if access.readers == 0 {
            let err = MemoryError::NotHeld {
                block: self.id,
                access: Access::Read,
            };
            log::error!("{err}");
            return Err(err);
        }
        access.readers -= 1;
        Ok(())
    }

    pub fn release_write_access(&self) -> Result<(), MemoryError> {
        self.check_alive()?;
        let mut access = self.access.lock();
        if access.writers == 0 {
            let err = MemoryError::NotHeld {
                block: self.id,
                access: Access::Write,
            };
            log::error!("{err}");
            return Err(err);
        }
        access.writers -= 1;
        Ok(())
    }
}

impl Drop for DataBlock {
    fn drop(&mut self) {
        log::debug!("data block {} destroyed", self.id);
        let allocator = self.state.get_mut().allocator.clone();
        if let Some(allocator) = allocator {
            if let Err(err) = allocator.free(self) {
                log::error!("failed to free data block {} on drop: {err}", self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::Allocator;
    use crate::loom::{
        error::ErrorKind,
        memory::{Handle, Heap, MB, MemoryBackend, MemoryDescriptor, MemoryError},
    };

    fn heap(limit: u64) -> Arc<Allocator> {
        let descriptor = MemoryDescriptor {
            id: Uuid::new_v4(),
            ..Heap::descriptor(limit)
        };
        Arc::new(Allocator::new("heap", descriptor, Box::new(Heap)))
    }

    #[derive(Debug)]
    struct Exhausted;

    impl MemoryBackend for Exhausted {
        fn allocate(&self, _size: u64, _descriptor: &MemoryDescriptor) -> Option<Handle> {
            None
        }

        fn release(&self, _handle: &Handle) -> bool {
            true
        }
    }

    #[test]
    fn test_budget() {
        let allocator = heap(5 * MB);

        let first = allocator.alloc(3 * MB).unwrap().unwrap();
        assert_eq!(allocator.current_usage(), 3 * MB);

        let err = allocator.alloc(3 * MB).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotEnoughMemory);
        assert_eq!(allocator.current_usage(), 3 * MB);

        let second = allocator.alloc(2 * MB).unwrap().unwrap();
        assert_eq!(allocator.current_usage(), 5 * MB);
        assert_eq!(allocator.allocation_count(), 2);

        drop(first);
        assert_eq!(allocator.current_usage(), 2 * MB);

        allocator.free(&second).unwrap();
        assert!(second.is_weak());
        assert_eq!(second.size(), 0);
        assert!(matches!(
            allocator.free(&second),
            Err(MemoryError::DoubleFree(_))
        ));
        assert!(matches!(second.handle(), Err(MemoryError::Weak(_))));

        assert_eq!(allocator.current_usage(), 0);
        assert_eq!(allocator.cumulated_usage(), 5 * MB);
    }

    #[test]
    fn test_overflow() {
        let allocator = heap(u64::MAX);
        let _block = allocator.alloc(16).unwrap().unwrap();
        let err = allocator.alloc(u64::MAX).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotEnoughMemory);
    }

    #[test]
    fn test_allocation_count() {
        let descriptor = MemoryDescriptor {
            id: Uuid::new_v4(),
            max_allocation_count: 2,
            ..Heap::descriptor(MB)
        };
        let allocator = Arc::new(Allocator::new("heap", descriptor, Box::new(Heap)));

        let _a = allocator.alloc(1).unwrap().unwrap();
        let b = allocator.alloc(1).unwrap().unwrap();
        assert!(matches!(
            allocator.alloc(1),
            Err(MemoryError::AllocationCount { .. })
        ));
        drop(b);
        assert!(allocator.alloc(1).unwrap().is_some());
    }

    #[test]
    fn test_backend_failure() {
        let descriptor = MemoryDescriptor {
            id: Uuid::new_v4(),
            ..Heap::descriptor(MB)
        };
        let allocator = Arc::new(Allocator::new("exhausted", descriptor, Box::new(Exhausted)));
        assert!(allocator.alloc(16).unwrap().is_none());
        assert_eq!(allocator.current_usage(), 0);
        assert_eq!(allocator.cumulated_usage(), 0);
    }

    #[test]
    fn test_foreign_block() {
        let a = heap(MB);
        let b = heap(MB);
        let block = a.alloc(64).unwrap().unwrap();
        let err = b.free(&block).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
        assert!(!block.is_weak());
        assert_eq!(a.current_usage(), 64);
    }

    #[test]
    fn test_access() {
        let allocator = heap(MB);
        let block = allocator.alloc(64).unwrap().unwrap();

        assert!(block.try_acquire_safe_read_access().unwrap());
        assert!(block.try_acquire_safe_read_access().unwrap());
        assert!(!block.try_acquire_safe_write_access().unwrap());
        assert_eq!(block.readers(), 2);

        block.release_read_access().unwrap();
        block.release_read_access().unwrap();
        assert!(block.release_read_access().is_err());
        assert!(!block.is_locked());

        block.acquire_safe_write_access().unwrap();
        assert!(!block.try_acquire_safe_read_access().unwrap());
        assert!(!block.try_acquire_safe_write_access().unwrap());
        let err = block.acquire_safe_read_access().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);

        block.release_write_access().unwrap();
        assert!(block.release_write_access().is_err());
        assert!(block.try_acquire_safe_write_access().unwrap());
    }

    #[test]
    fn test_budget_random() {
        const LIMIT: u64 = 64 * 1024;
        let allocator = heap(LIMIT);
        let mut rng = fastrand::Rng::with_seed(0x5eed);
        let mut blocks = vec![];

        for _ in 0..2000 {
            if !blocks.is_empty() && rng.bool() {
                let index = rng.usize(..blocks.len());
                drop(blocks.swap_remove(index));
            } else {
                let size = rng.u64(1..=LIMIT / 4);
                let before = allocator.current_usage();
                match allocator.alloc(size) {
                    Ok(Some(block)) => blocks.push(block),
                    Ok(None) => unreachable!(),
                    Err(err) => {
                        assert_eq!(err.kind(), ErrorKind::NotEnoughMemory);
                        assert!(before + size > LIMIT);
                        assert_eq!(allocator.current_usage(), before);
                    }
                }
            }
            let live: u64 = blocks.iter().map(|block| block.size()).sum();
            assert_eq!(allocator.current_usage(), live);
            assert!(allocator.current_usage() <= LIMIT);
        }
    }

    #[test]
    fn test_release_after_free() {
        let allocator = heap(MB);
        let block = allocator.alloc(64).unwrap().unwrap();
        block.acquire_safe_read_access().unwrap();
        allocator.free(&block).unwrap();

        let err = block.release_read_access().unwrap_err();
        assert!(matches!(err, MemoryError::Weak(id) if id == block.id()));
        assert_eq!(err.kind(), ErrorKind::NullPointer);
        let err = block.release_write_access().unwrap_err();
        assert!(matches!(err, MemoryError::Weak(_)));
        assert_eq!(err.kind(), ErrorKind::NullPointer);
    }
}
