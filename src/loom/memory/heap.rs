use std::{ops::Range, sync::Arc};

use bytemuck::Pod;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use super::{Capabilities, DataBlock, Handle, MemoryBackend, MemoryDescriptor, MemoryKind};
use crate::loom::flow::{DataFlow, FlowBackend, FlowError, FlowPosition};

/// Zero-initialised host bytes behind a reader/writer lock.
#[derive(Debug)]
pub struct HostBuffer {
    bytes: RwLock<Box<[u8]>>,
}

impl HostBuffer {
    /// Returns `None` if `len` bytes cannot be reserved.
    pub fn zeroed(len: usize) -> Option<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len).ok()?;
        bytes.resize(len, 0);
        let bytes = RwLock::new(bytes.into_boxed_slice());
        Some(Self { bytes })
    }

    /// The host buffer behind `block`.
    pub fn of(block: &DataBlock) -> Result<Arc<Self>, FlowError> {
        block
            .handle()?
            .downcast::<Self>()
            .ok_or(FlowError::Storage(block.id()))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.bytes.read()
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.bytes.write()
    }

    /// Reads `count` values starting at byte `offset`. Returns `None` if out of range.
    pub fn read_pod<T: Pod>(&self, offset: usize, count: usize) -> Option<Vec<T>> {
        let len = count.checked_mul(size_of::<T>())?;
        let bytes = self.bytes.read();
        let bytes = bytes.get(offset..offset.checked_add(len)?)?;
        Some(bytemuck::pod_collect_to_vec(bytes))
    }

    /// Writes `values` starting at byte `offset`. Returns `None` if out of range.
    pub fn write_pod<T: Pod>(&self, offset: usize, values: &[T]) -> Option<()> {
        let data: &[u8] = bytemuck::cast_slice(values);
        let mut bytes = self.bytes.write();
        bytes
            .get_mut(offset..offset.checked_add(data.len())?)?
            .copy_from_slice(data);
        Some(())
    }
}

/// Host heap backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct Heap;

impl Heap {
    /// Descriptor of a heap pool with a budget of `limit` bytes. The id is assigned on registration.
    pub fn descriptor(limit: u64) -> MemoryDescriptor {
        MemoryDescriptor {
            id: Uuid::nil(),
            kind: MemoryKind::HostHeap,
            capabilities: Capabilities::KEEP_ALLOCATION_VIEW,
            alignment: 0,
            max_usage: limit,
            max_allocation_count: u64::MAX,
        }
    }
}

impl MemoryBackend for Heap {
    fn allocate(&self, size: u64, _descriptor: &MemoryDescriptor) -> Option<Handle> {
        let len = usize::try_from(size).ok()?;
        HostBuffer::zeroed(len).map(Handle::new)
    }

    fn release(&self, handle: &Handle) -> bool {
        handle.downcast_ref::<HostBuffer>().is_some()
    }
}

/// Heap to heap copies.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapFlow;

fn range(offset: u64, len: u64) -> Option<Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    Some(start..end)
}

fn copy_row(
    source: &[u8],
    destination: &mut [u8],
    src: &FlowPosition,
    dst: &FlowPosition,
) -> Option<()> {
    if src.element_size != dst.element_size || src.length != dst.length {
        return None;
    }
    match src.is_trivially_copyable() && dst.is_trivially_copyable() {
        true => copy_bulk(source, destination, src, dst),
        false => copy_strided(source, destination, src, dst),
    }
}

/// Copies a packed row with a single slice copy.
fn copy_bulk(
    source: &[u8],
    destination: &mut [u8],
    src: &FlowPosition,
    dst: &FlowPosition,
) -> Option<()> {
    let len = src.length.checked_mul(src.element_size)?;
    let bytes = source.get(range(src.offset, len)?)?;
    destination
        .get_mut(range(dst.offset, len)?)?
        .copy_from_slice(bytes);
    Some(())
}

/// Copies a row one element at a time, following each side's stride.
fn copy_strided(
    source: &[u8],
    destination: &mut [u8],
    src: &FlowPosition,
    dst: &FlowPosition,
) -> Option<()> {
    for index in 0..src.length {
        let src_offset = index.checked_mul(src.stride)?.checked_add(src.offset)?;
        let dst_offset = index.checked_mul(dst.stride)?.checked_add(dst.offset)?;
        let bytes = source.get(range(src_offset, src.element_size)?)?;
        destination
            .get_mut(range(dst_offset, dst.element_size)?)?
            .copy_from_slice(bytes);
    }
    Some(())
}

impl FlowBackend for HeapFlow {
    fn transfer(&self, flow: &DataFlow) -> Result<(), FlowError> {
        let (sources, destinations) = (flow.source_sites().len(), flow.destination_sites().len());
        if sources != destinations {
            return Err(FlowError::SiteCount {
                sources,
                destinations,
            });
        }

        let source = HostBuffer::of(flow.source())?;
        let destination = HostBuffer::of(flow.destination())?;
        if Arc::ptr_eq(&source, &destination) {
            return Err(FlowError::Storage(flow.destination().id()));
        }

        let source = source.read();
        let mut destination = destination.write();
        for (row, (src, dst)) in flow.rows().enumerate() {
            copy_row(&source, &mut destination, src, dst).ok_or(FlowError::InvalidRow {
                row,
                reason: "row does not fit its block",
            })?;
        }
        Ok(())
    }
}
