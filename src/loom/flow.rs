use std::{
    fmt::Debug,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use derive_more::{BitAnd, BitOr, From, Into};
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use super::{
    context::{Context, ContextError},
    error::{ErrorKind, strict_ensure},
    memory::{DataBlock, Memory, MemoryError},
    task::{Status, Task, TaskError, TaskHeader, panic_message},
};

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("data block {block} lives in memory {found}, expected {expected}")]
    PoolMismatch {
        block: Uuid,
        expected: Uuid,
        found: Uuid,
    },
    #[error("site count mismatch: {sources} source rows, {destinations} destination rows")]
    SiteCount { sources: usize, destinations: usize },
    #[error("invalid row {row}: {reason}")]
    InvalidRow { row: usize, reason: &'static str },
    #[error("flow {0} is already initiated")]
    AlreadyInitiated(Uuid),
    #[error("flow {0} was never initiated")]
    NotInitiated(Uuid),
    #[error("factory of flow {0} does not support abort")]
    AbortUnsupported(Uuid),
    #[error("abort is not implemented by this flow backend")]
    AbortNotImplemented,
    #[error("flow {0} aborted")]
    Aborted(Uuid),
    #[error("data block {0} has no storage this backend can access")]
    Storage(Uuid),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("flow backend failed: {0}")]
    Backend(String),
}

impl FlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::PoolMismatch { .. }
            | FlowError::SiteCount { .. }
            | FlowError::InvalidRow { .. }
            | FlowError::AbortUnsupported(_)
            | FlowError::Storage(_) => ErrorKind::IllegalArgument,
            FlowError::AlreadyInitiated(_)
            | FlowError::NotInitiated(_)
            | FlowError::AbortNotImplemented => ErrorKind::IllegalState,
            FlowError::Memory(err) => err.kind(),
            FlowError::Aborted(_) | FlowError::Backend(_) => ErrorKind::Unknown,
        }
    }
}

/// One strided row of a copy: `length` chunks of `element_size` bytes, `stride` bytes apart,
/// starting `offset` bytes into the block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlowPosition {
    pub length: u64,
    pub element_size: u64,
    pub offset: u64,
    pub stride: u64,
}

impl std::fmt::Display for FlowPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}B @ {} (stride {})",
            self.length, self.element_size, self.offset, self.stride
        )
    }
}

impl FlowPosition {
    #[inline]
    pub fn new(length: u64, offset: u64, element_size: u64, stride: u64) -> Self {
        Self {
            length,
            element_size,
            offset,
            stride,
        }
    }

    /// A row without gaps between chunks.
    #[inline]
    pub fn contiguous(length: u64, offset: u64, element_size: u64) -> Self {
        Self::new(length, offset, element_size, element_size)
    }

    /// `length` single bytes.
    #[inline]
    pub fn bytes(length: u64, offset: u64) -> Self {
        Self::new(length, offset, 1, 1)
    }

    /// Chunks are adjacent, so the whole row is one contiguous range.
    #[inline]
    pub fn is_trivially_copyable(&self) -> bool {
        self.element_size == self.stride
    }

    /// One past the last byte touched, or `None` on overflow.
    pub fn span(&self) -> Option<u64> {
        match self.length {
            0 => Some(self.offset),
            length => (length - 1)
                .checked_mul(self.stride)?
                .checked_add(self.offset)?
                .checked_add(self.element_size),
        }
    }

    /// Returns `true` if the row fits in a block of `block_size` bytes.
    #[inline]
    pub fn is_valid(&self, block_size: u64) -> bool {
        self.element_size <= self.stride && self.span().is_some_and(|end| end <= block_size)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, BitAnd, BitOr, From, Into)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlowPolicies(pub u32);

impl FlowPolicies {
    pub const ASYNC_IO: Self = Self(1 << 0);
    pub const SUPPORT_ABORT: Self = Self(1 << 1);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataFlowFactoryDescriptor {
    pub id: Uuid,
    pub policies: FlowPolicies,
    /// Source memory pool.
    pub source: Uuid,
    /// Destination memory pool.
    pub destination: Uuid,
}

/// The copy routine of one kind of (source pool, destination pool) pair.
pub trait FlowBackend: Send + Sync + Debug {
    #[inline]
    fn policies(&self) -> FlowPolicies {
        FlowPolicies::default()
    }

    /// Moves the bytes described by `flow`. Access to both blocks is already held.
    fn transfer(&self, flow: &DataFlow) -> Result<(), FlowError>;

    /// Interrupts a running transfer. Must be overridden by backends supporting abort.
    fn abort(&self, _flow: &DataFlow) -> Result<(), FlowError> {
        Err(FlowError::AbortNotImplemented)
    }
}

/// Builds the [`DataFlow`]s between one ordered pair of memory pools.
#[derive(Debug)]
pub struct DataFlowFactory {
    descriptor: DataFlowFactoryDescriptor,
    backend: Box<dyn FlowBackend>,
    creation: Mutex<()>,
}

impl DataFlowFactory {
    /// Creates the factory and registers it in `context` for the `(source, destination)` pair.
    pub fn new(
        context: &Context,
        source: &Memory,
        destination: &Memory,
        backend: impl FlowBackend + 'static,
    ) -> Result<Arc<Self>, ContextError> {
        let descriptor = DataFlowFactoryDescriptor {
            id: context.generate_uuid(),
            policies: backend.policies(),
            source: source.id(),
            destination: destination.id(),
        };
        let factory = Arc::new(Self {
            descriptor,
            backend: Box::new(backend),
            creation: Mutex::new(()),
        });
        context.register_flow_factory(factory.clone())?;
        log::debug!(
            "flow factory {} created: {} → {}",
            descriptor.id,
            source.name(),
            destination.name()
        );
        Ok(factory)
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.descriptor.id
    }

    #[inline]
    pub fn descriptor(&self) -> &DataFlowFactoryDescriptor {
        &self.descriptor
    }

    #[inline]
    pub fn policies(&self) -> FlowPolicies {
        self.descriptor.policies
    }

    #[inline]
    pub fn backend(&self) -> &dyn FlowBackend {
        self.backend.as_ref()
    }

    /// Constructs a flow copying `source_sites` of `source` into `destination_sites` of `destination`.
    ///
    /// No bytes move until the flow is started. Preconditions are checked in debug or `strict` builds.
    pub fn initiate_flow(
        self: &Arc<Self>,
        source: &Arc<DataBlock>,
        destination: &Arc<DataBlock>,
        source_sites: Vec<FlowPosition>,
        destination_sites: Vec<FlowPosition>,
        id: Uuid,
    ) -> Result<Arc<DataFlow>, FlowError> {
        let _guard = self.creation.lock();

        strict_ensure!(
            source.memory() == self.descriptor.source,
            FlowError::PoolMismatch {
                block: source.id(),
                expected: self.descriptor.source,
                found: source.memory(),
            }
        );
        strict_ensure!(
            destination.memory() == self.descriptor.destination,
            FlowError::PoolMismatch {
                block: destination.id(),
                expected: self.descriptor.destination,
                found: destination.memory(),
            }
        );
        strict_ensure!(
            source_sites.len() == destination_sites.len(),
            FlowError::SiteCount {
                sources: source_sites.len(),
                destinations: destination_sites.len(),
            }
        );

        let (source_size, destination_size) = (source.size(), destination.size());
        for (row, (src, dst)) in source_sites.iter().zip(&destination_sites).enumerate() {
            strict_ensure!(
                src.element_size != 0 && src.element_size == dst.element_size,
                FlowError::InvalidRow {
                    row,
                    reason: "element sizes are zero or differ",
                }
            );
            strict_ensure!(
                src.is_valid(source_size),
                FlowError::InvalidRow {
                    row,
                    reason: "source row exceeds the source block",
                }
            );
            strict_ensure!(
                dst.is_valid(destination_size),
                FlowError::InvalidRow {
                    row,
                    reason: "destination row exceeds the destination block",
                }
            );
            strict_ensure!(
                src.length == dst.length,
                FlowError::InvalidRow {
                    row,
                    reason: "repetition counts differ",
                }
            );
        }

        let flow = Arc::new(DataFlow {
            header: TaskHeader::new(id, "data-flow"),
            factory: self.clone(),
            source: source.clone(),
            destination: destination.clone(),
            source_sites,
            destination_sites,
            flags: Mutex::new(Status::default()),
        });
        log::debug!(
            "flow {id} initiated: block {} → block {}, {} rows",
            source.id(),
            destination.id(),
            flow.source_sites.len()
        );
        Ok(flow)
    }
}

/// A strided copy between two data blocks, driven as a [`Task`].
#[derive(Debug)]
pub struct DataFlow {
    header: TaskHeader,
    factory: Arc<DataFlowFactory>,
    source: Arc<DataBlock>,
    destination: Arc<DataBlock>,
    source_sites: Vec<FlowPosition>,
    destination_sites: Vec<FlowPosition>,
    flags: Mutex<Status>,
}

impl DataFlow {
    #[inline]
    pub fn factory(&self) -> &Arc<DataFlowFactory> {
        &self.factory
    }

    #[inline]
    pub fn source(&self) -> &Arc<DataBlock> {
        &self.source
    }

    #[inline]
    pub fn destination(&self) -> &Arc<DataBlock> {
        &self.destination
    }

    #[inline]
    pub fn source_sites(&self) -> &[FlowPosition] {
        &self.source_sites
    }

    #[inline]
    pub fn destination_sites(&self) -> &[FlowPosition] {
        &self.destination_sites
    }

    /// Row pairs `(source, destination)`.
    #[inline]
    pub fn rows(&self) -> impl Iterator<Item = (&FlowPosition, &FlowPosition)> {
        self.source_sites.iter().zip(&self.destination_sites)
    }

    #[inline]
    pub fn flags(&self) -> Status {
        *self.flags.lock()
    }

    #[inline]
    pub fn terminated(&self) -> bool {
        self.flags().is_terminated()
    }

    #[inline]
    pub fn running(&self) -> bool {
        self.flags().contains(Status::IN_PROGRESS)
    }

    #[inline]
    pub fn successful(&self) -> bool {
        self.flags().is_successful()
    }

    #[inline]
    pub fn interrupted(&self) -> bool {
        self.flags().is_failure()
    }

    /// Interrupts the flow while it is in progress.
    ///
    /// Only legal if the factory supports abort and the flow was started; a terminated flow is left alone.
    pub fn abort(&self) -> Result<(), FlowError> {
        let id = self.id();
        strict_ensure!(
            self.factory.policies().contains(FlowPolicies::SUPPORT_ABORT),
            FlowError::AbortUnsupported(id)
        );
        {
            let flags = self.flags.lock();
            strict_ensure!(
                flags.contains(Status::INITIATED),
                FlowError::NotInitiated(id)
            );
            if !flags.contains(Status::IN_PROGRESS) {
                return Ok(());
            }
        }
        log::info!("aborting flow {id}");
        self.factory.backend.abort(self)
    }

    fn mark_started(&self) -> Result<(), FlowError> {
        let status = {
            let mut flags = self.flags.lock();
            if flags.contains(Status::INITIATED) || flags.is_terminated() {
                return Err(FlowError::AlreadyInitiated(self.id()));
            }
            if let Err(err) = self.source.acquire_safe_read_access() {
                *flags = *flags | Status::FAILURE;
                return Err(err.into());
            }
            if let Err(err) = self.destination.acquire_safe_write_access() {
                if let Err(err) = self.source.release_read_access() {
                    log::error!("flow {}: {err}", self.id());
                }
                *flags = *flags | Status::FAILURE;
                return Err(err.into());
            }
            let mut status = *flags | Status::INITIATED | Status::IN_PROGRESS;
            if self.factory.policies().contains(FlowPolicies::ASYNC_IO) {
                status = status | Status::ASYNC;
            }
            *flags = status;
            status
        };
        self.signal().signal(status.0);
        Ok(())
    }

    fn mark_terminated(&self, outcome: Status) {
        let mut flags = self.flags.lock();
        *flags = (*flags & !Status::IN_PROGRESS) | outcome;
        if let Err(err) = self.destination.release_write_access() {
            log::error!("flow {}: {err}", self.id());
        }
        if let Err(err) = self.source.release_read_access() {
            log::error!("flow {}: {err}", self.id());
        }
    }
}

impl Task for DataFlow {
    #[inline]
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn run(&self) -> Result<Status, TaskError> {
        match self.mark_started() {
            Ok(()) => {}
            Err(err @ FlowError::AlreadyInitiated(_)) => return Err(err.into()),
            Err(err) => {
                // never initiated: the failure is all there is to report
                log::error!("flow {} failed to start: {err}", self.id());
                return Ok(self.flags());
            }
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.factory.backend.transfer(self)))
            .unwrap_or_else(|payload| Err(FlowError::Backend(panic_message(&payload))));

        match result {
            Ok(()) => {
                self.mark_terminated(Status::SUCCESS);
                Ok(self.flags())
            }
            Err(err) => {
                self.mark_terminated(Status::FAILURE);
                log::warn!("flow {} interrupted: {err}", self.id());
                Err(err.into())
            }
        }
    }
}

impl Drop for DataFlow {
    fn drop(&mut self) {
        if self.flags.get_mut().contains(Status::IN_PROGRESS) {
            log::error!("flow {} destroyed while in progress", self.header.id());
        }
    }
}
