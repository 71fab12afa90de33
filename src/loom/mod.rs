//! The `loom` module provides the runtime core that sits underneath tensor computation:
//! it owns memory, moves bytes between memory pools, and arbitrates concurrent access to them.
//!
//! ## Key Components
//! 1. **Memory**:
//!    - A [`Memory`](memory::Memory) pool is bound to exactly one budgeted [`Allocator`](memory::Allocator).
//!    - Allocators hand out [`DataBlock`](memory::DataBlock)s, each guarding its bytes with reader/writer counters.
//!    - Backends (host heap today) plug in through [`MemoryBackend`](memory::MemoryBackend).
//!
//! 2. **Data Flows**:
//!    - A [`DataFlow`](flow::DataFlow) copies strided rows ([`FlowPosition`](flow::FlowPosition)) between two blocks.
//!    - Flows are only built by the [`DataFlowFactory`](flow::DataFlowFactory) registered for the pool pair.
//!
//! 3. **Tasks & Signals**:
//!    - A [`Signal`](signal::Signal) is an observable, waitable 32-bit state cell.
//!    - A [`Task`](task::Task) publishes its outcome through its signal and never propagates failures to the
//!      thread that drives it.
//!
//! 4. **Tensors & Operators**:
//!    - [`TensorShape`](shape::TensorShape) and [`SlicedTensorShape`](shape::SlicedTensorShape) describe layouts.
//!    - A [`TensorBlock`](tensor::TensorBlock) views a data block as a tensor slice with its own access state machine.
//!    - [`OpDependencyDescriptor`](ops::OpDependencyDescriptor) decides whether a sliced operator application is legal.
//!
//! ## Design Principles
//! - **Explicit ownership**: registries live in a [`Context`](context::Context), never in process globals.
//! - **Fail fast**: synchronous calls return errors at the call site; task execution converts them into signals.
//! - **Safety**: the reader/writer rule on data blocks is the single arbiter of concurrent access.

pub mod context;
pub mod error;
pub mod flow;
pub mod memory;
pub mod num;
pub mod ops;
pub mod platform;
pub mod shape;
pub mod signal;
pub mod task;
pub mod tensor;
