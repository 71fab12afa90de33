use derive_more::Display;
use thiserror::Error;

use super::{
    context::ContextError, flow::FlowError, memory::MemoryError, ops::DependencyError,
    shape::ShapeError, task::TaskError, tensor::TensorError,
};

/// Classification shared by every error raised in the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ErrorKind {
    /// A precondition was violated by the caller.
    IllegalArgument,
    /// An internal invariant was violated.
    IllegalState,
    /// A required handle is missing, e.g. the block was already freed.
    NullPointer,
    /// The allocator budget is exceeded or the reservation failed.
    NotEnoughMemory,
    AlreadyInitialized,
    IndexOutOfBounds,
    Unknown,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Flow(#[from] FlowError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    #[error(transparent)]
    Task(#[from] TaskError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Context(err) => err.kind(),
            Error::Memory(err) => err.kind(),
            Error::Flow(err) => err.kind(),
            Error::Shape(err) => err.kind(),
            Error::Tensor(err) => err.kind(),
            Error::Dependency(err) => err.kind(),
            Error::Task(err) => err.kind(),
        }
    }
}

/// Returns early with `$err` when `$cond` does not hold.
///
/// Only evaluated in debug builds or with the `strict` feature; release builds trust the caller.
macro_rules! strict_ensure {
    ($cond:expr, $err:expr $(,)?) => {
        if cfg!(any(debug_assertions, feature = "strict")) && !($cond) {
            let err = $err;
            ::log::error!("{err}");
            return Err(err.into());
        }
    };
}

pub(crate) use strict_ensure;
