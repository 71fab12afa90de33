use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use derive_more::{BitAnd, BitOr, From, Into, Not};
use itertools::Itertools;
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use super::{
    error::ErrorKind, flow::FlowError, memory::MemoryError, signal::Signal, tensor::TensorError,
};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Flow(#[from] FlowError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task failed: {0}")]
    Failed(String),
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Flow(err) => err.kind(),
            TaskError::Memory(err) => err.kind(),
            TaskError::Tensor(err) => err.kind(),
            TaskError::Panicked(_) | TaskError::Failed(_) => ErrorKind::Unknown,
        }
    }
}

/// Flag word published through a task's [`Signal`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, BitAnd, BitOr, Not, From, Into)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Status(pub u32);

impl Status {
    /// Sentinel held by a signal until its task terminates.
    pub const NOT_TERMINATED: Self = Self(0xffff_ffff);
    /// The work is carried out asynchronously to the driving thread.
    pub const ASYNC: Self = Self(1 << 0);
    pub const INITIATED: Self = Self(1 << 1);
    pub const IN_PROGRESS: Self = Self(1 << 2);
    pub const TERMINATED: Self = Self(1 << 3);
    /// Error state. Implies [`Status::TERMINATED`].
    pub const FAILURE: Self = Self(1 << 4 | 1 << 3);
    /// Implies [`Status::TERMINATED`].
    pub const SUCCESS: Self = Self(1 << 5 | 1 << 3);

    const NAMES: [(Self, &'static str); 6] = [
        (Self::ASYNC, "ASYNC"),
        (Self::INITIATED, "INITIATED"),
        (Self::IN_PROGRESS, "IN_PROGRESS"),
        (Self::TERMINATED, "TERMINATED"),
        (Self(1 << 4), "FAILURE"),
        (Self(1 << 5), "SUCCESS"),
    ];

    /// Returns `true` if every bit of `flags` is set. The sentinel contains nothing but itself.
    #[inline]
    pub fn contains(self, flags: Self) -> bool {
        match (self == Self::NOT_TERMINATED, flags == Self::NOT_TERMINATED) {
            (true, other) => other,
            (false, true) => false,
            (false, false) => self.0 & flags.0 == flags.0,
        }
    }

    #[inline]
    pub fn is_terminated(self) -> bool {
        self.contains(Self::TERMINATED)
    }

    #[inline]
    pub fn is_successful(self) -> bool {
        self.contains(Self::SUCCESS)
    }

    #[inline]
    pub fn is_failure(self) -> bool {
        self.contains(Self::FAILURE)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == Self::NOT_TERMINATED {
            return write!(f, "NOT_TERMINATED");
        }
        let names = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| name);
        write!(f, "[{}]", names.format(" | "))
    }
}

/// State shared by every [`Task`]: identity, display name and the outcome signal.
#[derive(Debug)]
pub struct TaskHeader {
    id: Uuid,
    name: String,
    signal: Arc<Signal>,
    started: AtomicBool,
}

impl TaskHeader {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        let name = name.into();
        let signal = Arc::new(Signal::with_value(id, Status::NOT_TERMINATED.0));
        let started = AtomicBool::new(false);
        log::debug!("task {id} ({name}) created");
        Self {
            id,
            name,
            signal,
            started,
        }
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn signal(&self) -> &Arc<Signal> {
        &self.signal
    }

    /// Returns `true` once [`Task::start`] has been entered.
    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

/// A unit of work whose outcome is only ever observed through its [`Signal`].
pub trait Task: Send + Sync {
    fn header(&self) -> &TaskHeader;

    /// The actual work. Errors and panics are caught by [`Task::start`].
    fn run(&self) -> Result<Status, TaskError>;

    #[inline]
    fn id(&self) -> Uuid {
        self.header().id()
    }

    #[inline]
    fn name(&self) -> &str {
        self.header().name()
    }

    #[inline]
    fn signal(&self) -> &Arc<Signal> {
        self.header().signal()
    }

    #[inline]
    fn status(&self) -> Status {
        Status(self.signal().state())
    }

    /// Runs the task on the calling thread and publishes its outcome. Never panics.
    ///
    /// A failure reported through `Ok` is published as is, so a task that never got
    /// going can leave [`Status::INITIATED`] unset. Errors and panics publish an
    /// initiated failure. A task runs at most once; later calls are logged and return
    /// the current status.
    fn start(&self) -> Status {
        let header = self.header();
        let (id, name) = (header.id(), header.name());
        if header.started.swap(true, Ordering::AcqRel) {
            log::warn!("task {id} ({name}) is already started");
            return self.status();
        }

        log::info!("task {id} ({name}) started");
        let status = match panic::catch_unwind(AssertUnwindSafe(|| self.run())) {
            Ok(Ok(status)) if status.contains(Status::FAILURE) => status,
            Ok(Ok(status)) => status | Status::INITIATED | Status::SUCCESS,
            Ok(Err(err)) => {
                log::error!("task {id} ({name}) failed: {err}");
                Status::FAILURE | Status::INITIATED
            }
            Err(payload) => {
                let err = TaskError::Panicked(panic_message(&payload));
                log::error!("task {id} ({name}) failed: {err}");
                Status::FAILURE | Status::INITIATED
            }
        };

        header.signal.signal(status.0);
        log::info!("task {id} ({name}) terminated: {status}");
        status
    }

    /// Blocks until the task terminates and returns its final status.
    #[inline]
    fn wait(&self) -> Status {
        Status(self.signal().wait(|value| Status(value).is_terminated()))
    }
}

/// Extracts the message of a caught panic.
pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

type TaskFn<T> = Box<dyn FnOnce() -> Result<T, TaskError> + Send>;

/// A task backed by a closure. The closure's value is kept for [`FnTask::take_output`].
pub struct FnTask<T> {
    header: TaskHeader,
    func: Mutex<Option<TaskFn<T>>>,
    output: Mutex<Option<T>>,
}

impl<T> std::fmt::Debug for FnTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTask")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> FnTask<T> {
    pub fn new<F>(id: Uuid, name: impl Into<String>, func: F) -> Self
    where
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    {
        let header = TaskHeader::new(id, name);
        let func = Mutex::new(Some(Box::new(func) as TaskFn<T>));
        let output = Mutex::new(None);
        Self {
            header,
            func,
            output,
        }
    }

    /// Takes the closure's value once the task succeeded.
    #[inline]
    pub fn take_output(&self) -> Option<T> {
        self.output.lock().take()
    }
}

impl<T: Send + 'static> Task for FnTask<T> {
    #[inline]
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn run(&self) -> Result<Status, TaskError> {
        let func = self
            .func
            .lock()
            .take()
            .ok_or_else(|| TaskError::Failed("closure already consumed".into()))?;
        let output = func()?;
        self.output.lock().replace(output);
        Ok(Status::default())
    }
}
