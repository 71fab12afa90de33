use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
};

use super::task::{Status, Task};

/// Starts `task` on a dedicated thread named after it. Joining yields the final status.
pub fn spawn<T: Task + ?Sized + 'static>(task: Arc<T>) -> io::Result<JoinHandle<Status>> {
    thread::Builder::new()
        .name(task.name().to_owned())
        .spawn(move || task.start())
}

/// Spawns every task and waits for all of them, returning their statuses in order.
pub fn run_all<T: Task + ?Sized + 'static>(tasks: impl IntoIterator<Item = Arc<T>>) -> io::Result<Vec<Status>> {
    let handles: Vec<_> = tasks.into_iter().map(spawn).collect::<io::Result<_>>()?;
    Ok(handles
        .into_iter()
        .map(|handle| handle.join().unwrap_or(Status::FAILURE | Status::INITIATED))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::{run_all, spawn};
    use crate::loom::task::{FnTask, Task, TaskError};

    #[test]
    fn test_spawn() {
        let task = Arc::new(FnTask::new(Uuid::new_v4(), "answer", || Ok(42)));
        let status = spawn(task.clone()).unwrap().join().unwrap();
        assert!(status.is_successful());
        assert!(task.status().is_successful());
        assert_eq!(task.take_output(), Some(42));
    }

    #[test]
    fn test_run_all() {
        let tasks: Vec<Arc<dyn Task>> = vec![
            Arc::new(FnTask::new(Uuid::new_v4(), "ok", || Ok(()))),
            Arc::new(FnTask::new(Uuid::new_v4(), "err", || {
                Err::<(), _>(TaskError::Failed("nope".into()))
            })),
        ];
        let statuses = run_all(tasks).unwrap();
        assert!(statuses[0].is_successful());
        assert!(statuses[1].is_failure());
    }
}
