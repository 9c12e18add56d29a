use thiserror::Error;

/// Errors reported when spawning a task.
///
/// Both variants are backpressure signals, not failures: the task store has a
/// fixed capacity and slots free up as tasks finish, so the caller is expected
/// to retry (or use [`ThreadPool::spawn`](crate::ThreadPool::spawn), which
/// blocks until a slot is available).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    #[error("task store is at capacity, retry after tasks drain")]
    StoreFull,

    #[error("task store did not free a slot within the timeout")]
    Timeout,
}
