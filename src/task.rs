use std::fmt;
use std::sync::Arc;

pub(crate) type TaskFn = Arc<dyn Fn(&TaskContext) + Send + Sync + 'static>;

/// Handle to a task in the pool.
///
/// Handles are generation-checked: the slot index may be reused after the
/// task is retired, but the reused slot carries a bumped generation, so a
/// stale handle never aliases a newer task. A stale handle simply reads as
/// "finished".
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({}v{})", self.index, self.generation)
    }
}

pub(crate) const PRIORITIES: usize = 3;

/// Priority class of a task.
///
/// Each class has its own FIFO ready queue. Workers prefer higher classes,
/// but the preference is best-effort: ordering is only guaranteed *within*
/// a class, never across classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub(crate) fn lane(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// Descriptor for a task to be spawned on a [`ThreadPool`](crate::ThreadPool).
///
/// The callable runs once per instance, each invocation receiving a distinct
/// instance index through [`TaskContext`]. Instances of one task may run
/// concurrently on different workers, so the callable must be `Send + Sync`.
///
/// Descriptors are cheap to clone (the callable is behind an `Arc`), which
/// makes retrying a spawn after backpressure trivial.
#[derive(Clone)]
pub struct TaskDesc {
    pub(crate) function: TaskFn,
    pub(crate) dependency: Option<TaskId>,
    pub(crate) instances: u32,
    pub(crate) waitable: bool,
    pub(crate) priority: Priority,
    pub(crate) name: Option<Arc<str>>,
}

impl TaskDesc {
    pub fn new(function: impl Fn(&TaskContext) + Send + Sync + 'static) -> Self {
        Self {
            function: Arc::new(function),
            dependency: None,
            instances: 1,
            waitable: false,
            priority: Priority::default(),
            name: None,
        }
    }

    /// Number of parallel invocations of the callable. Must be at least 1.
    pub fn instances(mut self, instances: u32) -> Self {
        assert!(instances >= 1, "a task needs at least one instance");
        self.instances = instances;
        self
    }

    /// Gates the task on another task: no instance starts before the
    /// dependency has finished. A dependency that already finished behaves
    /// exactly like no dependency.
    pub fn after(mut self, dependency: TaskId) -> Self {
        self.dependency = Some(dependency);
        self
    }

    /// Allows external threads to block on this task's completion via
    /// [`ThreadPool::wait_for_tasks`](crate::ThreadPool::wait_for_tasks).
    /// Waitable tasks hold their store slot until they are waited for.
    pub fn waitable(mut self) -> Self {
        self.waitable = true;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Optional name, surfaced in the per-task tracing span.
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(Arc::from(name));
        self
    }
}

impl fmt::Debug for TaskDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDesc")
            .field("dependency", &self.dependency)
            .field("instances", &self.instances)
            .field("waitable", &self.waitable)
            .field("priority", &self.priority)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Read-only view passed to every task invocation.
///
/// Instance and thread indices are handed in explicitly by the worker loop
/// (no thread-local lookup), so task bodies can slice shared input
/// data by `instance` without any synchronization of their own.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext {
    /// Handle of the task being executed.
    pub task: TaskId,
    /// Index of this invocation, in `0..instances`. Each index occurs
    /// exactly once across all invocations of the task.
    pub instance: u32,
    /// Total number of instances of the task.
    pub instances: u32,
    /// Index of the worker thread running this invocation.
    pub thread: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "at least one instance")]
    fn zero_instances_is_rejected() {
        let _ = TaskDesc::new(|_| {}).instances(0);
    }
}
