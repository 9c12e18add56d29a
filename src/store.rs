use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::SpawnError;
use crate::latch::Latch;
use crate::task::{Priority, TaskDesc, TaskFn, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    NotReady,
    Ready,
    Running,
    Finished,
}

struct TaskRecord {
    state: TaskState,
    function: TaskFn,
    instances: u32,
    instances_completed: u32,
    remaining_dependencies: u32,
    dependents: Vec<TaskId>,
    waitable: bool,
    priority: Priority,
    name: Option<Arc<str>>,
    /// Present only for waitable tasks; signaled exactly once, at the
    /// transition to `Finished`.
    latch: Option<Arc<Latch>>,
}

struct Slot {
    generation: u32,
    next_free: Option<u32>,
    record: Option<TaskRecord>,
}

struct StoreInner {
    slots: Vec<Slot>,
    first_free: Option<u32>,
    /// Tasks allocated and not yet `Finished`. Pool teardown waits for this
    /// to reach zero so no enqueued task is ever dropped.
    unfinished: usize,
}

/// Arena of task records addressed by generation-checked handles.
///
/// A single mutex serializes allocation, dependency wiring and the completion
/// transition. That is what makes the `Finished` transition happen exactly
/// once, and what closes the race between "check whether the dependency
/// already finished" and "register as its dependent": both happen under the
/// same lock as the transition itself.
///
/// Slots are recycled through a free list; retiring a record bumps the slot
/// generation so stale handles are detectable (they read as finished).
pub(crate) struct TaskStore {
    inner: Mutex<StoreInner>,
    /// Signaled whenever a slot frees up or `unfinished` drops.
    space: Condvar,
    capacity: usize,
}

/// A task that became ready and whose instances must be enqueued.
#[derive(Debug)]
pub(crate) struct ReadyTask {
    pub id: TaskId,
    pub instances: u32,
    pub priority: Priority,
}

#[derive(Debug)]
pub(crate) struct Allocation {
    pub id: TaskId,
    /// Set when the task was ready at creation (no unresolved dependency).
    pub ready: Option<ReadyTask>,
}

pub(crate) struct ClaimedInstance {
    pub function: TaskFn,
    pub instances: u32,
    pub name: Option<Arc<str>>,
}

pub(crate) struct Completion {
    /// Whether this instance caused the task's finish transition.
    pub finished: bool,
    pub latch: Option<Arc<Latch>>,
    pub newly_ready: Vec<ReadyTask>,
}

impl TaskStore {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "task store needs at least one slot");

        let slots = (0..capacity)
            .map(|i| Slot {
                generation: 0,
                next_free: if i + 1 < capacity {
                    Some((i + 1) as u32)
                } else {
                    None
                },
                record: None,
            })
            .collect();

        Self {
            inner: Mutex::new(StoreInner {
                slots,
                first_free: Some(0),
                unfinished: 0,
            }),
            space: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocates a record for the descriptor, wiring it as a dependent of its
    /// dependency when that is still live. `Err(StoreFull)` is backpressure;
    /// slots free up as tasks retire.
    pub fn try_allocate(&self, desc: &TaskDesc) -> Result<Allocation, SpawnError> {
        let mut inner = self.inner.lock().unwrap();
        Self::allocate_locked(&mut inner, desc).ok_or(SpawnError::StoreFull)
    }

    /// Like [`TaskStore::try_allocate`], but blocks until a slot frees up.
    pub fn allocate_blocking(&self, desc: &TaskDesc) -> Allocation {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(allocation) = Self::allocate_locked(&mut inner, desc) {
                return allocation;
            }
            inner = self.space.wait(inner).unwrap();
        }
    }

    /// Like [`TaskStore::try_allocate`], but waits up to `timeout` for a slot.
    pub fn allocate_timeout(
        &self,
        desc: &TaskDesc,
        timeout: Duration,
    ) -> Result<Allocation, SpawnError> {
        let deadline = Instant::now() + timeout;

        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(allocation) = Self::allocate_locked(&mut inner, desc) {
                return Ok(allocation);
            }
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return Err(SpawnError::Timeout);
            };
            let (guard, _) = self.space.wait_timeout(inner, left).unwrap();
            inner = guard;
        }
    }

    fn allocate_locked(inner: &mut StoreInner, desc: &TaskDesc) -> Option<Allocation> {
        let index = inner.first_free?;

        let id = TaskId {
            index,
            generation: inner.slots[index as usize].generation,
        };

        // Resolve the dependency under the same lock that performs finish
        // transitions, so it cannot finish between the check and the
        // registration.
        let mut remaining_dependencies = 0;
        if let Some(dep) = desc.dependency {
            let slot = Self::slot_mut(inner, dep);

            // A stale generation means the dependency finished and was
            // retired, which behaves exactly like having no dependency.
            if slot.generation == dep.generation
                && let Some(record) = slot.record.as_mut()
                && record.state != TaskState::Finished
            {
                record.dependents.push(id);
                remaining_dependencies = 1;
            }
        }

        let state = if remaining_dependencies == 0 {
            TaskState::Ready
        } else {
            TaskState::NotReady
        };

        let slot = &mut inner.slots[index as usize];
        let next_free = slot.next_free.take();
        slot.record = Some(TaskRecord {
            state,
            function: desc.function.clone(),
            instances: desc.instances,
            instances_completed: 0,
            remaining_dependencies,
            dependents: Vec::new(),
            waitable: desc.waitable,
            priority: desc.priority,
            name: desc.name.clone(),
            latch: desc.waitable.then(|| Arc::new(Latch::new())),
        });
        inner.first_free = next_free;
        inner.unfinished += 1;

        let ready = (state == TaskState::Ready).then_some(ReadyTask {
            id,
            instances: desc.instances,
            priority: desc.priority,
        });

        Some(Allocation { id, ready })
    }

    /// Claims one instance for execution, transitioning the record to
    /// `Running` on the first claim.
    pub fn claim(&self, id: TaskId) -> ClaimedInstance {
        let mut inner = self.inner.lock().unwrap();
        let record = Self::record_mut(&mut inner, id);

        if record.state == TaskState::Ready {
            record.state = TaskState::Running;
        }
        debug_assert_eq!(record.state, TaskState::Running);

        ClaimedInstance {
            function: record.function.clone(),
            instances: record.instances,
            name: record.name.clone(),
        }
    }

    /// Records the completion of one instance. On the last instance the task
    /// transitions to `Finished`: dependents with no unresolved prerequisites
    /// left are returned as newly ready, the latch (if any) is handed back
    /// for signaling, and non-waitable records are retired on the spot.
    ///
    /// Exactly one caller observes `finished == true` per task, since the counter
    /// update and the transition happen under the store mutex.
    pub fn complete_instance(&self, id: TaskId) -> Completion {
        let mut inner = self.inner.lock().unwrap();

        let record = Self::record_mut(&mut inner, id);
        record.instances_completed += 1;
        debug_assert!(record.instances_completed <= record.instances);

        if record.instances_completed < record.instances {
            return Completion {
                finished: false,
                latch: None,
                newly_ready: Vec::new(),
            };
        }

        record.state = TaskState::Finished;
        let dependents = std::mem::take(&mut record.dependents);
        let latch = record.latch.clone();
        let waitable = record.waitable;
        inner.unfinished -= 1;

        let mut newly_ready = Vec::with_capacity(dependents.len());
        for dependent in dependents {
            let record = Self::record_mut(&mut inner, dependent);
            record.remaining_dependencies -= 1;
            if record.remaining_dependencies == 0 {
                record.state = TaskState::Ready;
                newly_ready.push(ReadyTask {
                    id: dependent,
                    instances: record.instances,
                    priority: record.priority,
                });
            }
        }

        if !waitable {
            Self::retire(&mut inner, id.index);
        }
        self.space.notify_all();

        Completion {
            finished: true,
            latch,
            newly_ready,
        }
    }

    /// A stale handle reads as finished: the slot was retired, and records
    /// are only retired once their task finished.
    pub fn is_finished(&self, id: TaskId) -> bool {
        let inner = self.inner.lock().unwrap();
        let slot = Self::slot(&inner, id);

        if slot.generation != id.generation {
            return true;
        }
        match &slot.record {
            Some(record) => record.state == TaskState::Finished,
            None => true,
        }
    }

    /// First half of waiting: fetches the task's latch under the lock.
    /// Returns `None` when the task already finished (no wait needed),
    /// retiring the record in that case. Panics if the task was not spawned
    /// waitable, which is a caller contract violation.
    pub fn wait_handle(&self, id: TaskId) -> Option<Arc<Latch>> {
        let mut inner = self.inner.lock().unwrap();
        let slot = Self::slot_mut(&mut inner, id);

        if slot.generation != id.generation {
            return None;
        }
        let record = slot.record.as_mut()?;

        assert!(
            record.waitable,
            "wait_for_tasks called on a task that was not spawned waitable"
        );

        if record.state == TaskState::Finished {
            Self::retire(&mut inner, id.index);
            self.space.notify_all();
            return None;
        }

        record.latch.clone()
    }

    /// Second half of waiting: retires the record once the latch fired.
    /// A stale handle means a concurrent waiter already did the cleanup.
    pub fn release_waited(&self, id: TaskId) {
        let mut inner = self.inner.lock().unwrap();
        let slot = Self::slot(&inner, id);

        if slot.generation != id.generation {
            return;
        }
        debug_assert!(matches!(
            slot.record.as_ref().map(|r| r.state),
            Some(TaskState::Finished)
        ));

        Self::retire(&mut inner, id.index);
        self.space.notify_all();
    }

    /// Blocks until every live task has finished. Used by pool teardown.
    pub fn wait_drained(&self) {
        let mut inner = self.inner.lock().unwrap();
        while inner.unfinished > 0 {
            inner = self.space.wait(inner).unwrap();
        }
    }

    fn retire(inner: &mut StoreInner, index: u32) {
        let previous_free = inner.first_free.replace(index);
        let slot = &mut inner.slots[index as usize];
        slot.record = None;
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = previous_free;
    }

    /// Checked slot lookup; a handle whose index was never handed out is a
    /// caller contract violation.
    fn slot(inner: &StoreInner, id: TaskId) -> &Slot {
        inner
            .slots
            .get(id.index as usize)
            .unwrap_or_else(|| panic!("task handle {id:?} was never issued"))
    }

    fn slot_mut(inner: &mut StoreInner, id: TaskId) -> &mut Slot {
        inner
            .slots
            .get_mut(id.index as usize)
            .unwrap_or_else(|| panic!("task handle {id:?} was never issued"))
    }

    fn record_mut(inner: &mut StoreInner, id: TaskId) -> &mut TaskRecord {
        let slot = Self::slot_mut(inner, id);
        assert!(
            slot.generation == id.generation,
            "task record for {id:?} was retired while still referenced"
        );
        slot.record
            .as_mut()
            .unwrap_or_else(|| panic!("task record for {id:?} is not live"))
    }
}
