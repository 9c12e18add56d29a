use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Select, Sender, unbounded};
use tracing::Level;

use crate::error::SpawnError;
use crate::spinlock::SpinLock;
use crate::store::{Completion, ReadyTask, TaskStore};
use crate::task::{PRIORITIES, TaskContext, TaskDesc, TaskId};

const DEFAULT_CAPACITY: usize = 4096;

thread_local! {
    /// Set once in every worker thread; lets the wait path detect the
    /// deadlock-prone "worker waits on its own pool" misuse.
    static IS_WORKER: Cell<bool> = const { Cell::new(false) };
}

#[derive(Debug)]
enum Job {
    Run { id: TaskId, instance: u32 },
    Shutdown,
}

struct Stats {
    /// The counters are relaxed atomics; the spin lock only serializes
    /// compound updates so [`ThreadPool::stats`] sees a coherent pair.
    lock: SpinLock,
    tasks_finished: AtomicU64,
    instances_executed: AtomicU64,
}

/// Snapshot of pool counters, taken coherently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub tasks_finished: u64,
    pub instances_executed: u64,
}

struct Shared {
    store: TaskStore,
    /// One FIFO ready queue per priority class; workers prefer lower lanes.
    lanes: [Sender<Job>; PRIORITIES],
    stats: Stats,
}

impl Shared {
    fn enqueue(&self, ready: ReadyTask) {
        let lane = &self.lanes[ready.priority.lane()];
        for instance in 0..ready.instances {
            lane.send(Job::Run {
                id: ready.id,
                instance,
            })
            .unwrap();
        }
    }

    /// Post-transition bookkeeping, run outside the store lock: bump the
    /// counters, release waiters, enqueue dependents that became ready.
    fn finish(&self, completion: Completion) {
        debug_assert!(completion.finished);

        {
            let _guard = self.stats.lock.acquire();
            self.stats.tasks_finished.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(latch) = completion.latch {
            latch.set();
        }
        for ready in completion.newly_ready {
            self.enqueue(ready);
        }
    }
}

/// Configures and builds a [`ThreadPool`].
pub struct PoolBuilder {
    threads: Option<usize>,
    capacity: usize,
}

impl PoolBuilder {
    /// Number of worker threads. Defaults to the number of logical
    /// processors.
    pub fn threads(mut self, threads: usize) -> Self {
        assert!(threads >= 1, "the pool needs at least one worker thread");
        self.threads = Some(threads);
        self
    }

    /// Task store capacity: the maximum number of live tasks. Spawning past
    /// it is backpressure, see [`ThreadPool::try_spawn`].
    pub fn capacity(mut self, capacity: usize) -> Self {
        assert!(capacity >= 1, "task store needs at least one slot");
        self.capacity = capacity;
        self
    }

    pub fn build(self) -> ThreadPool {
        let threads = self.threads.unwrap_or_else(|| {
            thread::available_parallelism().map(usize::from).unwrap_or(1)
        });

        let (high_tx, high_rx) = unbounded();
        let (normal_tx, normal_rx) = unbounded();
        let (low_tx, low_rx) = unbounded();

        let shared = Arc::new(Shared {
            store: TaskStore::new(self.capacity),
            lanes: [high_tx, normal_tx, low_tx],
            stats: Stats {
                lock: SpinLock::new(),
                tasks_finished: AtomicU64::new(0),
                instances_executed: AtomicU64::new(0),
            },
        });

        let receivers = [high_rx, normal_rx, low_rx];
        let workers = (0..threads)
            .map(|index| {
                let shared = shared.clone();
                let receivers = receivers.clone();
                thread::Builder::new()
                    .name(format!("karakuri-worker-{index}"))
                    .spawn(move || worker_loop(&shared, &receivers, index))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        tracing::debug!(threads, capacity = self.capacity, "thread pool started");

        ThreadPool { shared, workers }
    }
}

/// Task-graph thread pool.
///
/// Tasks are spawned from descriptors ([`TaskDesc`]) and executed by a fixed
/// set of worker threads. A task may depend on one other task, fan out into
/// multiple parallel instances, and, when spawned waitable, be blocked on
/// from outside the pool.
///
/// Dropping the pool first drains every task that was already spawned
/// (including tasks spawned by running tasks in the meantime), then joins
/// the workers. Nothing is silently dropped.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Pool with default worker count and task store capacity.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> PoolBuilder {
        PoolBuilder {
            threads: None,
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Spawns a task, failing with [`SpawnError::StoreFull`] when the task
    /// store is at capacity. That is backpressure, not an error condition:
    /// slots free up as tasks finish, so retrying (or switching to
    /// [`ThreadPool::spawn`]) eventually succeeds.
    pub fn try_spawn(&self, desc: &TaskDesc) -> Result<TaskId, SpawnError> {
        match self.shared.store.try_allocate(desc) {
            Ok(allocation) => {
                if let Some(ready) = allocation.ready {
                    self.shared.enqueue(ready);
                }
                Ok(allocation.id)
            }
            Err(err) => {
                tracing::warn!(
                    capacity = self.shared.store.capacity(),
                    "task store at capacity, spawn rejected"
                );
                Err(err)
            }
        }
    }

    /// Spawns a task, blocking until the task store has a free slot.
    pub fn spawn(&self, desc: &TaskDesc) -> TaskId {
        let allocation = self.shared.store.allocate_blocking(desc);
        if let Some(ready) = allocation.ready {
            self.shared.enqueue(ready);
        }
        allocation.id
    }

    /// Spawns a task, waiting up to `timeout` for a free slot. Fails with
    /// [`SpawnError::Timeout`] when the store stays full the whole time.
    pub fn spawn_timeout(
        &self,
        desc: &TaskDesc,
        timeout: Duration,
    ) -> Result<TaskId, SpawnError> {
        let allocation = self.shared.store.allocate_timeout(desc, timeout)?;
        if let Some(ready) = allocation.ready {
            self.shared.enqueue(ready);
        }
        Ok(allocation.id)
    }

    /// Whether the task reached `Finished`. Stale handles (retired records)
    /// read as finished.
    pub fn is_finished(&self, id: TaskId) -> bool {
        self.shared.store.is_finished(id)
    }

    pub fn wait_for_task(&self, id: TaskId) {
        self.wait_for_tasks(&[id]);
    }

    /// Blocks the calling thread until every listed task has finished.
    ///
    /// Every listed task must have been spawned waitable, and the call must
    /// not come from a pool worker thread; both are contract violations and
    /// panic.
    pub fn wait_for_tasks(&self, ids: &[TaskId]) {
        assert!(
            !IS_WORKER.get(),
            "wait_for_tasks called from a pool worker thread, this can deadlock"
        );

        for &id in ids {
            if let Some(latch) = self.shared.store.wait_handle(id) {
                latch.wait();
                self.shared.store.release_waited(id);
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let _guard = self.shared.stats.lock.acquire();
        PoolStats {
            tasks_finished: self.shared.stats.tasks_finished.load(Ordering::Relaxed),
            instances_executed: self
                .shared
                .stats
                .instances_executed
                .load(Ordering::Relaxed),
        }
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Everything already spawned must still run; drain before asking the
        // workers to stop. Producers are gone at this point, only running
        // tasks can still allocate.
        self.shared.store.wait_drained();

        // One shutdown job per worker; each worker exits on the first one it
        // receives. The lanes are empty after the drain, so these are the
        // only jobs left.
        for _ in &self.workers {
            self.shared.lanes[PRIORITIES - 1].send(Job::Shutdown).unwrap();
        }

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("worker thread panicked during shutdown");
            }
        }

        tracing::debug!("thread pool stopped");
    }
}

fn worker_loop(shared: &Shared, receivers: &[Receiver<Job>; PRIORITIES], thread: usize) {
    IS_WORKER.set(true);

    loop {
        let (id, instance) = match next_job(receivers) {
            Job::Run { id, instance } => (id, instance),
            Job::Shutdown => break,
        };

        let claimed = shared.store.claim(id);

        let span = tracing::span!(
            Level::TRACE,
            "task",
            id = ?id,
            instance,
            name = claimed.name.as_deref().unwrap_or_default(),
        );
        let _enter = span.enter();

        let context = TaskContext {
            task: id,
            instance,
            instances: claimed.instances,
            thread,
        };

        // The callable is caller code; a panic inside it must not take the
        // worker down, and the instance must still report completion so
        // dependents and waiters are not starved.
        let result = catch_unwind(AssertUnwindSafe(|| (claimed.function)(&context)));
        if let Err(panic) = result {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                String::from("unknown payload")
            };
            tracing::error!(task = ?id, instance, "task panicked: {message}");
        }

        {
            let _guard = shared.stats.lock.acquire();
            shared
                .stats
                .instances_executed
                .fetch_add(1, Ordering::Relaxed);
        }

        let completion = shared.store.complete_instance(id);
        if completion.finished {
            shared.finish(completion);
        }
    }
}

/// Pops the next job, preferring higher priority lanes. The preference is
/// best-effort: FIFO order holds within a lane, never across lanes.
fn next_job(receivers: &[Receiver<Job>; PRIORITIES]) -> Job {
    loop {
        for receiver in receivers {
            if let Ok(job) = receiver.try_recv() {
                return job;
            }
        }

        // All lanes empty; block until any of them has a job.
        let mut select = Select::new();
        for receiver in receivers {
            select.recv(receiver);
        }
        let operation = select.select();
        let index = operation.index();
        if let Ok(job) = operation.recv(&receivers[index]) {
            return job;
        }
    }
}
