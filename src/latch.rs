use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// One-shot signaling primitive.
///
/// A latch starts out unsignaled and transitions to signaled exactly once via
/// [`Latch::set`]; further calls are no-ops. It never resets: it is a gate,
/// not a reusable semaphore. The thread pool attaches one to every waitable
/// task and signals it at the task's finish transition.
pub struct Latch {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Signals the latch, waking every current and future waiter. Idempotent.
    pub fn set(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        if !*signaled {
            *signaled = true;
            self.cond.notify_all();
        }
    }

    pub fn is_set(&self) -> bool {
        *self.signaled.lock().unwrap()
    }

    /// Blocks the calling thread until the latch is signaled.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cond.wait(signaled).unwrap();
        }
    }

    /// Blocks until the latch is signaled or the timeout elapses. Returns
    /// whether the latch was signaled. Does not affect the latch itself.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (guard, _) = self.cond.wait_timeout(signaled, left).unwrap();
            signaled = guard;
        }

        true
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_after_set() {
        let latch = Arc::new(Latch::new());

        let handle = thread::spawn({
            let latch = latch.clone();
            move || {
                thread::sleep(Duration::from_millis(20));
                latch.set();
            }
        });

        latch.wait();
        assert!(latch.is_set());
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires_when_never_set() {
        let latch = Latch::new();
        assert!(!latch.wait_timeout(Duration::from_millis(20)));
        assert!(!latch.is_set());
    }

    #[test]
    fn wait_timeout_observes_signal() {
        let latch = Arc::new(Latch::new());

        let handle = thread::spawn({
            let latch = latch.clone();
            move || {
                thread::sleep(Duration::from_millis(10));
                latch.set();
            }
        });

        assert!(latch.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn set_is_idempotent_for_multiple_waiters() {
        let latch = Arc::new(Latch::new());
        latch.set();
        latch.set();

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let latch = latch.clone();
                thread::spawn(move || latch.wait())
            })
            .collect();

        for waiter in waiters {
            waiter.join().unwrap();
        }
    }
}
