//! Concurrency gate for mutating operations, interlocked with garbage
//! collection.
//!
//! Mutating manifest operations (create/commit/clone/delete version) hold a
//! permit for their whole critical section. GC may only start once the
//! active count drops to zero; while GC runs, new permits wait.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

struct GateState {
    active: usize,
    gc_running: bool,
}

struct GateInner {
    semaphore: Arc<Semaphore>,
    state: Mutex<GateState>,
    /// Signaled when the active count returns to zero.
    idle: Notify,
    /// Signaled when a GC sweep finishes.
    gc_done: Notify,
}

#[derive(Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

impl Gate {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                semaphore: Arc::new(Semaphore::new(limit.max(1))),
                state: Mutex::new(GateState {
                    active: 0,
                    gc_running: false,
                }),
                idle: Notify::new(),
                gc_done: Notify::new(),
            }),
        }
    }

    /// Take a permit for a mutating operation. Waits while the semaphore is
    /// saturated or a GC sweep is in progress. The permit releases on drop,
    /// on every exit path.
    pub async fn acquire(&self) -> GatePermit {
        loop {
            // Register interest before the check so a wakeup between check
            // and await is not lost.
            let gc_done = self.inner.gc_done.notified();
            if self.inner.state.lock().gc_running {
                gc_done.await;
                continue;
            }

            let permit = Arc::clone(&self.inner.semaphore)
                .acquire_owned()
                .await
                .expect("gate semaphore never closes");

            let mut state = self.inner.state.lock();
            if state.gc_running {
                // GC slipped in while we waited on the semaphore; retry.
                drop(state);
                drop(permit);
                continue;
            }
            state.active += 1;
            return GatePermit {
                inner: Arc::clone(&self.inner),
                _permit: permit,
            };
        }
    }

    /// Block until no mutating operation is active, then mark GC as running.
    /// The returned guard unblocks waiters when dropped.
    pub async fn begin_gc(&self) -> GcGuard {
        loop {
            let idle = self.inner.idle.notified();
            {
                let mut state = self.inner.state.lock();
                if state.active == 0 && !state.gc_running {
                    state.gc_running = true;
                    return GcGuard {
                        inner: Arc::clone(&self.inner),
                    };
                }
            }
            idle.await;
        }
    }

    pub fn active(&self) -> usize {
        self.inner.state.lock().active
    }

    pub fn gc_running(&self) -> bool {
        self.inner.state.lock().gc_running
    }
}

pub struct GatePermit {
    inner: Arc<GateInner>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.active -= 1;
        if state.active == 0 {
            self.inner.idle.notify_waiters();
        }
    }
}

pub struct GcGuard {
    inner: Arc<GateInner>,
}

impl Drop for GcGuard {
    fn drop(&mut self) {
        self.inner.state.lock().gc_running = false;
        self.inner.gc_done.notify_waiters();
    }
}
