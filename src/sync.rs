//! Small concurrency primitives shared across components. §9 calls for
//! "a semaphore (permits) + a notification primitive" rather than a plain
//! message channel: `queue::AnnouncementQueue` is the notification half,
//! `Semaphore` here is the permit half used by the crawl coordinator to
//! bound concurrent workers.

use std::sync::{Arc, Condvar, Mutex};

struct Inner {
    available: usize,
}

struct SemaphoreState {
    inner: Mutex<Inner>,
    cond: Condvar,
}

#[derive(Clone)]
pub struct Semaphore(Arc<SemaphoreState>);

pub struct Permit(Arc<SemaphoreState>);

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        Semaphore(Arc::new(SemaphoreState {
            inner: Mutex::new(Inner { available: capacity }),
            cond: Condvar::new(),
        }))
    }

    /// Blocks until a permit is available. This is the backpressure point
    /// named in §4.7 step 2.
    pub fn acquire(&self) -> Permit {
        let mut inner = self.0.inner.lock().unwrap();
        while inner.available == 0 {
            inner = self.0.cond.wait(inner).unwrap();
        }
        inner.available -= 1;
        Permit(self.0.clone())
    }

    pub fn available(&self) -> usize {
        self.0.inner.lock().unwrap().available
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut inner = self.0.inner.lock().unwrap();
        inner.available += 1;
        drop(inner);
        self.0.cond.notify_one();
    }
}
