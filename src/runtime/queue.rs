//! Shared FIFO injector feeding a pool's worker threads.
//!
//! Units are pushed by any thread and popped by whichever worker wakes first.
//! Idle workers park on the condvar instead of spinning.

use crate::runtime::scheduler::Unit;

use parking_lot::{Condvar, Mutex};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) struct Injector {
    queue: Mutex<VecDeque<Unit>>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

impl Injector {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Enqueues `unit` behind everything already queued.
    ///
    /// Hands the unit back if the injector is shut down.
    pub(crate) fn push(&self, unit: Unit) -> Result<(), Unit> {
        let mut queue = self.queue.lock();
        if self.is_shutdown() {
            return Err(unit);
        }
        queue.push_back(unit);
        self.condvar.notify_one();
        Ok(())
    }

    /// Blocks until a unit is available. `None` once shut down.
    pub(crate) fn pop_blocking(&self) -> Option<Unit> {
        let mut queue = self.queue.lock();
        loop {
            if self.is_shutdown() {
                return None;
            }
            if let Some(unit) = queue.pop_front() {
                return Some(unit);
            }
            self.condvar.wait(&mut queue);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Stops accepting work and wakes every parked worker.
    ///
    /// Returns the units that never ran so the caller can drop them outside
    /// the lock.
    pub(crate) fn shutdown(&self) -> VecDeque<Unit> {
        let mut queue = self.queue.lock();
        self.shutdown.store(true, Ordering::Release);
        self.condvar.notify_all();
        std::mem::take(&mut *queue)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}
