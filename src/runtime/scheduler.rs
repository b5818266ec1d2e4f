//! The scheduling seam: anything that can run a unit of work on some thread.
//!
//! An [`Executor`](crate::Executor) wraps one `Scheduler` and adds context
//! propagation and causality tracking on top. Schedulers themselves know
//! nothing about either; they only run closures.

use crate::error::{Error, ErrorKind, Result};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// A unit of work handed to a scheduler.
pub type Unit = Box<dyn FnOnce() + Send + 'static>;

/// How a unit is expected to behave once it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hint {
    /// Polls a task and returns promptly.
    NonBlocking,
    /// May block its thread for a long time (`exec_blocking` bodies).
    Blocking,
}

/// Runs units of work.
pub trait Scheduler: Send + Sync + 'static {
    /// Queues `unit` to run later on one of the scheduler's threads.
    ///
    /// A scheduler that refuses the unit drops it and reports
    /// [`ErrorKind::Shutdown`].
    fn schedule(&self, unit: Unit, hint: Hint) -> Result<()>;

    /// Stops accepting work. Units already queued may be dropped.
    fn shutdown(&self) {}
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
    fn schedule(&self, unit: Unit, hint: Hint) -> Result<()> {
        (**self).schedule(unit, hint)
    }

    fn shutdown(&self) {
        (**self).shutdown()
    }
}

/// Starts a fresh named thread for every unit.
///
/// Useful when a caller must observe that work resumed on a thread other than
/// the one that scheduled it.
pub struct ThreadPerTask {
    name: String,
    spawned: AtomicUsize,
}

impl ThreadPerTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spawned: AtomicUsize::new(0),
        }
    }
}

impl Scheduler for ThreadPerTask {
    fn schedule(&self, unit: Unit, _hint: Hint) -> Result<()> {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("{}-{n}", self.name))
            .spawn(unit)
            .map(drop)
            .map_err(|e| Error::new(ErrorKind::Spawn).with_source(e))
    }
}

/// Runs every unit immediately on the scheduling thread.
///
/// Handy in tests; a unit that schedules more inline work recurses.
#[derive(Debug, Default, Clone, Copy)]
pub struct Inline;

impl Scheduler for Inline {
    fn schedule(&self, unit: Unit, _hint: Hint) -> Result<()> {
        unit();
        Ok(())
    }
}
