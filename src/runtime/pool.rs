//! Fixed-size thread pool scheduler.
//!
//! Workers pull units from a shared [`Injector`] in FIFO order. A pool built
//! with blocking threads keeps a second lane so long-running
//! [`Hint::Blocking`] units cannot starve task polls.

use crate::error::{Error, ErrorKind, Result};
use crate::runtime::queue::Injector;
use crate::runtime::scheduler::{Hint, Scheduler, Unit};

use parking_lot::Mutex;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

struct Lane {
    injector: Arc<Injector>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Lane {
    fn start(name: &str, threads: usize) -> Result<Self> {
        let injector = Arc::new(Injector::new());
        let mut workers = Vec::with_capacity(threads);

        for id in 0..threads {
            let worker = Worker {
                id,
                injector: injector.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("{name}-{id}"))
                .spawn(move || worker.run());

            match handle {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    injector.shutdown();
                    return Err(Error::new(ErrorKind::Spawn).with_source(e));
                }
            }
        }

        Ok(Self {
            injector,
            workers: Mutex::new(workers),
        })
    }

    fn stop(&self) {
        // Dropped outside the queue lock: dropping a unit may settle promises.
        drop(self.injector.shutdown());

        let current = thread::current().id();
        for handle in self.workers.lock().drain(..) {
            // A pool released by its own worker cannot join that worker.
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

struct Worker {
    id: usize,
    injector: Arc<Injector>,
}

impl Worker {
    fn run(&self) {
        tracing::trace!(worker = self.id, "worker started");

        while let Some(unit) = self.injector.pop_blocking() {
            if std::panic::catch_unwind(AssertUnwindSafe(unit)).is_err() {
                tracing::error!(worker = self.id, "unit of work panicked");
            }
        }

        tracing::trace!(worker = self.id, "worker stopped");
    }
}

/// A pool of named worker threads.
///
/// Stops its workers when dropped; units still queued are dropped unrun.
pub struct ThreadPool {
    name: String,
    general: Lane,
    blocking: Option<Lane>,
}

impl ThreadPool {
    /// Starts `worker_threads` workers named `<name>-<n>`, plus
    /// `blocking_threads` workers named `<name>-blocking-<n>` when non-zero.
    pub fn new(name: impl Into<String>, worker_threads: usize, blocking_threads: usize) -> Result<Self> {
        let name = name.into();
        let general = Lane::start(&name, worker_threads.max(1))?;
        let blocking = match blocking_threads {
            0 => None,
            n => match Lane::start(&format!("{name}-blocking"), n) {
                Ok(lane) => Some(lane),
                Err(e) => {
                    general.stop();
                    return Err(e);
                }
            },
        };

        tracing::debug!(pool = %name, worker_threads, blocking_threads, "thread pool started");

        Ok(Self {
            name,
            general,
            blocking,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Units waiting for a worker, across lanes.
    pub fn queued(&self) -> usize {
        self.general.injector.len() + self.blocking.as_ref().map_or(0, |l| l.injector.len())
    }

    fn lane(&self, hint: Hint) -> &Lane {
        match (hint, &self.blocking) {
            (Hint::Blocking, Some(lane)) => lane,
            _ => &self.general,
        }
    }
}

impl Scheduler for ThreadPool {
    fn schedule(&self, unit: Unit, hint: Hint) -> Result<()> {
        self.lane(hint).injector.push(unit).map_err(|unit| {
            drop(unit);
            Error::new(ErrorKind::Shutdown).with_message(format!("pool `{}` is shut down", self.name))
        })
    }

    fn shutdown(&self) {
        if self.general.injector.is_shutdown() {
            return;
        }
        tracing::debug!(pool = %self.name, "shutting down thread pool");
        self.general.stop();
        if let Some(lane) = &self.blocking {
            lane.stop();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
