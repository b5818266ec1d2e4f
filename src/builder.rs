//! Fluent builder for thread-pool executors.

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::runtime::{Executor, ThreadPool};

/// Builds an [`Executor`] over a fresh [`ThreadPool`].
///
/// # Example
/// ```ignore
/// let io = ThreadPoolBuilder::new()
///     .name("io")
///     .worker_threads(4)
///     .blocking_threads(2)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct ThreadPoolBuilder {
    name: String,
    worker_threads: usize,
    blocking_threads: usize,
}

impl Default for ThreadPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadPoolBuilder {
    /// Starts from the built-in defaults.
    pub fn new() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }

    /// Starts from a loaded configuration.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            name: config.thread_name.clone(),
            worker_threads: config.resolved_worker_threads(),
            blocking_threads: config.blocking_threads,
        }
    }

    /// Names the executor. Worker threads are called `<name>-<n>`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Threads polling tasks. Values below one are raised to one.
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n.max(1);
        self
    }

    /// Dedicated threads for blocking bodies; zero shares the workers.
    pub fn blocking_threads(mut self, n: usize) -> Self {
        self.blocking_threads = n;
        self
    }

    /// Starts the pool's threads and wraps the pool in an executor.
    pub fn build(self) -> Result<Executor> {
        let pool = ThreadPool::new(self.name.clone(), self.worker_threads, self.blocking_threads)?;
        Ok(Executor::new(self.name, pool))
    }
}
