//! Runtime subsystem modules.

pub(crate) mod context;
pub(crate) mod executor;
pub(crate) mod pool;
pub(crate) mod queue;
pub mod scheduler;
pub(crate) mod yield_now;

pub use executor::{Executor, ExecutorId};
pub use pool::ThreadPool;
pub use scheduler::{Hint, Inline, Scheduler, ThreadPerTask, Unit};
pub use yield_now::yield_now;
