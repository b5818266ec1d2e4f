//! Context-propagating async primitives over pluggable schedulers.
//!
//! This crate lets asynchronous work hop between thread pools without losing
//! track of *who* it is running for or *how* it got there.
//!
//! # Architecture
//!
//! - **PromiseValue**: single-assignment value with observers, combinators and `.await`
//! - **ContextLocal**: variable scoped to a logical execution instead of a thread
//! - **Snapshot**: immutable capture of every active context local
//! - **Executor**: wraps a [`Scheduler`] and carries locals and traces across every hop
//! - **Trace**: linked record of scheduling hops, attached to errors for reporting
//! - **SerialQueue**: one-at-a-time execution per key with a bounded wait
//! - **AsyncSequence / Yielding**: pull-based sequences with cooperative checkpoints
//! - **ThreadPoolBuilder**: fluent builder for pool-backed executors
//! - **Timer**: `sleep` futures and deadline callbacks on a shared timer thread
//!
//! # Example
//!
//! ```ignore
//! use weft::{ContextLocal, ThreadPoolBuilder};
//! use std::time::Duration;
//!
//! static TENANT: ContextLocal<String> = ContextLocal::new("tenant");
//!
//! let pool = ThreadPoolBuilder::new().name("app").build()?;
//! let greeting = TENANT.exec("acme".to_string(), || {
//!     pool.exec(async { Ok(format!("hello {}", TENANT.get().unwrap_or_default())) })
//! })?;
//! assert_eq!(greeting.block(Duration::from_secs(1))?, "hello acme");
//! ```

mod builder;
pub mod config;
pub mod context;
mod error;
pub mod logging;
mod promise;
mod runtime;
mod sequence;
mod serial;
mod task;
mod timer;
mod trace;

pub use builder::ThreadPoolBuilder;
pub use config::RuntimeConfig;
pub use context::{AnyLocal, Bindings, Codec, ContextLocal, LocalId, Scoped, Snapshot};
pub use error::{Error, ErrorKind, Report, Result};
pub use logging::{LogFormat, LoggingConfig, init_logging};
pub use promise::{ErrAs, PromiseValue, Resolver, all};
pub use runtime::{
    Executor, ExecutorId, Hint, Inline, Scheduler, ThreadPerTask, ThreadPool, Unit, yield_now,
};
pub use sequence::{AsyncSequence, IterSequence, Yielding, collect_all};
pub use serial::SerialQueue;
pub use timer::{Sleep, TimerHandle, after, pending_timers, sleep};
pub use trace::{Hop, HopError, HopKind, Trace};
