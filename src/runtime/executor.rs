//! Executor: a scheduler wrapped with context propagation and causality
//! tracking.
//!
//! Every entry point captures the caller's context locals and trace *at the
//! call*, links a new hop, and restores both on whichever thread eventually
//! runs the work.
//!
//! ```ignore
//! let io = ThreadPoolBuilder::new().name("io").build()?;
//!
//! let user = io.exec(async move {
//!     // TENANT.get() sees the caller's value here
//!     fetch_user(id).await
//! });
//! ```

use crate::error::Result;
use crate::promise::{PromiseValue, guarded, guarded_future};
use crate::runtime::context::{self, Execution, enter_context};
use crate::runtime::scheduler::{Hint, Scheduler, Unit};
use crate::task::Task;
use crate::trace::{Hop, HopKind};

use futures::FutureExt;

use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutorId(u64);

struct Inner {
    id: ExecutorId,
    name: Arc<str>,
    scheduler: Box<dyn Scheduler>,
}

/// Handle to a wrapped scheduler. Clones share the same identity.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    pub fn new(name: impl Into<String>, scheduler: impl Scheduler) -> Self {
        let name: String = name.into();
        Self {
            inner: Arc::new(Inner {
                id: ExecutorId(NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed)),
                name: name.into(),
                scheduler: Box::new(scheduler),
            }),
        }
    }

    /// The executor whose work is running on this thread, if any.
    pub fn current() -> Option<Executor> {
        context::current_executor()
    }

    pub fn id(&self) -> ExecutorId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Stops the underlying scheduler. Work it drops is abandoned.
    pub fn shutdown(&self) {
        self.inner.scheduler.shutdown();
    }

    pub(crate) fn submit(&self, hint: Hint, unit: Unit) -> Result<()> {
        self.inner.scheduler.schedule(unit, hint)
    }

    fn hop(&self, kind: HopKind, location: &'static Location<'static>) -> Hop {
        Hop::new(kind, location, Some(self.inner.name.clone()))
    }

    /// Runs `body` as a new task on this executor.
    ///
    /// The task sees the caller's context locals, and a failure (or panic)
    /// inside it carries a trace linking back to this call.
    #[track_caller]
    pub fn exec<T, F>(&self, body: F) -> PromiseValue<T>
    where
        T: Send + Sync + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.spawn(HopKind::Exec, Location::caller(), body)
    }

    pub(crate) fn spawn<T, F>(
        &self,
        kind: HopKind,
        location: &'static Location<'static>,
        body: F,
    ) -> PromiseValue<T>
    where
        T: Send + Sync + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let execution = Execution::fork(self.hop(kind, location));
        let (promise, resolver) = PromiseValue::pending();

        let future = async move {
            let outcome = guarded_future(body).await;
            resolver.settle(outcome.map_err(|e| e.traced(context::current_trace())));
        };

        Task::spawn(self.clone(), execution, future.boxed());
        promise
    }

    /// Runs a synchronous, possibly blocking `body` on this executor.
    #[track_caller]
    pub fn exec_blocking<T, F>(&self, body: F) -> PromiseValue<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let mut execution = Execution::fork(self.hop(HopKind::ExecBlocking, Location::caller()));
        let (promise, resolver) = PromiseValue::pending();
        let executor = self.clone();

        let unit = move || {
            enter_context(Some(&executor), &mut execution, || {
                let outcome = guarded(body);
                resolver.settle(outcome.map_err(|e| e.traced(context::current_trace())));
            });
        };

        if let Err(e) = self.submit(Hint::Blocking, Box::new(unit)) {
            tracing::warn!(executor = %self.name(), error = %e, "blocking body could not be scheduled");
        }
        promise
    }

    /// Runs `supplier` now and pins the continuation of its result to the
    /// calling executor.
    ///
    /// Whatever threads the supplied work completes on, the returned value
    /// settles on the executor that was current at this call, with the
    /// caller's context locals and trace restored. Outside any executor the
    /// supplier's value is returned as is.
    #[track_caller]
    pub fn relay<T, F>(supplier: F) -> PromiseValue<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> PromiseValue<T>,
    {
        let Some(origin) = Executor::current() else {
            return supplier();
        };

        let trace = context::advance_trace(origin.hop(HopKind::Relay, Location::caller()));
        let snapshot = context::capture_snapshot();

        let inner = match guarded(|| Ok(supplier())) {
            Ok(inner) => inner,
            Err(e) => return PromiseValue::rejected(e.traced(Some(trace))),
        };

        let (relayed, resolver) = PromiseValue::pending();
        inner.on_complete(move |outcome| {
            let outcome = outcome.clone();
            let mut execution = Execution::resume(&snapshot, Some(trace));
            let target = origin.clone();

            let unit = move || {
                enter_context(Some(&target), &mut execution, || {
                    resolver.settle(outcome.map_err(|e| e.traced(context::current_trace())));
                });
            };

            if let Err(e) = origin.submit(Hint::NonBlocking, Box::new(unit)) {
                tracing::warn!(executor = %origin.name(), error = %e, "relay could not hop back");
            }
        });

        relayed
    }
}

impl PartialEq for Executor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Executor {}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}
