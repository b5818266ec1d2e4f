//! Composable single-assignment values.
//!
//! A [`PromiseValue`] is pending until its [`Resolver`] settles it, fulfilled
//! or rejected, exactly once. Observers registered with
//! [`PromiseValue::on_complete`] run once each, in registration order, right
//! after the transition (or immediately, if the value has already settled).
//!
//! `PromiseValue` is also a [`Future`], so inside an executor the suspension
//! point is simply `.await`:
//!
//! ```ignore
//! let user = pool.exec(async { load_user(7).await });
//! let name = user.map(|u| u.name).await?;
//! ```
//!
//! # How awaiting resumes
//!
//! 1. Polling a pending value registers the polling task's waker as an observer
//! 2. The task returns `Poll::Pending` and its worker thread moves on
//! 3. Settling runs the observer, which hands the task back to *its own*
//!    executor's queue
//! 4. The task is polled again there with its context locals restored

use crate::error::{Error, ErrorKind, Result};
use crate::runtime::context;
use crate::trace::{Hop, HopKind};

use futures::FutureExt;
use parking_lot::{Condvar, Mutex};

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, Location};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

type Observer<T> = Box<dyn FnOnce(&Result<T>) + Send>;

enum State<T> {
    Pending {
        observers: Vec<(u64, Observer<T>)>,
        next_key: u64,
    },
    Settled {
        outcome: Arc<Result<T>>,
        // Observers registered while the settling thread is still running
        // earlier ones. `None` once that thread is done.
        late: Option<Vec<Observer<T>>>,
    },
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

impl<T> Shared<T> {
    fn new(state: State<T>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    fn settle(&self, outcome: Result<T>) -> bool {
        let outcome = Arc::new(outcome);

        let mut batch: Vec<Observer<T>> = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Settled { .. } => return false,
                State::Pending { observers, .. } => {
                    let observers = std::mem::take(observers);
                    *state = State::Settled {
                        outcome: outcome.clone(),
                        late: Some(Vec::new()),
                    };
                    observers.into_iter().map(|(_, observer)| observer).collect()
                }
            }
        };

        loop {
            for observer in batch {
                observer(&outcome);
            }

            let mut state = self.state.lock();
            let State::Settled { late, .. } = &mut *state else {
                return true;
            };
            let more = late.as_mut().map(std::mem::take).unwrap_or_default();
            if more.is_empty() {
                *late = None;
                return true;
            }
            batch = more;
        }
    }

    /// Registers `observer`, returning its key while the value is pending.
    ///
    /// On a settled value the observer runs right away, or is queued behind
    /// the observers the settling thread has yet to run.
    fn observe(&self, observer: Observer<T>) -> Option<u64> {
        let outcome = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Pending {
                    observers,
                    next_key,
                } => {
                    let key = *next_key;
                    *next_key += 1;
                    observers.push((key, observer));
                    return Some(key);
                }
                State::Settled {
                    late: Some(late), ..
                } => {
                    late.push(observer);
                    return None;
                }
                State::Settled { outcome, late: None } => outcome.clone(),
            }
        };
        observer(&outcome);
        None
    }

    /// Drops a still-pending observer registered under `key`.
    fn forget(&self, key: u64) {
        let removed = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Pending { observers, .. } => observers
                    .iter()
                    .position(|(k, _)| *k == key)
                    .map(|position| observers.remove(position)),
                State::Settled { .. } => None,
            }
        };
        drop(removed);
    }

    fn outcome(&self) -> Option<Arc<Result<T>>> {
        match &*self.state.lock() {
            State::Pending { .. } => None,
            State::Settled { outcome, .. } => Some(outcome.clone()),
        }
    }
}

/// Waker slot a polled handle registered as an observer.
struct Registration {
    key: u64,
    waker: Arc<Mutex<Option<Waker>>>,
}

/// Handle to a value that may not exist yet.
///
/// Cloning yields another handle to the same value.
pub struct PromiseValue<T> {
    shared: Arc<Shared<T>>,
    // Registered by this handle when polled as a future.
    registration: Option<Registration>,
    // Suspend on the first poll even if already settled.
    checkpoint: bool,
    // Yield checkpoints record their own hop, not an await.
    silent: bool,
}

impl<T> Clone for PromiseValue<T> {
    fn clone(&self) -> Self {
        Self::from_shared(self.shared.clone())
    }
}

impl<T> Drop for PromiseValue<T> {
    fn drop(&mut self) {
        // Release the waker so an abandoned await does not keep its task alive.
        if let Some(registration) = self.registration.take() {
            registration.waker.lock().take();
            self.shared.forget(registration.key);
        }
    }
}

/// The settling side of a [`PromiseValue`].
///
/// Dropping a resolver that has not settled rejects the value with
/// [`ErrorKind::Abandoned`].
pub struct Resolver<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Resolver<T> {
    /// Settles the value. Returns `false` if it was already settled.
    pub fn settle(mut self, outcome: Result<T>) -> bool {
        match self.shared.take() {
            Some(shared) => shared.settle(outcome),
            None => false,
        }
    }

    pub fn resolve(self, value: T) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(self, error: Error) -> bool {
        self.settle(Err(error))
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.settle(Err(Error::new(ErrorKind::Abandoned)));
        }
    }
}

impl<T> PromiseValue<T> {
    fn from_shared(shared: Arc<Shared<T>>) -> Self {
        Self {
            shared,
            registration: None,
            checkpoint: false,
            silent: false,
        }
    }

    fn settled(outcome: Result<T>) -> Self {
        Self::from_shared(Shared::new(State::Settled {
            outcome: Arc::new(outcome),
            late: None,
        }))
    }

    /// An unsettled value and the resolver that settles it.
    pub fn pending() -> (Self, Resolver<T>) {
        let shared = Shared::new(State::Pending {
            observers: Vec::new(),
            next_key: 0,
        });
        (
            Self::from_shared(shared.clone()),
            Resolver {
                shared: Some(shared),
            },
        )
    }

    /// Already fulfilled with `value`.
    pub fn result(value: T) -> Self {
        Self::settled(Ok(value))
    }

    /// Already rejected with `error`.
    pub fn rejected(error: Error) -> Self {
        Self::settled(Err(error))
    }

    /// Runs `supplier` now. An `Err` or a panic becomes a rejection.
    pub fn from_fn(supplier: impl FnOnce() -> Result<T>) -> Self {
        let outcome = guarded(supplier).map_err(|e| e.traced(context::current_trace()));
        Self::settled(outcome)
    }

    pub fn is_settled(&self) -> bool {
        matches!(*self.shared.state.lock(), State::Settled { .. })
    }

    /// Registers `observer` to run once the value settles.
    ///
    /// Runs it on the calling thread right away if the value already settled.
    pub fn on_complete(&self, observer: impl FnOnce(&Result<T>) + Send + 'static) {
        self.shared.observe(Box::new(observer));
    }

    /// Makes the first poll of this handle suspend and requeue the polling
    /// task, even when the value has already settled.
    pub(crate) fn into_checkpoint(mut self) -> Self {
        self.checkpoint = true;
        self.silent = true;
        self
    }
}

impl<T: Clone + Send + Sync + 'static> PromiseValue<T> {
    /// The settled outcome, if any.
    pub fn peek(&self) -> Option<Result<T>> {
        self.shared.outcome().map(|outcome| (*outcome).clone())
    }

    /// Derives a value by transforming a fulfillment.
    ///
    /// A rejection passes through without invoking `f`.
    pub fn map<U, F>(&self, f: F) -> PromiseValue<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.try_map(move |value| Ok(f(value)))
    }

    /// Like [`map`](Self::map), but `f` may fail.
    ///
    /// A failure (or panic) in `f` rejects the derived value and records the
    /// causality trace active where `try_map` was called.
    pub fn try_map<U, F>(&self, f: F) -> PromiseValue<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let trace = context::current_trace();
        let (derived, resolver) = PromiseValue::pending();

        self.on_complete(move |outcome| {
            let next = match outcome {
                Ok(value) => {
                    let value = value.clone();
                    guarded(move || f(value))
                }
                Err(e) => Err(e.clone()),
            };
            resolver.settle(next.map_err(|e| e.traced(trace)));
        });

        derived
    }

    /// Derives a value from another asynchronous step.
    pub fn flat_map<U, F>(&self, f: F) -> PromiseValue<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> PromiseValue<U> + Send + 'static,
    {
        let trace = context::current_trace();
        let (derived, resolver) = PromiseValue::pending();

        self.on_complete(move |outcome| match outcome {
            Ok(value) => {
                let value = value.clone();
                match guarded(move || Ok(f(value))) {
                    Ok(next) => next.on_complete(move |outcome| {
                        resolver.settle(outcome.clone().map_err(|e| e.traced(trace)));
                    }),
                    Err(e) => {
                        resolver.reject(e.traced(trace));
                    }
                }
            }
            Err(e) => {
                resolver.reject(e.clone().traced(trace));
            }
        });

        derived
    }

    /// Turns a rejection back into an outcome via `f`.
    pub fn recover<F>(&self, f: F) -> PromiseValue<T>
    where
        F: FnOnce(Error) -> Result<T> + Send + 'static,
    {
        let (derived, resolver) = PromiseValue::pending();

        self.on_complete(move |outcome| {
            let next = match outcome {
                Ok(value) => Ok(value.clone()),
                Err(e) => {
                    let e = e.clone();
                    guarded(move || f(e))
                }
            };
            resolver.settle(next);
        });

        derived
    }

    /// Awaits this value, letting rejections caused by an `E` surface as that
    /// `E` directly. Any other rejection is converted with `E::from`.
    pub fn err_as<E>(self) -> ErrAs<T, E>
    where
        E: std::error::Error + Clone + From<Error> + 'static,
    {
        ErrAs {
            inner: self,
            _error: PhantomData,
        }
    }

    /// Blocks the calling thread until the value settles or `timeout` passes.
    ///
    /// Meant for top-level callers. Expiry fails with
    /// [`ErrorKind::BlockTimeout`] and leaves the computation running. A
    /// timeout too large to express as a deadline waits forever.
    pub fn block(&self, timeout: Duration) -> Result<T> {
        self.block_until(Instant::now().checked_add(timeout), timeout)
    }

    /// Blocks the calling thread until the value settles.
    pub fn block_forever(&self) -> Result<T> {
        self.block_until(None, Duration::ZERO)
    }

    fn block_until(&self, deadline: Option<Instant>, timeout: Duration) -> Result<T> {
        if context::inside_executor() {
            tracing::warn!("blocking an executor thread on a promise; prefer `.await`");
        }

        if let Some(outcome) = self.shared.outcome() {
            return Self::observed((*outcome).clone());
        }

        let gate = Arc::new((Mutex::new(None::<Result<T>>), Condvar::new()));
        let key = {
            let gate = gate.clone();
            let observer: Observer<T> = Box::new(move |outcome: &Result<T>| {
                *gate.0.lock() = Some(outcome.clone());
                gate.1.notify_all();
            });
            self.shared.observe(observer)
        };

        let (slot, condvar) = &*gate;
        let mut slot = slot.lock();
        loop {
            if let Some(outcome) = slot.take() {
                return Self::observed(outcome);
            }
            match deadline {
                Some(deadline) => {
                    if condvar.wait_until(&mut slot, deadline).timed_out() && slot.is_none() {
                        drop(slot);
                        // A timed-out wait must not stay registered.
                        if let Some(key) = key {
                            self.shared.forget(key);
                        }
                        return Err(Error::new(ErrorKind::BlockTimeout)
                            .with_message(format!("gave up after {timeout:?}")));
                    }
                }
                None => condvar.wait(&mut slot),
            }
        }
    }

    fn observed(outcome: Result<T>) -> Result<T> {
        if let Err(e) = &outcome {
            tracing::debug!(error = %e.report(), "blocking wait observed a rejection");
        }
        outcome
    }

    /// Observers still waiting for this value to settle.
    pub fn pending_observers(&self) -> usize {
        match &*self.shared.state.lock() {
            State::Pending { observers, .. } => observers.len(),
            State::Settled { .. } => 0,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Future for PromiseValue<T> {
    type Output = Result<T>;

    /// The first poll that finds the value pending records an await hop at
    /// the `.await` on the running execution's trace.
    #[track_caller]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let location = Location::caller();
        let mut state = this.shared.state.lock();

        if std::mem::take(&mut this.checkpoint) && matches!(*state, State::Settled { .. }) {
            drop(state);
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }

        let first_suspension = match &mut *state {
            State::Settled { outcome, .. } => return Poll::Ready((**outcome).clone()),
            State::Pending {
                observers,
                next_key,
            } => match &this.registration {
                Some(registration) => {
                    *registration.waker.lock() = Some(cx.waker().clone());
                    false
                }
                None => {
                    let waker = Arc::new(Mutex::new(Some(cx.waker().clone())));
                    let observer_slot = waker.clone();
                    let observer: Observer<T> = Box::new(move |_: &Result<T>| {
                        if let Some(waker) = observer_slot.lock().take() {
                            waker.wake();
                        }
                    });
                    let key = *next_key;
                    *next_key += 1;
                    observers.push((key, observer));
                    this.registration = Some(Registration { key, waker });
                    true
                }
            },
        };
        drop(state);

        if first_suspension
            && !this.silent
            && let Some(executor) = context::current_executor()
        {
            context::advance_trace(Hop::new(
                HopKind::Await,
                location,
                Some(executor.name().into()),
            ));
        }
        Poll::Pending
    }
}

impl<T> From<Result<T>> for PromiseValue<T> {
    fn from(outcome: Result<T>) -> Self {
        Self::settled(outcome)
    }
}

impl<T> fmt::Debug for PromiseValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.shared.state.lock() {
            State::Pending { .. } => "pending",
            State::Settled { outcome, .. } if outcome.is_ok() => "fulfilled",
            State::Settled { .. } => "rejected",
        };
        f.debug_struct("PromiseValue").field("state", &state).finish()
    }
}

/// Future returned by [`PromiseValue::err_as`].
pub struct ErrAs<T, E> {
    inner: PromiseValue<T>,
    _error: PhantomData<fn() -> E>,
}

impl<T, E> Future for ErrAs<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: std::error::Error + Clone + From<Error> + 'static,
{
    type Output = std::result::Result<T, E>;

    #[track_caller]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll(cx).map(|outcome| {
            outcome.map_err(|e| match e.source_as::<E>() {
                Some(declared) => declared.clone(),
                None => E::from(e),
            })
        })
    }
}

/// Settles once every input settles, keeping input order. The first rejection
/// wins.
pub fn all<T: Clone + Send + Sync + 'static>(promises: Vec<PromiseValue<T>>) -> PromiseValue<Vec<T>> {
    if promises.is_empty() {
        return PromiseValue::result(Vec::new());
    }

    struct Gather<T> {
        values: Vec<Option<T>>,
        remaining: usize,
        resolver: Option<Resolver<Vec<T>>>,
    }

    let (combined, resolver) = PromiseValue::pending();
    let gather = Arc::new(Mutex::new(Gather {
        values: vec![None; promises.len()],
        remaining: promises.len(),
        resolver: Some(resolver),
    }));

    for (index, promise) in promises.iter().enumerate() {
        let gather = gather.clone();
        promise.on_complete(move |outcome| {
            let mut gather = gather.lock();
            match outcome {
                Ok(value) => {
                    gather.values[index] = Some(value.clone());
                    gather.remaining -= 1;
                    if gather.remaining == 0
                        && let Some(resolver) = gather.resolver.take()
                    {
                        let values = gather.values.iter_mut().filter_map(Option::take).collect();
                        drop(gather);
                        resolver.resolve(values);
                    }
                }
                Err(e) => {
                    if let Some(resolver) = gather.resolver.take() {
                        drop(gather);
                        resolver.reject(e.clone());
                    }
                }
            }
        });
    }

    combined
}

/// Runs `body`, turning a panic into an [`ErrorKind::Panicked`] rejection.
pub(crate) fn guarded<R>(body: impl FnOnce() -> Result<R>) -> Result<R> {
    std::panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| {
        let error = Error::from_panic(payload);
        tracing::error!(%error, "promise step panicked");
        Err(error)
    })
}

/// Future adapter that turns a panic while polling into a rejection.
pub(crate) async fn guarded_future<T>(future: impl Future<Output = Result<T>>) -> Result<T> {
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            let error = Error::from_panic(payload);
            tracing::error!(%error, "task body panicked");
            Err(error)
        })
}
