//! Per-key serialization of asynchronous work.
//!
//! A [`SerialQueue`] guarantees that at most one body per key is running at a
//! time. Bodies for the same key start in submission order, each only after
//! the previous one's promise settled. Bodies for different keys never wait
//! on each other.
//!
//! ```ignore
//! let accounts = SerialQueue::new(pool.clone());
//!
//! accounts.exec(account_id, Duration::from_secs(5), move || async move {
//!     let balance = load(account_id).await?;
//!     store(account_id, balance + amount).await
//! });
//! ```
//!
//! State lives in a fixed set of shards keyed by hash, so unrelated keys
//! rarely contend on the same lock. A key's entry exists only while a body
//! runs or waits; it is removed as soon as the key goes quiet.

use crate::config::RuntimeConfig;
use crate::context::snapshot::Snapshot;
use crate::error::{Error, ErrorKind, Result};
use crate::promise::{PromiseValue, Resolver};
use crate::runtime::context::{self, Execution, enter_context};
use crate::runtime::executor::Executor;
use crate::timer::{self, TimerHandle};
use crate::trace::{HopKind, Trace};

use parking_lot::Mutex;

use std::collections::hash_map::RandomState;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::hash::{BuildHasher, Hash};
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const SHARDS: usize = 16;

/// A submitted body, type-erased so entries of any output type share a backlog.
trait Pending<K>: Send {
    /// Starts the body. `deferred` is set when it waited behind other entries.
    fn start(self: Box<Self>, queue: &SerialQueue<K>, deferred: bool);

    /// Rejects the entry without running its body.
    fn time_out(self: Box<Self>, waited: Duration);
}

struct Waiting<K> {
    id: u64,
    entry: Box<dyn Pending<K>>,
    timer: Option<TimerHandle>,
}

struct KeyState<K> {
    backlog: VecDeque<Waiting<K>>,
}

impl<K> Default for KeyState<K> {
    fn default() -> Self {
        Self {
            backlog: VecDeque::new(),
        }
    }
}

struct Inner<K> {
    shards: Box<[Mutex<HashMap<K, KeyState<K>>>]>,
    hasher: RandomState,
    fallback: Executor,
    lock_timeout: Duration,
    next_id: AtomicU64,
}

/// Runs asynchronous bodies one at a time per key.
pub struct SerialQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for SerialQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> SerialQueue<K>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + 'static,
{
    /// Bodies submitted outside any executor run on `fallback`. [`run`]
    /// waits for the default configured lock timeout.
    ///
    /// [`run`]: Self::run
    pub fn new(fallback: Executor) -> Self {
        Self::from_config(fallback, &RuntimeConfig::default())
    }

    /// Like [`new`](Self::new), with [`run`](Self::run) bounded by the
    /// configured `lock_timeout_ms`.
    pub fn from_config(fallback: Executor, config: &RuntimeConfig) -> Self {
        let shards = (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            inner: Arc::new(Inner {
                shards,
                hasher: RandomState::new(),
                fallback,
                lock_timeout: config.lock_timeout(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Lock timeout used by [`run`](Self::run).
    pub fn lock_timeout(&self) -> Duration {
        self.inner.lock_timeout
    }

    fn shard(&self, key: &K) -> &Mutex<HashMap<K, KeyState<K>>> {
        let index = self.inner.hasher.hash_one(key) as usize % self.inner.shards.len();
        &self.inner.shards[index]
    }

    /// Runs `body` once every earlier body for `key` has settled.
    ///
    /// If the body cannot start within `lock_timeout`, the returned value
    /// rejects with [`ErrorKind::LockTimeout`] and the body never runs. A
    /// running body is never interrupted. A deferred body starts with no
    /// context locals active; use [`exec_preserving`](Self::exec_preserving)
    /// to keep the submitter's.
    #[track_caller]
    pub fn exec<T, F, Fut>(&self, key: K, lock_timeout: Duration, body: F) -> PromiseValue<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (promise, resolver) = PromiseValue::pending();
        self.submit(key, lock_timeout, body, resolver, None, Location::caller());
        promise
    }

    /// [`exec`](Self::exec) with the queue's own lock timeout.
    #[track_caller]
    pub fn run<T, F, Fut>(&self, key: K, body: F) -> PromiseValue<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (promise, resolver) = PromiseValue::pending();
        self.submit(key, self.inner.lock_timeout, body, resolver, None, Location::caller());
        promise
    }

    /// Like [`exec`](Self::exec), but snapshots the submitter's context
    /// locals now and restores them both for the body and for the observers
    /// of the returned value.
    #[track_caller]
    pub fn exec_preserving<T, F, Fut>(
        &self,
        key: K,
        lock_timeout: Duration,
        body: F,
    ) -> PromiseValue<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let snapshot = context::capture_snapshot();

        let (inner, resolver) = PromiseValue::pending();
        let (outer, outer_resolver) = PromiseValue::pending();
        {
            let snapshot = snapshot.clone();
            inner.on_complete(move |outcome: &Result<T>| {
                let outcome = outcome.clone();
                snapshot.enter(move || outer_resolver.settle(outcome));
            });
        }

        self.submit(key, lock_timeout, body, resolver, Some(snapshot), Location::caller());
        outer
    }

    fn submit<T, F, Fut>(
        &self,
        key: K,
        lock_timeout: Duration,
        body: F,
        resolver: Resolver<T>,
        snapshot: Option<Snapshot>,
        location: &'static Location<'static>,
    ) where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let entry = Box::new(Entry {
            key: key.clone(),
            body,
            resolver,
            executor: Executor::current().unwrap_or_else(|| self.inner.fallback.clone()),
            snapshot,
            trace: context::current_trace(),
            location,
        });

        let mut shard = self.shard(&key).lock();
        let busy = shard.contains_key(&key);
        if !busy {
            shard.insert(key, KeyState::default());
            drop(shard);
            entry.start(self, false);
            return;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        // A timeout past the representable range means no deadline.
        let timer = Instant::now().checked_add(lock_timeout).and_then(|deadline| {
            // Weak, so a pending deadline does not keep a dropped queue alive.
            let inner = Arc::downgrade(&self.inner);
            let expiring = key.clone();
            let armed = timer::after(deadline, move || {
                if let Some(inner) = inner.upgrade() {
                    SerialQueue { inner }.expire(&expiring, id, lock_timeout);
                }
            });
            match armed {
                Ok(timer) => Some(timer),
                Err(e) => {
                    tracing::warn!(?key, error = %e, "lock timeout not armed; entry waits indefinitely");
                    None
                }
            }
        });

        if let Some(state) = shard.get_mut(&key) {
            state.backlog.push_back(Waiting {
                id,
                entry,
                timer,
            });
            tracing::trace!(?key, waiting = state.backlog.len(), "entry queued behind running body");
        }
    }

    /// Starts the next waiting entry for `key`, or forgets the key.
    fn advance(&self, key: &K) {
        let next = {
            let mut shard = self.shard(key).lock();
            match shard.get_mut(key).and_then(|state| state.backlog.pop_front()) {
                Some(next) => Some(next),
                None => {
                    shard.remove(key);
                    None
                }
            }
        };

        if let Some(next) = next {
            if let Some(timer) = &next.timer {
                timer.cancel();
            }
            next.entry.start(self, true);
        }
    }

    fn expire(&self, key: &K, id: u64, waited: Duration) {
        let expired = {
            let mut shard = self.shard(key).lock();
            shard.get_mut(key).and_then(|state| {
                let position = state.backlog.iter().position(|w| w.id == id)?;
                state.backlog.remove(position)
            })
        };

        if let Some(waiting) = expired {
            tracing::debug!(?key, ?waited, "serial entry timed out waiting for its key");
            waiting.entry.time_out(waited);
        }
    }

    /// Entries waiting behind a running body for `key`.
    pub fn waiting(&self, key: &K) -> usize {
        self.shard(key)
            .lock()
            .get(key)
            .map_or(0, |state| state.backlog.len())
    }

    /// Keys with a running or waiting body.
    pub fn active_keys(&self) -> usize {
        self.inner.shards.iter().map(|shard| shard.lock().len()).sum()
    }
}

struct Entry<K, T, F> {
    key: K,
    body: F,
    resolver: Resolver<T>,
    executor: Executor,
    snapshot: Option<Snapshot>,
    trace: Option<Trace>,
    location: &'static Location<'static>,
}

impl<K, T, F, Fut> Pending<K> for Entry<K, T, F>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + 'static,
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    fn start(self: Box<Self>, queue: &SerialQueue<K>, deferred: bool) {
        let Entry {
            key,
            body,
            resolver,
            executor,
            snapshot,
            trace,
            location,
        } = *self;

        let promise = if deferred {
            // Fork from the submitter, not from whichever body finished last.
            let frames = snapshot.unwrap_or_default();
            let mut execution = Execution::resume(&frames, trace);
            enter_context(Some(&executor), &mut execution, || {
                executor.spawn(HopKind::Serial, location, async move { body().await })
            })
        } else {
            executor.spawn(HopKind::Exec, location, async move { body().await })
        };

        let queue = queue.clone();
        promise.on_complete(move |outcome| {
            queue.advance(&key);
            resolver.settle(outcome.clone());
        });
    }

    fn time_out(self: Box<Self>, waited: Duration) {
        let error = Error::new(ErrorKind::LockTimeout)
            .with_message(format!("waited {waited:?} for key {:?}", self.key))
            .traced(self.trace.clone());
        self.resolver.reject(error);
    }
}
