//! Pull-based asynchronous sequences.
//!
//! An [`AsyncSequence`] hands out one [`PromiseValue`] per call to
//! [`next`](AsyncSequence::next). Exhaustion is reported as a rejection with
//! [`ErrorKind::NoMoreElements`], which [`Error::is_end_of_sequence`] tells
//! apart from real failures.
//!
//! [`Yielding`] wraps a sequence so that long consumer loops periodically give
//! other work on their executor a turn.
//!
//! [`Error::is_end_of_sequence`]: crate::Error::is_end_of_sequence

use crate::config::RuntimeConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::promise::PromiseValue;
use crate::runtime::executor::Executor;
use crate::runtime::yield_now;

use futures::StreamExt;
use futures::stream::{self, BoxStream};

use std::num::NonZeroUsize;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A source of values pulled one promise at a time.
pub trait AsyncSequence: Send {
    type Item: Clone + Send + Sync + 'static;

    /// The next element, or a [`ErrorKind::NoMoreElements`] rejection once
    /// exhausted.
    fn next(&mut self) -> PromiseValue<Self::Item>;

    /// Wraps this sequence so every `every`-th element is delivered only after
    /// a [`yield_now`] checkpoint.
    ///
    /// [`yield_now`]: crate::yield_now
    fn yielding(self, every: NonZeroUsize) -> Yielding<Self>
    where
        Self: Sized,
    {
        Yielding::new(self, every)
    }

    /// [`yielding`](Self::yielding) at the configured `yield_every` cadence.
    fn yielding_from(self, config: &RuntimeConfig) -> Yielding<Self>
    where
        Self: Sized,
    {
        Yielding::new(self, config.yield_every())
    }

    /// Adapts this sequence into a [`Stream`](futures::Stream) that ends at
    /// exhaustion and stops after the first real failure.
    fn into_stream(self) -> BoxStream<'static, Result<Self::Item>>
    where
        Self: Sized + 'static,
    {
        stream::unfold(Some(self), |state| async move {
            let mut sequence = state?;
            match sequence.next().await {
                Ok(item) => Some((Ok(item), Some(sequence))),
                Err(e) if e.is_end_of_sequence() => None,
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }
}

/// Drains `sequence` into a vector.
pub async fn collect_all<S: AsyncSequence>(mut sequence: S) -> Result<Vec<S::Item>> {
    let mut items = Vec::new();
    loop {
        match sequence.next().await {
            Ok(item) => items.push(item),
            Err(e) if e.is_end_of_sequence() => return Ok(items),
            Err(e) => return Err(e),
        }
    }
}

/// A sequence over the items of an iterator.
pub struct IterSequence<I> {
    iter: I,
}

impl<I> IterSequence<I> {
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: iter.into_iter(),
        }
    }
}

impl<I> AsyncSequence for IterSequence<I>
where
    I: Iterator + Send,
    I::Item: Clone + Send + Sync + 'static,
{
    type Item = I::Item;

    fn next(&mut self) -> PromiseValue<Self::Item> {
        match self.iter.next() {
            Some(item) => PromiseValue::result(item),
            None => PromiseValue::rejected(Error::new(ErrorKind::NoMoreElements)),
        }
    }
}

/// Sequence adapter inserting a cooperative checkpoint every N elements.
///
/// The inner sequence is always asked first. When the call is due (every
/// N-th call after the first) and the inner sequence produced an element,
/// the element is held back until a `yield_now` checkpoint on the calling
/// executor completes. Exhaustion and failures are never delayed, so a
/// sequence of K elements performs `(K - 1) / N` checkpoints.
pub struct Yielding<S> {
    inner: S,
    every: NonZeroUsize,
    calls: usize,
    checkpoints: Arc<AtomicUsize>,
}

impl<S: AsyncSequence> Yielding<S> {
    pub fn new(inner: S, every: NonZeroUsize) -> Self {
        Self {
            inner,
            every,
            calls: 0,
            checkpoints: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Checkpoints performed so far.
    pub fn checkpoints(&self) -> usize {
        self.checkpoints.load(Ordering::Acquire)
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncSequence> AsyncSequence for Yielding<S> {
    type Item = S::Item;

    #[track_caller]
    fn next(&mut self) -> PromiseValue<Self::Item> {
        let call = self.calls;
        self.calls += 1;

        let item = self.inner.next();
        if call == 0 || call % self.every.get() != 0 {
            return item;
        }

        // Record the hop only while still inside the calling execution.
        let record = item.is_settled();
        let executor = Executor::current();
        let location = Location::caller();
        let checkpoints = self.checkpoints.clone();

        item.flat_map(move |value| {
            checkpoints.fetch_add(1, Ordering::AcqRel);
            yield_now::checkpoint(executor.as_ref(), location, record).map(move |()| value)
        })
        .into_checkpoint()
    }
}
