//! Timer and sleep functionality.
//!
//! A single background thread owns every deadline. Timers are registered once
//! and fired explicitly when their deadline passes; nothing polls in a loop.
//! The thread starts on first use and lives for the rest of the process.

use crate::error::{Error, ErrorKind, Result};

use parking_lot::{Condvar, Mutex};

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send>;

// Cancelled entries tolerated in the heap before a compaction is considered.
const COMPACT_AFTER: usize = 32;

struct Entry {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    callback: Callback,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Pending deadlines, earliest first.
struct TimerDriver {
    timers: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    // Cancellations since the last compaction; may overcount.
    cancelled: usize,
}

impl TimerDriver {
    fn register(&mut self, deadline: Instant, callback: Callback) -> Arc<AtomicBool> {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.timers.push(Reverse(Entry {
            deadline,
            seq: self.next_seq,
            cancelled: cancelled.clone(),
            callback,
        }));
        self.next_seq += 1;
        cancelled
    }

    /// Removes every entry whose deadline has passed.
    fn take_expired(&mut self, now: Instant) -> Vec<Entry> {
        let mut expired = Vec::new();
        while let Some(Reverse(next)) = self.timers.peek() {
            if next.deadline > now {
                break;
            }
            if let Some(Reverse(entry)) = self.timers.pop() {
                if entry.cancelled.load(Ordering::Acquire) {
                    self.cancelled = self.cancelled.saturating_sub(1);
                }
                expired.push(entry);
            }
        }
        expired
    }

    /// Counts a cancellation. Once cancelled entries make up half the heap
    /// they are pulled out and returned, to be dropped outside the lock.
    fn note_cancelled(&mut self) -> Vec<Entry> {
        self.cancelled += 1;
        if self.cancelled < COMPACT_AFTER || self.cancelled * 2 < self.timers.len() {
            return Vec::new();
        }

        let (dead, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.timers)
            .into_vec()
            .into_iter()
            .partition(|Reverse(entry)| entry.cancelled.load(Ordering::Acquire));
        self.timers = BinaryHeap::from(live);
        self.cancelled = 0;
        dead.into_iter().map(|Reverse(entry)| entry).collect()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse(e)| e.deadline)
    }
}

struct Shared {
    driver: Mutex<TimerDriver>,
    condvar: Condvar,
}

static TIMER: OnceLock<std::result::Result<Arc<Shared>, String>> = OnceLock::new();

fn shared() -> Result<&'static Arc<Shared>> {
    TIMER
        .get_or_init(|| {
            let shared = Arc::new(Shared {
                driver: Mutex::new(TimerDriver {
                    timers: BinaryHeap::new(),
                    next_seq: 0,
                    cancelled: 0,
                }),
                condvar: Condvar::new(),
            });
            let driver = shared.clone();
            thread::Builder::new()
                .name("weft-timer".into())
                .spawn(move || run(&driver))
                .map(|_| shared)
                .map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| Error::new(ErrorKind::Spawn).with_message(format!("timer thread: {e}")))
}

fn run(shared: &Shared) {
    let mut driver = shared.driver.lock();
    loop {
        let expired = driver.take_expired(Instant::now());
        if !expired.is_empty() {
            drop(driver);
            for entry in expired {
                // Marked first so a late cancel is a no-op.
                if !entry.cancelled.swap(true, Ordering::AcqRel) {
                    (entry.callback)();
                }
            }
            driver = shared.driver.lock();
            continue;
        }

        match driver.next_deadline() {
            Some(deadline) => {
                shared.condvar.wait_until(&mut driver, deadline);
            }
            None => shared.condvar.wait(&mut driver),
        }
    }
}

/// Cancels a timer registered with [`after`] if it has not fired yet.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(shared) = shared() {
            let dead = shared.driver.lock().note_cancelled();
            drop(dead);
        }
    }
}

/// Timers registered and not yet fired or compacted away.
pub fn pending_timers() -> usize {
    shared().map_or(0, |shared| shared.driver.lock().timers.len())
}

/// Runs `callback` on the timer thread once `deadline` passes.
///
/// Callbacks should be short; they delay every later timer.
pub fn after(deadline: Instant, callback: impl FnOnce() + Send + 'static) -> Result<TimerHandle> {
    let shared = shared()?;
    let cancelled = {
        let mut driver = shared.driver.lock();
        let earliest = driver.next_deadline().is_none_or(|next| deadline < next);
        let cancelled = driver.register(deadline, Box::new(callback));
        if earliest {
            shared.condvar.notify_one();
        }
        cancelled
    };
    Ok(TimerHandle { cancelled })
}

/// A future that completes after a specified duration.
#[derive(Debug)]
pub struct Sleep {
    // `None` when the duration overflows the clock: the sleep never ends.
    deadline: Option<Instant>,
    waker: Option<Arc<Mutex<Option<Waker>>>>,
    timer: Option<TimerHandle>,
}

impl Sleep {
    pub fn new(duration: Duration) -> Self {
        Self::at(Instant::now().checked_add(duration))
    }

    pub fn until(deadline: Instant) -> Self {
        Self::at(Some(deadline))
    }

    fn at(deadline: Option<Instant>) -> Self {
        Self {
            deadline,
            waker: None,
            timer: None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(deadline) = self.deadline else {
            return Poll::Pending;
        };
        if Instant::now() >= deadline {
            return Poll::Ready(Ok(()));
        }

        match &self.waker {
            Some(slot) => {
                *slot.lock() = Some(cx.waker().clone());
            }
            None => {
                let slot = Arc::new(Mutex::new(Some(cx.waker().clone())));
                let fired = slot.clone();
                let timer = after(deadline, move || {
                    if let Some(waker) = fired.lock().take() {
                        waker.wake();
                    }
                });
                match timer {
                    Ok(timer) => {
                        self.waker = Some(slot);
                        self.timer = Some(timer);
                    }
                    Err(e) => return Poll::Ready(Err(e)),
                }
            }
        }

        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(timer) = &self.timer {
            timer.cancel();
        }
    }
}

/// Sleeps for the specified duration without blocking the worker thread.
///
/// ```ignore
/// use std::time::Duration;
///
/// pool.exec(async {
///     weft::sleep(Duration::from_millis(100)).await?;
///     Ok(())
/// });
/// ```
pub fn sleep(duration: Duration) -> Sleep {
    Sleep::new(duration)
}
