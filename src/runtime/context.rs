//! Thread-local view of the logical execution currently running.
//!
//! A physical thread only ever *borrows* a logical execution's state. When a
//! unit of work starts, [`enter_context`] swaps the execution's frames, trace
//! and executor into these thread-locals; when the unit ends (normally or by
//! unwinding) it swaps them back out, handing any changes to the execution and
//! restoring whatever the thread had before.
//!
//! Synchronous code outside any executor uses the thread's own frames, so
//! `ContextLocal::exec` works at the top level too.

use crate::context::frame::FrameStack;
use crate::context::snapshot::Snapshot;
use crate::runtime::executor::Executor;
use crate::trace::{Hop, Trace};

use std::cell::RefCell;

thread_local! {
    /// Executor whose unit of work is running on this thread.
    static CURRENT_EXECUTOR: RefCell<Option<Executor>> = const { RefCell::new(None) };

    /// Active context locals of the running logical execution.
    static CURRENT_FRAMES: RefCell<FrameStack> = RefCell::new(FrameStack::new());

    /// Causality trace of the running logical execution.
    static CURRENT_TRACE: RefCell<Option<Trace>> = const { RefCell::new(None) };
}

/// State a logical execution carries between units of work.
#[derive(Default)]
pub(crate) struct Execution {
    pub(crate) frames: FrameStack,
    pub(crate) trace: Option<Trace>,
}

impl Execution {
    pub(crate) fn new(frames: FrameStack, trace: Option<Trace>) -> Self {
        Self { frames, trace }
    }

    /// Forks the calling execution across a hop: locals are snapshotted and
    /// `hop` is linked under the current trace.
    pub(crate) fn fork(hop: Hop) -> Self {
        let snapshot = capture_snapshot();
        Self::resume(&snapshot, Some(Trace::child(current_trace(), hop)))
    }

    pub(crate) fn resume(snapshot: &Snapshot, trace: Option<Trace>) -> Self {
        Self::new(FrameStack::restore(snapshot), trace)
    }
}

/// Puts the thread's previous state back, even when the body unwinds.
struct Restore<'a> {
    execution: &'a mut Execution,
    previous_executor: Option<Executor>,
}

impl Drop for Restore<'_> {
    fn drop(&mut self) {
        swap_state(self.execution);
        let previous = self.previous_executor.take();
        CURRENT_EXECUTOR.with(|current| *current.borrow_mut() = previous);
    }
}

fn swap_state(execution: &mut Execution) {
    CURRENT_FRAMES.with(|frames| std::mem::swap(&mut *frames.borrow_mut(), &mut execution.frames));
    CURRENT_TRACE.with(|trace| std::mem::swap(&mut *trace.borrow_mut(), &mut execution.trace));
}

/// Runs `function` as part of `execution` on behalf of `executor`.
///
/// # Example
///
/// ```ignore
/// let mut execution = Execution::fork(hop);
/// enter_context(Some(&executor), &mut execution, || {
///     // ContextLocal::get() and Executor::current() see `execution` here
/// });
/// ```
pub(crate) fn enter_context<F, R>(
    executor: Option<&Executor>,
    execution: &mut Execution,
    function: F,
) -> R
where
    F: FnOnce() -> R,
{
    let previous_executor =
        CURRENT_EXECUTOR.with(|current| current.replace(executor.cloned()));
    swap_state(execution);

    let _restore = Restore {
        execution,
        previous_executor,
    };

    function()
}

pub(crate) fn with_frames<R>(function: impl FnOnce(&mut FrameStack) -> R) -> R {
    CURRENT_FRAMES.with(|frames| function(&mut frames.borrow_mut()))
}

pub(crate) fn capture_snapshot() -> Snapshot {
    with_frames(|frames| frames.snapshot())
}

pub(crate) fn current_executor() -> Option<Executor> {
    CURRENT_EXECUTOR.with(|current| current.borrow().clone())
}

pub(crate) fn current_trace() -> Option<Trace> {
    CURRENT_TRACE.with(|trace| trace.borrow().clone())
}

/// Advances the running execution's trace by one hop.
pub(crate) fn advance_trace(hop: Hop) -> Trace {
    CURRENT_TRACE.with(|trace| {
        let mut trace = trace.borrow_mut();
        let next = Trace::advance(trace.take(), hop);
        *trace = Some(next.clone());
        next
    })
}

/// Whether the calling thread is running a unit of work for some executor.
pub(crate) fn inside_executor() -> bool {
    CURRENT_EXECUTOR.with(|current| current.borrow().is_some())
}
