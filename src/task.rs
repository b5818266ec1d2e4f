//! Task: one logical execution driven by an executor.
//!
//! A task owns a boxed future plus the [`Execution`] state (context locals and
//! causality trace) that travels with it. Its waker is the explicit
//! continuation object: waking hands the task back to the *owning* executor's
//! scheduler, never to whichever thread happened to wake it.
//!
//! # How Tasks Work
//!
//! 1. [`Executor::exec`] forks the caller's execution and wraps the body in a task
//! 2. The task is submitted to the executor's scheduler
//! 3. A worker polls it inside [`enter_context`], so locals and the trace are live
//! 4. On `Poll::Pending` the task goes idle until its waker fires
//! 5. The waker resubmits it to the same executor and the cycle repeats
//!
//! [`Executor::exec`]: crate::Executor::exec

use crate::runtime::context::{Execution, enter_context};
use crate::runtime::executor::Executor;
use crate::runtime::scheduler::Hint;

use futures::future::BoxFuture;
use futures::task::{self as futures_task, ArcWake};
use parking_lot::Mutex;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
// Woken while running; poll again once the current poll returns.
const NOTIFIED: u8 = 3;
const DONE: u8 = 4;

pub(crate) struct Task {
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    execution: Mutex<Execution>,
    executor: Executor,
    state: AtomicU8,
}

impl Task {
    /// Wraps `future` and submits its first poll to `executor`.
    pub(crate) fn spawn(executor: Executor, execution: Execution, future: BoxFuture<'static, ()>) {
        let task = Arc::new(Task {
            future: Mutex::new(Some(future)),
            execution: Mutex::new(execution),
            executor,
            state: AtomicU8::new(SCHEDULED),
        });
        task.submit();
    }

    fn submit(self: &Arc<Self>) {
        let task = self.clone();
        if let Err(e) = self.executor.submit(Hint::NonBlocking, Box::new(move || task.run())) {
            // The unit (and with it the task's only queued handle) is gone.
            // Dropping the future below abandons every promise it would have
            // settled.
            tracing::warn!(executor = %self.executor.name(), error = %e, "task could not be scheduled");
            self.state.store(DONE, Ordering::Release);
            let abandoned = self.future.lock().take();
            drop(abandoned);
        }
    }

    fn run(self: Arc<Self>) {
        self.state.store(RUNNING, Ordering::Release);

        let waker = futures_task::waker(self.clone());
        let mut cx = Context::from_waker(&waker);

        let mut slot = self.future.lock();
        let Some(future) = slot.as_mut() else {
            return;
        };

        let poll = {
            let mut execution = self.execution.lock();
            enter_context(Some(&self.executor), &mut execution, || {
                future.as_mut().poll(&mut cx)
            })
        };

        match poll {
            Poll::Ready(()) => {
                slot.take();
                self.state.store(DONE, Ordering::Release);
            }
            Poll::Pending => {
                drop(slot);
                if self
                    .state
                    .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Woken mid-poll.
                    self.state.store(SCHEDULED, Ordering::Release);
                    self.submit();
                }
            }
        }
    }
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        loop {
            match arc_self.state.load(Ordering::Acquire) {
                IDLE => {
                    if arc_self
                        .state
                        .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        arc_self.submit();
                        return;
                    }
                }
                RUNNING => {
                    if arc_self
                        .state
                        .compare_exchange(RUNNING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return,
            }
        }
    }
}
