// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::JoinError;
use crate::scheduler::context;
use crate::task::{ContinueArg, TaskRef, TaskResult};
use crate::sync::hook;
use core::cell::Cell;
use core::fmt;
use core::marker::PhantomData;
use core::pin::Pin;
use core::task::{Context, Poll};

/// The external owner of a started task.
///
/// A handle observes completion ([`done`][Self::done]), requests cooperative
/// cancellation ([`request_cancel`][Self::request_cancel]), consumes the
/// result ([`get`][Self::get] or `.await`) and may attach a single completion
/// continuation ([`continue_with`][Self::continue_with]).
///
/// Dropping (or [`detach`][Self::detach]ing) the handle does **not** cancel
/// the task; it keeps running to completion on its queues.
///
/// Handles are move-only and may be sent to another thread, but not shared
/// between threads.
pub struct TaskHandle<T> {
    raw: TaskRef,
    /// Whether awaiting this handle already recorded a parent/child edge.
    linked: Cell<bool>,
    // Invariant over T, and deliberately `!Sync`: all `&self` methods assume
    // they never race each other.
    _output: PhantomData<*const T>,
}

// Safety: the handle only moves `T` values out of the (synchronized) task
// slot; `!Sync` is preserved by the `PhantomData` above.
unsafe impl<T: Send> Send for TaskHandle<T> {}

// === impl TaskHandle ===

impl<T: Send + 'static> TaskHandle<T> {
    pub(crate) fn new(raw: TaskRef) -> Self {
        Self {
            raw,
            linked: Cell::new(false),
            _output: PhantomData,
        }
    }

    pub(crate) fn raw(&self) -> &TaskRef {
        &self.raw
    }

    /// `true` once the task ran to completion and produced a value.
    ///
    /// A cancelled task never becomes `done`; observe that through
    /// [`is_cancelled`][Self::is_cancelled] instead.
    #[must_use]
    pub fn done(&self) -> bool {
        self.raw.is_complete()
    }

    /// `true` once cancellation was requested for the task.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.raw.is_cancelled()
    }

    /// Requests cooperative cancellation.
    ///
    /// Running code is never interrupted; the task is culled at its next
    /// suspension point. Returns `false` when the task already finished or
    /// was already cancelled.
    pub fn request_cancel(&self) -> bool {
        self.raw.request_cancel()
    }

    /// Consumes the handle and takes the task's value.
    ///
    /// # Panics
    ///
    /// Panics when the task has not completed (caller error), and resumes the
    /// task's panic when it panicked.
    #[must_use = "if the value is not needed, drop or detach the handle instead"]
    pub fn get(self) -> T {
        assert!(
            self.raw.is_joinable(),
            "TaskHandle::get called before the task finished"
        );

        // Safety: `T` is the task's output type by construction.
        match unsafe { self.raw.take_output::<T>() } {
            TaskResult::Done(value) => value,
            TaskResult::Panicked(payload) => std::panic::resume_unwind(payload),
            TaskResult::Empty => panic!("TaskHandle::get called on a cancelled task"),
        }
    }

    /// Attaches the task's one-shot completion continuation.
    ///
    /// `f` runs exactly once, when the task finishes: with the result slot
    /// (from which it may take the value in place) and the cancel indicator.
    /// When the task already finished, `f` runs inline here.
    ///
    /// # Panics
    ///
    /// Panics when a continuation was already attached.
    pub fn continue_with<F>(&self, f: F)
    where
        F: FnOnce(&mut TaskResult<T>, bool) + Send + 'static,
    {
        let hook = hook::allocate(move |arg| {
            // Safety: the task invokes continuations with a
            // `*mut ContinueArg<T>` matching the handle's output type.
            let arg = unsafe { &mut *arg.cast::<ContinueArg<T>>() };
            // Safety: `result` points into the live task slot for the
            // duration of the call.
            f(unsafe { &mut *arg.result }, arg.cancelled);
        });

        // Safety: the hook's argument protocol is `ContinueArg<T>`.
        unsafe { self.raw.attach_continuation(hook) };
    }

    /// Consumes the handle without cancelling the task.
    pub fn detach(self) {
        drop(self);
    }
}

impl<T: Send + 'static> Future for TaskHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.raw.poll_joinable(cx).is_pending() {
            // First suspension on this handle inside another task: record the
            // awaiting task as the parent, so cancelling it reaches us.
            if !self.linked.replace(true)
                && let Some((parent, scheduler)) = context::current()
            {
                scheduler
                    .core()
                    .on_child_task_added(&parent, self.raw.clone());
            }
            return Poll::Pending;
        }

        // Safety: `T` is the task's output type by construction.
        let result = unsafe { self.raw.take_output::<T>() };
        match result {
            TaskResult::Done(value) => Poll::Ready(Ok(value)),
            TaskResult::Panicked(payload) => Poll::Ready(Err(JoinError::Panicked(payload))),
            TaskResult::Empty => {
                if self.raw.is_cancelled() {
                    Poll::Ready(Err(JoinError::Cancelled))
                } else {
                    panic!("TaskHandle polled after completion");
                }
            }
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("task", &self.raw).finish()
    }
}
