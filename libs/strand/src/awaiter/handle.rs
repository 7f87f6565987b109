// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::awaiter::{Awaiter, CancelHandle, Continue, IntoAwaiter};
use crate::scheduler::context;
use crate::task::{TaskHandle, TaskResult};
use core::fmt;

/// [`Awaiter`] over a started task's handle.
///
/// The continuation piggy-backs on the task's one-shot completion
/// continuation; cancelling the awaiter requests cancellation of the task
/// itself.
pub struct HandleAwaiter<T> {
    handle: TaskHandle<T>,
}

// === impl HandleAwaiter ===

impl<T: Send + 'static> HandleAwaiter<T> {
    pub fn new(handle: TaskHandle<T>) -> Self {
        Self { handle }
    }
}

impl<T: Send + 'static> Awaiter for HandleAwaiter<T> {
    type Output = T;

    fn ready(&mut self) -> bool {
        // A cancelled task never becomes `done`; it reports through the
        // suspend path instead, carrying the cancel indicator.
        self.handle.done()
    }

    fn suspend(&mut self, cont: Continue) -> CancelHandle {
        // Record the awaiting task as the parent, so its cancellation reaches
        // the child even before the combinator's cancel handles are wired up.
        if let Some((parent, scheduler)) = context::current() {
            scheduler
                .core()
                .on_child_task_added(&parent, self.handle.raw().clone());
        }

        self.handle.continue_with(move |_result, cancelled| {
            // The value stays in the task; `resume` collects it through the
            // handle we keep.
            cont.fire(cancelled);
        });

        let task = self.handle.raw().clone();
        CancelHandle::new(move || {
            task.request_cancel();
        })
    }

    fn cancel(&mut self) {
        self.handle.request_cancel();
    }

    fn resume(&mut self) -> T {
        // Safety: `T` is the task's output type by construction.
        match unsafe { self.handle.raw().take_output::<T>() } {
            TaskResult::Done(value) => value,
            TaskResult::Panicked(payload) => std::panic::resume_unwind(payload),
            TaskResult::Empty => panic!("resumed an awaiter whose task was cancelled"),
        }
    }
}

impl<T: Send + 'static> IntoAwaiter for TaskHandle<T> {
    type Awaiter = HandleAwaiter<T>;

    fn into_awaiter(self) -> HandleAwaiter<T> {
        HandleAwaiter::new(self)
    }
}

impl<T: Send + 'static> IntoAwaiter for HandleAwaiter<T> {
    type Awaiter = Self;

    fn into_awaiter(self) -> Self {
        self
    }
}

impl<T> fmt::Debug for HandleAwaiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleAwaiter")
            .field("handle", &self.handle)
            .finish()
    }
}
