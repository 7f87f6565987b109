// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The composable awaiter protocol and its `&`/`|` combinators.
//!
//! An [`Awaiter`] is an operation a task can suspend on that additionally
//! knows how to be *cancelled from the outside* and how to report a
//! cancellation outcome. That extra structure is what makes the algebraic
//! combinators possible: [`All`] (`&`) waits for every child and broadcasts
//! cancellation as soon as one child reports it, [`Any`] (`|`) resumes on the
//! first finished child and immediately cancels the losers.
//!
//! Plain futures (including [`TaskHandle`]s awaited directly) do not need any
//! of this; the protocol only exists at combinator seams.

pub(crate) mod all;
pub(crate) mod any;
pub(crate) mod handle;

use crate::scheduler::context;
use crate::sync::ResumeLatch;
use std::sync::Arc;

pub use all::{All, AwaiterTuple, when_all};
pub use any::{Any, LauncherTuple, OneOf2, OneOf3, OneOf4, when_any};
pub use handle::HandleAwaiter;

use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};

/// A suspendable, externally cancellable operation.
///
/// The lifecycle is: [`ready`][Self::ready] as the fast path; otherwise one
/// [`suspend`][Self::suspend] arming a one-shot [`Continue`]; then exactly one
/// of "continuation fires" (after which [`resume`][Self::resume] extracts the
/// output, unless the continuation reported cancellation) or a cancellation
/// via the returned [`CancelHandle`] (which also makes the continuation fire,
/// with the cancel indicator set).
pub trait Awaiter {
    type Output;

    /// Fast path: `true` when the output is already available and
    /// [`resume`][Self::resume] may be called without suspending.
    fn ready(&mut self) -> bool;

    /// Arms the operation: `cont` must be fired exactly once, when the
    /// operation finished or was cancelled. The returned handle cancels the
    /// armed operation from any thread.
    fn suspend(&mut self, cont: Continue) -> CancelHandle;

    /// Cancels the operation before it was armed (e.g. when a sibling already
    /// finished during arming).
    fn cancel(&mut self);

    /// Extracts the output. Only valid after `ready()` returned `true` or the
    /// continuation fired without the cancel indicator.
    fn resume(&mut self) -> Self::Output;

    /// Wraps the awaiter into a future for direct `.await`ing.
    fn awaited(self) -> Awaited<Self>
    where
        Self: Sized,
    {
        Awaited::new(self)
    }
}

/// Converts a value into an [`Awaiter`] for combinator composition.
///
/// Implemented by task handles (yielding [`HandleAwaiter`]) and by the
/// awaiters themselves.
pub trait IntoAwaiter {
    type Awaiter: Awaiter;

    fn into_awaiter(self) -> Self::Awaiter;
}


/// One-shot continuation token handed to [`Awaiter::suspend`].
///
/// Firing consumes the token; the `cancelled` argument reports whether the
/// operation was cancelled rather than completed.
pub struct Continue {
    f: Box<dyn FnOnce(bool) + Send + 'static>,
}

/// Cancels an armed [`Awaiter`] from any thread.
///
/// Handles are cheap to clone; cancelling an operation that already finished
/// is a no-op.
#[derive(Clone)]
pub struct CancelHandle {
    f: Option<Arc<dyn Fn() + Send + Sync + 'static>>,
}

// === impl Continue ===

impl Continue {
    pub(crate) fn new(f: impl FnOnce(bool) + Send + 'static) -> Self {
        Self { f: Box::new(f) }
    }

    /// Fires the continuation. `cancelled` propagates the cancellation
    /// outcome to whoever suspended.
    pub fn fire(self, cancelled: bool) {
        (self.f)(cancelled);
    }
}

impl fmt::Debug for Continue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Continue(..)")
    }
}

// === impl CancelHandle ===

impl CancelHandle {
    pub(crate) fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            f: Some(Arc::new(f)),
        }
    }

    pub fn cancel(&self) {
        if let Some(f) = &self.f {
            f();
        }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CancelHandle(..)")
    }
}

/// Future driving an [`Awaiter`] from inside a task.
///
/// When the awaiter's continuation reports cancellation, the awaiting task
/// itself is cancelled (it is culled at this suspension point and never
/// resumes). Dropping the future while armed cancels the underlying
/// operation, which is how an enclosing task's cancellation propagates into
/// its pending children.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Awaited<A: Awaiter> {
    awaiter: A,
    state: BridgeState,
}

enum BridgeState {
    Idle,
    Armed {
        fired: Arc<ResumeLatch<()>>,
        cancel: CancelHandle,
    },
    Done,
}

// === impl Awaited ===

impl<A: Awaiter> Awaited<A> {
    pub(crate) fn new(awaiter: A) -> Self {
        Self {
            awaiter,
            state: BridgeState::Idle,
        }
    }
}

impl<A: Awaiter> Future for Awaited<A>
where
    A: Unpin,
{
    type Output = A::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let BridgeState::Idle = this.state {
            if this.awaiter.ready() {
                this.state = BridgeState::Done;
                return Poll::Ready(this.awaiter.resume());
            }

            let fired = Arc::new(ResumeLatch::<()>::new(1));
            // Register the task's waker before arming, so a continuation that
            // fires synchronously inside `suspend` is never lost.
            match fired.poll_fired(cx) {
                Poll::Pending => {}
                Poll::Ready(()) => unreachable!("latch fired before arming"),
            }

            let cont = Continue::new({
                let fired = Arc::clone(&fired);
                move |cancelled| {
                    fired.release(cancelled);
                }
            });

            let cancel = this.awaiter.suspend(cont);
            this.state = BridgeState::Armed { fired, cancel };
        }

        let cancelled = match &this.state {
            BridgeState::Armed { fired, .. } => {
                if fired.poll_fired(cx).is_pending() {
                    return Poll::Pending;
                }
                fired.was_cancelled()
            }
            BridgeState::Done => panic!("awaiter polled after completion"),
            BridgeState::Idle => unreachable!(),
        };

        if cancelled {
            // Propagate: the awaiting task is culled at this suspension point
            // and never resumes.
            if let Some((task, _scheduler)) = context::current() {
                task.request_cancel();
            }
            return Poll::Pending;
        }

        this.state = BridgeState::Done;
        Poll::Ready(this.awaiter.resume())
    }
}

impl<A: Awaiter> Drop for Awaited<A> {
    fn drop(&mut self) {
        if let BridgeState::Armed { fired, cancel } = &self.state
            && !fired.fired()
        {
            // The awaiting task went away mid-suspension (typically: it was
            // cancelled). Pull the plug on the pending operation.
            cancel.cancel();
        }
    }
}
