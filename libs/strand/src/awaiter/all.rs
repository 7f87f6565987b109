// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::awaiter::any::Any;
use crate::awaiter::handle::HandleAwaiter;
use crate::awaiter::{Awaited, Awaiter, CancelHandle, Continue, IntoAwaiter};
use crate::task::TaskHandle;
use core::fmt;
use core::ops::BitAnd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Combinator waiting for *every* child awaiter (the `&` operator).
///
/// The output is the tuple of the children's outputs. As soon as one child
/// reports cancellation, the remaining children are cancelled too, and the
/// combinator reports cancellation once all children have settled.
pub struct All<T> {
    children: T,
}

/// Shared fan-out state of an armed [`All`].
struct Fanout {
    remaining: AtomicUsize,
    any_cancelled: AtomicBool,
    cancellers: Mutex<Vec<CancelHandle>>,
    parent: Mutex<Option<Continue>>,
}

// === impl All ===

impl<T> All<T> {
    pub(crate) fn new(children: T) -> Self {
        Self { children }
    }

    pub(crate) fn into_children(self) -> T {
        self.children
    }
}

impl<T> fmt::Debug for All<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("All(..)")
    }
}

// === impl Fanout ===

impl Fanout {
    fn new(len: usize, parent: Continue) -> Self {
        Self {
            remaining: AtomicUsize::new(len),
            any_cancelled: AtomicBool::new(false),
            cancellers: Mutex::new(Vec::with_capacity(len)),
            parent: Mutex::new(Some(parent)),
        }
    }

    /// Records a child's cancel handle. When some sibling already reported
    /// cancellation while this child was being armed, it is cancelled on the
    /// spot.
    fn register_canceller(&self, canceller: CancelHandle) {
        let already_cancelled = {
            let mut cancellers = self.cancellers.lock();
            cancellers.push(canceller.clone());
            self.any_cancelled.load(Ordering::Acquire)
        };

        if already_cancelled {
            canceller.cancel();
        }
    }

    fn child_finished(&self, cancelled: bool) {
        if cancelled && !self.any_cancelled.swap(true, Ordering::AcqRel) {
            // First cancellation: immediately tell the siblings.
            self.cancel_all();
        }

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let parent = self.parent.lock().take();
            if let Some(parent) = parent {
                parent.fire(self.any_cancelled.load(Ordering::Acquire));
            }
        }
    }

    fn cancel_all(&self) {
        let cancellers = self.cancellers.lock().clone();
        for canceller in &cancellers {
            canceller.cancel();
        }
    }
}

macro_rules! impl_all {
    ($len:literal; $( $T:ident, $t:ident, $idx:tt );+) => {
        impl<$($T: Awaiter),+> Awaiter for All<($($T,)+)> {
            type Output = ($($T::Output,)+);

            fn ready(&mut self) -> bool {
                let ($($t,)+) = &mut self.children;
                $( $t.ready() )&&+
            }

            fn suspend(&mut self, cont: Continue) -> CancelHandle {
                let fanout = Arc::new(Fanout::new($len, cont));
                let ($($t,)+) = &mut self.children;

                $(
                    let child_cont = Continue::new({
                        let fanout = Arc::clone(&fanout);
                        move |cancelled| fanout.child_finished(cancelled)
                    });
                    let canceller = $t.suspend(child_cont);
                    fanout.register_canceller(canceller);
                )+

                CancelHandle::new(move || fanout.cancel_all())
            }

            fn cancel(&mut self) {
                let ($($t,)+) = &mut self.children;
                $( $t.cancel(); )+
            }

            fn resume(&mut self) -> Self::Output {
                let ($($t,)+) = &mut self.children;
                ($( $t.resume(), )+)
            }
        }

        impl<$($T: Awaiter),+> IntoFuture for All<($($T,)+)>
        where
            Self: Unpin,
        {
            type Output = ($($T::Output,)+);
            type IntoFuture = Awaited<Self>;

            fn into_future(self) -> Awaited<Self> {
                Awaited::new(self)
            }
        }
    };
}

impl_all!(2; A, a, 0; B, b, 1);
impl_all!(3; A, a, 0; B, b, 1; C, c, 2);
impl_all!(4; A, a, 0; B, b, 1; C, c, 2; D, d, 3);

impl<T> IntoAwaiter for All<T>
where
    All<T>: Awaiter,
{
    type Awaiter = Self;

    fn into_awaiter(self) -> Self {
        self
    }
}

// === operator composition ===

// task_handle & x
impl<T, U> BitAnd<U> for TaskHandle<T>
where
    T: Send + 'static,
    U: IntoAwaiter,
{
    type Output = All<(HandleAwaiter<T>, U::Awaiter)>;

    fn bitand(self, rhs: U) -> Self::Output {
        All::new((self.into_awaiter(), rhs.into_awaiter()))
    }
}

// (a & b) & x: flatten into a wider tuple
impl<A, B, U> BitAnd<U> for All<(A, B)>
where
    U: IntoAwaiter,
{
    type Output = All<(A, B, U::Awaiter)>;

    fn bitand(self, rhs: U) -> Self::Output {
        let (a, b) = self.into_children();
        All::new((a, b, rhs.into_awaiter()))
    }
}

impl<A, B, C, U> BitAnd<U> for All<(A, B, C)>
where
    U: IntoAwaiter,
{
    type Output = All<(A, B, C, U::Awaiter)>;

    fn bitand(self, rhs: U) -> Self::Output {
        let (a, b, c) = self.into_children();
        All::new((a, b, c, rhs.into_awaiter()))
    }
}

// (a | b) & x: the whole `any` becomes one `all` child
impl<T, U> BitAnd<U> for Any<T>
where
    Any<T>: Awaiter,
    U: IntoAwaiter,
{
    type Output = All<(Any<T>, U::Awaiter)>;

    fn bitand(self, rhs: U) -> Self::Output {
        All::new((self, rhs.into_awaiter()))
    }
}

/// Waits for all the given parts (task handles or awaiters) to complete.
///
/// The await resolves to the tuple of their outputs; when any part reports
/// cancellation the rest are cancelled and the awaiting task is cancelled
/// with them.
///
/// ```ignore
/// let (a, b) = when_all((handle_a, handle_b)).await;
/// ```
pub fn when_all<T: AwaiterTuple>(parts: T) -> All<T::Awaiters> {
    All::new(parts.into_awaiter_tuple())
}

/// Tuples of [`IntoAwaiter`] values, for [`when_all`].
pub trait AwaiterTuple {
    type Awaiters;

    fn into_awaiter_tuple(self) -> Self::Awaiters;
}

macro_rules! impl_awaiter_tuple {
    ($( $T:ident, $t:ident );+) => {
        impl<$($T: IntoAwaiter),+> AwaiterTuple for ($($T,)+) {
            type Awaiters = ($($T::Awaiter,)+);

            fn into_awaiter_tuple(self) -> Self::Awaiters {
                let ($($t,)+) = self;
                ($($t.into_awaiter(),)+)
            }
        }
    };
}

impl_awaiter_tuple!(A, a; B, b);
impl_awaiter_tuple!(A, a; B, b; C, c);
impl_awaiter_tuple!(A, a; B, b; C, c; D, d);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{ResumeHandle, await_callback};
    use crate::queue::WORKER;
    use crate::scheduler::start_task;
    use crate::task::{TaskLauncher, cancel, yield_now};
    use crate::test_util::{PATIENCE, drive_until, scheduler, scheduler_with_workers};
    use std::sync::Arc;

    async fn stuck() {
        await_callback(|resume: ResumeHandle<()>| drop(resume)).await;
    }

    #[test]
    fn when_all_collects_every_output() {
        let scheduler = scheduler_with_workers(2);

        let first = scheduler.spawn_on(
            async {
                yield_now().await;
                1
            },
            WORKER,
        );
        let second = scheduler.spawn_on(async { String::from("x") }, WORKER);

        let combined = scheduler.spawn(async move { when_all((first, second)).await });

        assert!(drive_until(&scheduler, PATIENCE, || combined.done()));
        assert_eq!(combined.get(), (1, String::from("x")));
    }

    #[test]
    fn operator_chain_flattens() {
        let scheduler = scheduler();

        let combined = scheduler.spawn(async {
            let a = start_task(TaskLauncher::new(async { 1 }));
            let b = start_task(TaskLauncher::new(async { 2 }));
            let c = start_task(TaskLauncher::new(async { 3 }));
            (a & b & c).await
        });

        assert!(drive_until(&scheduler, PATIENCE, || combined.done()));
        assert_eq!(combined.get(), (1, 2, 3));
    }

    #[test]
    fn cancelled_child_cancels_siblings_and_the_parent() {
        let scheduler = scheduler_with_workers(1);
        let tracker = Arc::new(());

        let parent = scheduler.spawn({
            let tracker = Arc::clone(&tracker);
            async move {
                // This child cancels itself at its first suspension point...
                let doomed = start_task(TaskLauncher::new(async {
                    cancel().await;
                }));
                // ...which must take this sibling and the parent down with it.
                let sibling = start_task(TaskLauncher::new(async move {
                    let _keep = tracker;
                    stuck().await;
                }));

                (doomed & sibling).await;
            }
        });

        assert!(drive_until(&scheduler, PATIENCE, || {
            parent.is_cancelled() && Arc::strong_count(&tracker) == 1
        }));
        assert!(!parent.done());
    }
}
