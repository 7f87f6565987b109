// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::awaiter::all::All;
use crate::awaiter::handle::HandleAwaiter;
use crate::awaiter::{Awaited, Awaiter, CancelHandle, Continue, IntoAwaiter};
use crate::scheduler::Scheduler;
use crate::task::{TaskHandle, TaskLauncher};
use core::fmt;
use core::ops::BitOr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Combinator resuming on the *first* finished child awaiter (the `|`
/// operator).
///
/// The output is a `OneOfN` enum holding the winner's output. The losers are
/// cancelled immediately once a winner is decided; their late continuations
/// are absorbed. The combinator reports the winner's cancel indicator, so an
/// `|`-ed [`cancel_after`][crate::time::cancel_after] that fires cancels the
/// whole awaiting task.
pub struct Any<T> {
    children: T,
    /// Winner decided on the `ready` fast path, before any arming.
    decided: Option<usize>,
    /// Shared race state once armed.
    race: Option<Arc<Race>>,
}

/// Winner election state of an armed [`Any`].
struct Race {
    winner: AtomicUsize,
    cancellers: Mutex<Vec<CancelHandle>>,
    parent: Mutex<Option<Continue>>,
}

const NO_WINNER: usize = usize::MAX;

/// Output of a two-way [`Any`].
#[derive(Debug, PartialEq, Eq)]
pub enum OneOf2<A, B> {
    First(A),
    Second(B),
}

/// Output of a three-way [`Any`].
#[derive(Debug, PartialEq, Eq)]
pub enum OneOf3<A, B, C> {
    First(A),
    Second(B),
    Third(C),
}

/// Output of a four-way [`Any`].
#[derive(Debug, PartialEq, Eq)]
pub enum OneOf4<A, B, C, D> {
    First(A),
    Second(B),
    Third(C),
    Fourth(D),
}

// === impl Any ===

impl<T> Any<T> {
    pub(crate) fn new(children: T) -> Self {
        Self {
            children,
            decided: None,
            race: None,
        }
    }

    fn into_children(self) -> T {
        debug_assert!(
            self.race.is_none() && self.decided.is_none(),
            "combinators may only be composed before awaiting"
        );
        self.children
    }
}

impl<T> fmt::Debug for Any<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Any")
            .field("decided", &self.decided)
            .finish_non_exhaustive()
    }
}

// === impl Race ===

impl Race {
    fn new(len: usize, parent: Continue) -> Self {
        Self {
            winner: AtomicUsize::new(NO_WINNER),
            cancellers: Mutex::new(Vec::with_capacity(len)),
            parent: Mutex::new(Some(parent)),
        }
    }

    fn winner(&self) -> Option<usize> {
        match self.winner.load(Ordering::Acquire) {
            NO_WINNER => None,
            index => Some(index),
        }
    }

    /// Records a child's cancel handle. When a sibling already won while this
    /// child was being armed, the child is cancelled on the spot.
    fn register_canceller(&self, index: usize, canceller: CancelHandle) {
        let lost_already = {
            let mut cancellers = self.cancellers.lock();
            cancellers.push(canceller.clone());
            matches!(self.winner(), Some(winner) if winner != index)
        };

        if lost_already {
            canceller.cancel();
        }
    }

    fn child_finished(&self, index: usize, cancelled: bool) {
        // Single-winner election; losers' continuations are absorbed here.
        if self
            .winner
            .compare_exchange(NO_WINNER, index, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.cancel_losers(index);

        let parent = self.parent.lock().take();
        if let Some(parent) = parent {
            parent.fire(cancelled);
        }
    }

    fn cancel_losers(&self, winner: usize) {
        let cancellers = self.cancellers.lock().clone();
        for (index, canceller) in cancellers.iter().enumerate() {
            if index != winner {
                canceller.cancel();
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

macro_rules! impl_any {
    ($OneOf:ident; $len:literal; $( $T:ident, $t:ident, $idx:tt, $V:ident );+) => {
        impl<$($T: Awaiter),+> Awaiter for Any<($($T,)+)> {
            type Output = $OneOf<$($T::Output),+>;

            fn ready(&mut self) -> bool {
                if self.decided.is_some() {
                    return true;
                }

                let ($($t,)+) = &mut self.children;
                let mut decided = None;
                $(
                    if decided.is_none() && $t.ready() {
                        decided = Some($idx);
                    }
                )+

                let Some(winner) = decided else { return false };

                // Losers are cancelled immediately.
                $(
                    if $idx != winner {
                        $t.cancel();
                    }
                )+
                self.decided = Some(winner);
                true
            }

            fn suspend(&mut self, cont: Continue) -> CancelHandle {
                let race = Arc::new(Race::new($len, cont));
                self.race = Some(Arc::clone(&race));

                let ($($t,)+) = &mut self.children;
                $(
                    let child_cont = Continue::new({
                        let race = Arc::clone(&race);
                        move |cancelled| race.child_finished($idx, cancelled)
                    });
                    let canceller = $t.suspend(child_cont);
                    race.register_canceller($idx, canceller);
                )+

                CancelHandle::new(move || race.cancel_all())
            }

            fn cancel(&mut self) {
                let ($($t,)+) = &mut self.children;
                $( $t.cancel(); )+
            }

            fn resume(&mut self) -> Self::Output {
                let winner = self
                    .decided
                    .or_else(|| self.race.as_ref().and_then(|race| race.winner()))
                    .expect("resumed before any child finished");

                let ($($t,)+) = &mut self.children;
                match winner {
                    $( $idx => $OneOf::$V($t.resume()), )+
                    _ => unreachable!(),
                }
            }
        }

        impl<$($T: Awaiter),+> IntoFuture for Any<($($T,)+)>
        where
            Self: Unpin,
        {
            type Output = $OneOf<$($T::Output),+>;
            type IntoFuture = Awaited<Self>;

            fn into_future(self) -> Awaited<Self> {
                Awaited::new(self)
            }
        }
    };
}

impl_any!(OneOf2; 2; A, a, 0, First; B, b, 1, Second);
impl_any!(OneOf3; 3; A, a, 0, First; B, b, 1, Second; C, c, 2, Third);
impl_any!(OneOf4; 4; A, a, 0, First; B, b, 1, Second; C, c, 2, Third; D, d, 3, Fourth);

impl<T> IntoAwaiter for Any<T>
where
    Any<T>: Awaiter,
{
    type Awaiter = Self;

    fn into_awaiter(self) -> Self {
        self
    }
}

// === operator composition ===

// task_handle | x
impl<T, U> BitOr<U> for TaskHandle<T>
where
    T: Send + 'static,
    U: IntoAwaiter,
{
    type Output = Any<(HandleAwaiter<T>, U::Awaiter)>;

    fn bitor(self, rhs: U) -> Self::Output {
        Any::new((self.into_awaiter(), rhs.into_awaiter()))
    }
}

// (a | b) | x: flatten into a wider tuple
impl<A, B, U> BitOr<U> for Any<(A, B)>
where
    U: IntoAwaiter,
{
    type Output = Any<(A, B, U::Awaiter)>;

    fn bitor(self, rhs: U) -> Self::Output {
        let (a, b) = self.into_children();
        Any::new((a, b, rhs.into_awaiter()))
    }
}

impl<A, B, C, U> BitOr<U> for Any<(A, B, C)>
where
    U: IntoAwaiter,
{
    type Output = Any<(A, B, C, U::Awaiter)>;

    fn bitor(self, rhs: U) -> Self::Output {
        let (a, b, c) = self.into_children();
        Any::new((a, b, c, rhs.into_awaiter()))
    }
}

// (a & b) | x: the whole `all` becomes one `any` child
impl<T, U> BitOr<U> for All<T>
where
    All<T>: Awaiter,
    U: IntoAwaiter,
{
    type Output = Any<(All<T>, U::Awaiter)>;

    fn bitor(self, rhs: U) -> Self::Output {
        Any::new((self, rhs.into_awaiter()))
    }
}

/// Starts every launcher as a task and waits for the first to finish.
///
/// The await resolves to a `OneOfN` holding the winner's result; the losing
/// tasks receive a cancel request as soon as the winner is decided.
///
/// Must be called from inside a task (the launchers start on the current
/// scheduler).
///
/// ```ignore
/// match when_any((
///     TaskLauncher::new(fetch_fast()),
///     TaskLauncher::on(fetch_slow(), WORKER),
/// ))
/// .await
/// {
///     OneOf2::First(fast) => ...,
///     OneOf2::Second(slow) => ...,
/// }
/// ```
pub fn when_any<T: LauncherTuple>(launchers: T) -> Any<T::Awaiters> {
    let scheduler = Scheduler::current();
    Any::new(launchers.start_all(&scheduler))
}

/// Tuples of [`TaskLauncher`]s, for [`when_any`].
pub trait LauncherTuple {
    type Awaiters;

    fn start_all(self, scheduler: &Scheduler) -> Self::Awaiters;
}

macro_rules! impl_launcher_tuple {
    ($( $F:ident, $f:ident );+) => {
        impl<$($F),+> LauncherTuple for ($(TaskLauncher<$F>,)+)
        where
            $(
                $F: Future + Send + 'static,
                $F::Output: Send + 'static,
            )+
        {
            type Awaiters = ($(HandleAwaiter<$F::Output>,)+);

            fn start_all(self, scheduler: &Scheduler) -> Self::Awaiters {
                let ($($f,)+) = self;
                ($(HandleAwaiter::new(scheduler.start_task($f)),)+)
            }
        }
    };
}

impl_launcher_tuple!(A, a; B, b);
impl_launcher_tuple!(A, a; B, b; C, c);
impl_launcher_tuple!(A, a; B, b; C, c; D, d);
