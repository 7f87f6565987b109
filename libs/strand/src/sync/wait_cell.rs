// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use bitflags::bitflags;
use core::fmt;
use core::task::{Context, Poll, Waker};
use static_assertions::const_assert_eq;

/// An atomically registered [`Waker`].
///
/// The cell stores the waker of at most one task. Registration
/// ([`poll_wait`][Self::poll_wait]) and waking ([`wake`][Self::wake]) may race
/// freely from different threads; the state word below arbitrates who touches
/// the waker slot.
///
/// This is the same synchronization strategy as Tokio's `AtomicWaker`: a
/// registering task briefly holds the `REGISTERING` bit, a waking thread the
/// `WAKING` bit, and whoever loses a race defers to the winner.
pub(crate) struct WaitCell {
    state: AtomicUsize,
    waker: UnsafeCell<Option<Waker>>,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct State: usize {
        const EMPTY = 0b0000;
        const REGISTERING = 0b0001;
        const WAKING = 0b0010;
        const WOKEN = 0b0100;
        const CLOSED = 0b1000;
    }
}
// EMPTY must be all-zeroes: the state word starts there.
const_assert_eq!(State::EMPTY.bits(), 0);

/// Why [`WaitCell::poll_wait`] did not register a waker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum WakeReason {
    /// The cell was woken (possibly before we got here).
    Woken,
    /// The cell was closed; no further wakeups will be delivered.
    Closed,
}

// === impl WaitCell ===

impl WaitCell {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicUsize::new(State::EMPTY.bits()),
            waker: UnsafeCell::new(None),
        }
    }

    /// Registers the waker from `cx`, or completes immediately when a wakeup
    /// already arrived.
    ///
    /// Returns `Poll::Ready` with the [`WakeReason`] when there is nothing to
    /// wait for, `Poll::Pending` once the waker is parked in the cell.
    pub(crate) fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<WakeReason> {
        match self.compare_exchange(State::EMPTY, State::REGISTERING, Ordering::Acquire) {
            Err(actual) if actual.contains(State::CLOSED) => {
                return Poll::Ready(WakeReason::Closed);
            }
            Err(actual) if actual.contains(State::WOKEN) => {
                // Consume the pending wakeup.
                self.fetch_and(!State::WOKEN, Ordering::AcqRel);
                return Poll::Ready(WakeReason::Woken);
            }
            Err(actual) if actual.contains(State::WAKING) => {
                // A wake is in flight; don't go to sleep now.
                return Poll::Ready(WakeReason::Woken);
            }
            Err(_) => {
                // Another task is mid-registration. Yield and try again.
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            Ok(_) => {}
        }

        self.waker.with_mut(|waker| {
            // Safety: the REGISTERING bit grants exclusive access to the slot.
            unsafe {
                match &mut *waker {
                    Some(old) if old.will_wake(cx.waker()) => {}
                    other => *other = Some(cx.waker().clone()),
                }
            }
        });

        if let Err(actual) =
            self.compare_exchange(State::REGISTERING, State::EMPTY, Ordering::AcqRel)
        {
            // A wake or close arrived while we were registering. Take the
            // waker back out and report the wakeup to the caller directly.
            tracing::trace!(state = ?actual, "WaitCell: notified during registration");

            // Safety: a waker observing REGISTERING never touches the slot, so
            // access is still exclusive here.
            let waker = self.waker.with_mut(|waker| unsafe { (*waker).take() });
            drop(waker);

            // Reset everything except a CLOSED bit.
            let state = self.fetch_and(State::CLOSED, Ordering::AcqRel);

            if state.contains(State::CLOSED) {
                return Poll::Ready(WakeReason::Closed);
            }
            return Poll::Ready(WakeReason::Woken);
        }

        Poll::Pending
    }

    /// Wakes the registered waker, if any. Returns `true` when a waker fired.
    pub(crate) fn wake(&self) -> bool {
        self.notify(State::WAKING | State::WOKEN)
    }

    /// Closes the cell, waking any registered waker. Further `poll_wait`s
    /// complete with [`WakeReason::Closed`].
    pub(crate) fn close(&self) -> bool {
        self.notify(State::WAKING | State::WOKEN | State::CLOSED)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.current_state().contains(State::CLOSED)
    }

    fn notify(&self, bits: State) -> bool {
        let state = self.fetch_or(bits, Ordering::AcqRel);

        if state.intersects(State::WAKING | State::REGISTERING | State::CLOSED) {
            // Someone else is touching the slot; they will observe our WOKEN
            // (or CLOSED) bit and finish the job.
            return false;
        }

        // Safety: we won the WAKING bit, nobody else touches the slot.
        let waker = self.waker.with_mut(|waker| unsafe { (*waker).take() });
        self.fetch_and(!State::WAKING, Ordering::AcqRel);

        if let Some(waker) = waker {
            tracing::trace!(?waker, "WaitCell: waking");
            waker.wake();
            true
        } else {
            false
        }
    }

    #[inline(always)]
    fn compare_exchange(
        &self,
        current: State,
        new: State,
        success: Ordering,
    ) -> Result<State, State> {
        self.state
            .compare_exchange(current.bits(), new.bits(), success, Ordering::Acquire)
            .map(State::from_bits_retain)
            .map_err(State::from_bits_retain)
    }

    #[inline(always)]
    fn fetch_and(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.fetch_and(state.bits(), order))
    }

    #[inline(always)]
    fn fetch_or(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.fetch_or(state.bits(), order))
    }

    #[inline(always)]
    fn current_state(&self) -> State {
        State::from_bits_retain(self.state.load(Ordering::Acquire))
    }
}

impl Drop for WaitCell {
    fn drop(&mut self) {
        self.close();
    }
}

// Safety: all accesses to the waker slot are arbitrated by the state word.
unsafe impl Send for WaitCell {}
// Safety: see the `Send` impl above.
unsafe impl Sync for WaitCell {}

impl fmt::Debug for WaitCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitCell")
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWaker(std::sync::atomic::AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    fn waker() -> (Arc<CountingWaker>, Waker) {
        let count = Arc::new(CountingWaker(std::sync::atomic::AtomicUsize::new(0)));
        let waker = Waker::from(count.clone());
        (count, waker)
    }

    #[test]
    fn wake_after_register_fires() {
        let cell = WaitCell::new();
        let (count, waker) = waker();
        let mut cx = Context::from_waker(&waker);

        assert!(cell.poll_wait(&mut cx).is_pending());
        assert!(cell.wake());
        assert_eq!(count.0.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn wake_before_register_is_consumed() {
        let cell = WaitCell::new();
        let (count, waker) = waker();
        let mut cx = Context::from_waker(&waker);

        assert!(!cell.wake());
        assert_eq!(cell.poll_wait(&mut cx), Poll::Ready(WakeReason::Woken));
        // The wakeup was consumed in-line, no waker fired.
        assert_eq!(count.0.load(std::sync::atomic::Ordering::Relaxed), 0);

        // And the cell is reusable afterwards.
        assert!(cell.poll_wait(&mut cx).is_pending());
    }

    #[test]
    fn close_reports_closed() {
        let cell = WaitCell::new();
        let (_count, waker) = waker();
        let mut cx = Context::from_waker(&waker);

        cell.close();
        assert_eq!(cell.poll_wait(&mut cx), Poll::Ready(WakeReason::Closed));
        assert!(cell.is_closed());
    }
}
