// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use bitflags::bitflags;
use core::fmt;
use static_assertions::const_assert_eq;

/// The task's lifecycle word: five state bits plus the reference count in the
/// remaining high bits.
///
/// State protocol in brief:
///
/// - `POLLING` is a lock on the task's stage; only the thread that set it may
///   touch the future.
/// - `NOTIFIED` means "a run of the task is queued (or will be queued by the
///   current poller)". It is what keeps a task on at most one queue at a
///   time: wakes while it is set do nothing.
/// - `CANCELLED` is the cooperative cancel request; it takes effect at the
///   task's next scheduling point.
/// - `FINAL` means the future will never be polled again.
/// - `JOINABLE` means completion processing (continuation, result handoff) is
///   done and the result slot now belongs to the handle side.
pub(crate) struct State(AtomicUsize);

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub(crate) struct Snapshot: usize {
        const POLLING = 1 << 0;
        const NOTIFIED = 1 << 1;
        const CANCELLED = 1 << 2;
        const COMPLETE = 1 << 3;
        const FINAL = 1 << 4;
        const JOINABLE = 1 << 5;
    }
}

const REF_SHIFT: u32 = 6;
const REF_ONE: usize = 1 << REF_SHIFT;
// The flag bits and the first refcount bit must not overlap.
const_assert_eq!(Snapshot::all().bits() & REF_ONE, 0);

/// What the executor should do after asking to poll a task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum StartPollAction {
    /// Transitioned to `POLLING`; go ahead.
    Poll,
    /// A cancel request took effect: drop the future and finish the task as
    /// cancelled without polling.
    Cancel,
    /// The task already finished (e.g. a stale wakeup); do nothing.
    DontPoll,
}

/// What the executor should do with the task after a poll.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PollResult {
    /// The future completed (or was culled); run completion processing.
    Ready,
    /// Pending; a waker clone will bring the task back.
    Pending,
    /// Pending, but woken during the poll: re-plan the task now.
    PendingSchedule,
}

/// What a waker should do with its task reference.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum WakeAction {
    /// Put the task on its queue.
    Enqueue,
    /// Nothing to do (already queued, being polled, or finished).
    None,
}

// === impl State ===

impl State {
    /// A fresh task starts with a single reference (the `TaskRef` returned by
    /// allocation) and no flags.
    pub(crate) fn new() -> Self {
        Self(AtomicUsize::new(REF_ONE))
    }

    pub(crate) fn load(&self, order: Ordering) -> Snapshot {
        Snapshot::from_bits_retain(self.0.load(order))
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.0.load(Ordering::Acquire) >> REF_SHIFT
    }

    pub(crate) fn clone_ref(&self) {
        let prev = self.0.fetch_add(REF_ONE, Ordering::Relaxed);
        debug_assert!(prev >> REF_SHIFT > 0, "cloned a dead task reference");
    }

    /// Drops one reference; returns `true` when the caller held the last one
    /// and must deallocate.
    pub(crate) fn drop_ref(&self) -> bool {
        let prev = self.0.fetch_sub(REF_ONE, Ordering::Release);
        debug_assert!(prev >> REF_SHIFT > 0, "dropped a dead task reference");

        if prev >> REF_SHIFT == 1 {
            // Synchronize with every other release before freeing.
            let _ = self.0.load(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    pub(crate) fn start_poll(&self) -> StartPollAction {
        let mut current = self.load(Ordering::Acquire);
        loop {
            if current.contains(Snapshot::FINAL) {
                return StartPollAction::DontPoll;
            }

            debug_assert!(
                !current.contains(Snapshot::POLLING),
                "a task may only be polled by one thread at a time"
            );

            let (next, action) = if current.contains(Snapshot::CANCELLED) {
                (
                    (current - Snapshot::NOTIFIED) | Snapshot::FINAL,
                    StartPollAction::Cancel,
                )
            } else {
                (
                    (current - Snapshot::NOTIFIED) | Snapshot::POLLING,
                    StartPollAction::Poll,
                )
            };

            match self.compare_exchange(current, next) {
                Ok(_) => return action,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn end_poll(&self, completed: bool) -> PollResult {
        let mut current = self.load(Ordering::Acquire);
        loop {
            debug_assert!(current.contains(Snapshot::POLLING));

            let (next, result) = if completed {
                (
                    (current - Snapshot::POLLING - Snapshot::NOTIFIED)
                        | Snapshot::COMPLETE
                        | Snapshot::FINAL,
                    PollResult::Ready,
                )
            } else if current.contains(Snapshot::NOTIFIED) {
                // Woken while we were polling: the poller owes the task a
                // re-plan (NOTIFIED stays set until the next start_poll).
                (current - Snapshot::POLLING, PollResult::PendingSchedule)
            } else {
                (current - Snapshot::POLLING, PollResult::Pending)
            };

            match self.compare_exchange(current, next) {
                Ok(_) => return result,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn wake(&self) -> WakeAction {
        let mut current = self.load(Ordering::Acquire);
        loop {
            if current.intersects(Snapshot::FINAL | Snapshot::NOTIFIED) {
                return WakeAction::None;
            }

            match self.compare_exchange(current, current | Snapshot::NOTIFIED) {
                Ok(_) => {
                    return if current.contains(Snapshot::POLLING) {
                        // The polling thread observes NOTIFIED in end_poll and
                        // re-plans the task itself.
                        WakeAction::None
                    } else {
                        WakeAction::Enqueue
                    };
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Requests cancellation. Returns `true` if this was the first request and
    /// the task had not already finished.
    pub(crate) fn cancel(&self) -> bool {
        let mut current = self.load(Ordering::Acquire);
        loop {
            if current.intersects(Snapshot::CANCELLED | Snapshot::FINAL) {
                return false;
            }

            match self.compare_exchange(current, current | Snapshot::CANCELLED) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Marks completion processing as done; the result now belongs to the
    /// handle.
    pub(crate) fn set_joinable(&self) {
        let prev = Snapshot::from_bits_retain(
            self.0.fetch_or(Snapshot::JOINABLE.bits(), Ordering::AcqRel),
        );
        debug_assert!(prev.contains(Snapshot::FINAL));
        debug_assert!(!prev.contains(Snapshot::JOINABLE));
    }

    pub(crate) fn is_joinable(&self) -> bool {
        self.load(Ordering::Acquire).contains(Snapshot::JOINABLE)
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.load(Ordering::Acquire).contains(Snapshot::COMPLETE)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.load(Ordering::Acquire).contains(Snapshot::CANCELLED)
    }

    fn compare_exchange(&self, current: Snapshot, new: Snapshot) -> Result<Snapshot, Snapshot> {
        self.0
            .compare_exchange(
                current.bits(),
                new.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(Snapshot::from_bits_retain)
            .map_err(Snapshot::from_bits_retain)
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self.load(Ordering::Relaxed);
        f.debug_struct("State")
            .field("flags", &current.intersection(Snapshot::all()))
            .field("refs", &(current.bits() >> REF_SHIFT))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_cycle() {
        let state = State::new();

        assert_eq!(state.wake(), WakeAction::Enqueue);
        // Already queued: further wakes are absorbed.
        assert_eq!(state.wake(), WakeAction::None);

        assert_eq!(state.start_poll(), StartPollAction::Poll);
        assert_eq!(state.end_poll(false), PollResult::Pending);

        assert_eq!(state.wake(), WakeAction::Enqueue);
        assert_eq!(state.start_poll(), StartPollAction::Poll);
        assert_eq!(state.end_poll(true), PollResult::Ready);

        // A stale wake after completion goes nowhere.
        assert_eq!(state.wake(), WakeAction::None);
        assert_eq!(state.start_poll(), StartPollAction::DontPoll);
    }

    #[test]
    fn wake_during_poll_reschedules() {
        let state = State::new();

        assert_eq!(state.start_poll(), StartPollAction::Poll);
        assert_eq!(state.wake(), WakeAction::None);
        assert_eq!(state.end_poll(false), PollResult::PendingSchedule);

        // NOTIFIED is still set, so the task cannot be double-queued...
        assert_eq!(state.wake(), WakeAction::None);
        // ...until the re-planned run starts.
        assert_eq!(state.start_poll(), StartPollAction::Poll);
        assert_eq!(state.end_poll(true), PollResult::Ready);
    }

    #[test]
    fn cancel_takes_effect_at_the_next_schedule() {
        let state = State::new();

        assert!(state.cancel());
        assert!(!state.cancel());
        assert!(state.is_cancelled());

        assert_eq!(state.start_poll(), StartPollAction::Cancel);
        // The cull made the task final.
        assert_eq!(state.start_poll(), StartPollAction::DontPoll);
        assert!(!state.is_complete());
    }

    #[test]
    fn cancel_after_completion_is_rejected() {
        let state = State::new();

        assert_eq!(state.start_poll(), StartPollAction::Poll);
        assert_eq!(state.end_poll(true), PollResult::Ready);
        assert!(!state.cancel());
        assert!(!state.is_cancelled());
    }

    #[test]
    fn refcounting() {
        let state = State::new();
        assert_eq!(state.ref_count(), 1);

        state.clone_ref();
        state.clone_ref();
        assert_eq!(state.ref_count(), 3);

        assert!(!state.drop_ref());
        assert!(!state.drop_ref());
        assert!(state.drop_ref());
    }
}
