// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::exec::Job;
use crate::exec::notifier::Notifier;
use crate::loom::sync::atomic::{AtomicU64, Ordering};
use crate::queue::QueueMark;
use core::fmt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Identifies one delayed work item for cancellation.
///
/// Ids are process-unique and never reused. The raw representation fits an
/// `AtomicU64` (zero meaning "no id"), so awaitables can publish and claim
/// their pending timer lock-free.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DelayedId(u64);

/// The deadline-sorted set of pending delayed work items.
///
/// A dedicated timer thread (owned by the execution system) sleeps on the
/// notifier until the earliest deadline, then moves due entries onto their
/// execution queues. Scheduling an earlier deadline pokes the notifier so the
/// thread re-arms its sleep.
pub(crate) struct TimerQueue {
    state: Mutex<TimerState>,
    pub(super) notifier: Notifier,
    next_id: AtomicU64,
}

struct TimerState {
    /// Pending entries ordered by deadline; the id breaks ties.
    entries: BTreeMap<(Instant, u64), Entry>,
    /// Reverse index for cancellation by id.
    index: HashMap<u64, Instant>,
}

struct Entry {
    job: Job,
    queue: QueueMark,
}

// === impl DelayedId ===

impl DelayedId {
    pub(crate) const fn to_raw(self) -> u64 {
        self.0
    }

    /// Re-creates an id from [`to_raw`][Self::to_raw] output. Zero yields
    /// `None`.
    pub(crate) const fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 { None } else { Some(Self(raw)) }
    }
}

// === impl TimerQueue ===

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TimerState {
                entries: BTreeMap::new(),
                index: HashMap::new(),
            }),
            notifier: Notifier::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `job` to be planned on `queue` at `deadline`.
    pub(crate) fn schedule(&self, job: Job, queue: QueueMark, deadline: Instant) -> DelayedId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let became_earliest = {
            let mut state = self.state.lock();

            let became_earliest = state
                .entries
                .first_key_value()
                .is_none_or(|((first, _), _)| deadline < *first);

            state.entries.insert((deadline, id), Entry { job, queue });
            state.index.insert(id, deadline);

            became_earliest
        };

        tracing::trace!(id, ?deadline, ?queue, "TimerQueue::schedule");

        if became_earliest {
            // The timer thread may be sleeping towards a later deadline.
            self.notifier.notify();
        }

        DelayedId(id)
    }

    /// Removes a pending entry.
    ///
    /// Returns `true` when the cancel won: the entry was still pending and its
    /// job will never run. `false` means the job already ran or is in flight
    /// on its queue.
    pub(crate) fn cancel(&self, id: DelayedId) -> bool {
        let mut state = self.state.lock();

        let Some(deadline) = state.index.remove(&id.0) else {
            return false;
        };

        let removed = state.entries.remove(&(deadline, id.0));
        debug_assert!(removed.is_some(), "index and entry set diverged");

        tracing::trace!(id = id.0, "TimerQueue::cancel");
        true
    }

    /// Extracts every entry due at `now`, plus the next pending deadline.
    pub(crate) fn pop_due(&self, now: Instant) -> (Vec<(Job, QueueMark)>, Option<Instant>) {
        let mut state = self.state.lock();

        let mut due = Vec::new();
        while let Some((&(deadline, id), _)) = state.entries.first_key_value() {
            if deadline > now {
                break;
            }

            let entry = state
                .entries
                .remove(&(deadline, id))
                .expect("first_key_value was just observed");
            state.index.remove(&id);
            due.push((entry.job, entry.queue));
        }

        let next = state.entries.first_key_value().map(|(&(d, _), _)| d);
        (due, next)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("pending", &self.state.lock().entries.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ANY;
    use std::time::Duration;

    fn noop() -> Job {
        Box::new(|| {})
    }

    #[test]
    fn pop_due_respects_deadlines() {
        let timer = TimerQueue::new();
        let now = Instant::now();

        timer.schedule(noop(), ANY, now + Duration::from_millis(10));
        timer.schedule(noop(), ANY, now + Duration::from_secs(60));

        let (due, next) = timer.pop_due(now + Duration::from_millis(20));
        assert_eq!(due.len(), 1);
        assert_eq!(next, Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn past_deadlines_fire_on_the_next_pop() {
        let timer = TimerQueue::new();
        let now = Instant::now();

        timer.schedule(noop(), ANY, now - Duration::from_millis(5));
        let (due, next) = timer.pop_due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(next, None);
        assert!(timer.is_empty());
    }

    #[test]
    fn cancel_wins_only_while_pending() {
        let timer = TimerQueue::new();
        let now = Instant::now();

        let id = timer.schedule(noop(), ANY, now + Duration::from_secs(60));
        assert!(timer.cancel(id));
        // A second cancel of the same id reports the lost race.
        assert!(!timer.cancel(id));

        let id = timer.schedule(noop(), ANY, now);
        let (due, _) = timer.pop_due(now);
        assert_eq!(due.len(), 1);
        assert!(!timer.cancel(id));
    }

    #[test]
    fn raw_id_roundtrip() {
        let timer = TimerQueue::new();
        let id = timer.schedule(noop(), ANY, Instant::now());

        assert_eq!(DelayedId::from_raw(id.to_raw()), Some(id));
        assert_eq!(DelayedId::from_raw(0), None);
    }
}
