// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicU8, Ordering};
use core::fmt;
use std::sync::OnceLock;
use std::thread::{self, Thread};
use std::time::Instant;

/// A three-state park/unpark primitive for one owning thread.
///
/// Unlike a bare condition variable there are no spurious wakeups, and a
/// [`notify`][Self::notify] that arrives before the owner goes to
/// [`sleep`][Self::sleep] is remembered: the next sleep consumes it and
/// returns immediately, so the "check queues, then park" pattern cannot miss
/// a wakeup.
///
/// Exactly one thread (the *owner*, the first to sleep) may call `sleep`,
/// `sleep_until` and [`reset_notification`][Self::reset_notification]; any
/// thread may call `notify`.
pub(crate) struct Notifier {
    state: AtomicU8,
    owner: OnceLock<Thread>,
}

const IDLE: u8 = 0;
const SLEEPING: u8 = 1;
const SIGNALLED: u8 = 2;

// === impl Notifier ===

impl Notifier {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            owner: OnceLock::new(),
        }
    }

    /// Wakes the owner if it sleeps, or poisons its next sleep attempt.
    pub(crate) fn notify(&self) {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            match current {
                SIGNALLED => return,
                _ => match self.state.compare_exchange(
                    current,
                    SIGNALLED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(prev) => {
                        if prev == SLEEPING
                            && let Some(owner) = self.owner.get()
                        {
                            owner.unpark();
                        }
                        return;
                    }
                    Err(actual) => current = actual,
                },
            }
        }
    }

    /// Parks the calling thread until notified. Consumes a pending
    /// notification instead of sleeping.
    pub(crate) fn sleep(&self) {
        if self.transition_to_sleeping() {
            while self.state.load(Ordering::Acquire) == SLEEPING {
                thread::park();
            }
            self.state.store(IDLE, Ordering::Release);
        }
    }

    /// Like [`sleep`][Self::sleep], but returns at `deadline` even without a
    /// notification.
    pub(crate) fn sleep_until(&self, deadline: Instant) {
        if !self.transition_to_sleeping() {
            return;
        }

        while self.state.load(Ordering::Acquire) == SLEEPING {
            let now = Instant::now();
            if now >= deadline {
                // Try to retract the sleep; losing the race means a signal
                // arrived, which the store below consumes.
                let _ = self.state.compare_exchange(
                    SLEEPING,
                    IDLE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                break;
            }
            thread::park_timeout(deadline - now);
        }
        self.state.store(IDLE, Ordering::Release);
    }

    /// Discards any pending notification. Owner only, and never while a sleep
    /// is in progress.
    pub(crate) fn reset_notification(&self) {
        debug_assert_ne!(self.state.load(Ordering::Relaxed), SLEEPING);
        self.state.store(IDLE, Ordering::Relaxed);
    }

    /// Whether the owner is currently parked (or about to park). Used to
    /// prefer waking an idle worker over poking a busy one.
    pub(crate) fn is_sleeping(&self) -> bool {
        self.state.load(Ordering::Relaxed) == SLEEPING
    }

    /// CAS `idle -> sleeping`, registering the calling thread as owner.
    ///
    /// Returns `false` when a pending notification was consumed instead.
    fn transition_to_sleeping(&self) -> bool {
        let owner = self.owner.get_or_init(thread::current);
        debug_assert_eq!(
            owner.id(),
            thread::current().id(),
            "only the owning thread may sleep on a Notifier"
        );

        match self
            .state
            .compare_exchange(IDLE, SLEEPING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(actual) => {
                debug_assert_eq!(actual, SIGNALLED, "unexpected notifier state");
                // Consume the pre-arrival notification.
                let _ = self.state.compare_exchange(
                    SIGNALLED,
                    IDLE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                false
            }
        }
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Relaxed) {
            IDLE => "idle",
            SLEEPING => "sleeping",
            SIGNALLED => "signalled",
            _ => "?",
        };
        f.debug_struct("Notifier").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn notify_before_sleep_prevents_blocking() {
        let notifier = Notifier::new();
        notifier.notify();

        let start = Instant::now();
        notifier.sleep();
        // A pending notification short-circuits the sleep entirely.
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn notify_wakes_a_sleeping_thread() {
        loom::model(|| {
            let notifier = Arc::new(Notifier::new());
            let woke = Arc::new(AtomicBool::new(false));

            let sleeper = {
                let notifier = notifier.clone();
                let woke = woke.clone();
                loom::thread::spawn(move || {
                    notifier.sleep();
                    woke.store(true, Ordering::Release);
                })
            };

            while !notifier.is_sleeping() {
                std::thread::yield_now();
            }
            notifier.notify();

            sleeper.join().unwrap();
            assert!(woke.load(Ordering::Acquire));
        });
    }

    #[test]
    fn sleep_until_returns_at_the_deadline() {
        let notifier = Notifier::new();

        let start = Instant::now();
        notifier.sleep_until(Instant::now() + Duration::from_millis(50));
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn reset_discards_a_pending_notification() {
        let notifier = Notifier::new();
        notifier.notify();
        notifier.reset_notification();

        // The notification is gone, so a timed sleep now runs to its deadline.
        let start = Instant::now();
        notifier.sleep_until(Instant::now() + Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn repeated_notify_is_idempotent() {
        let notifier = Notifier::new();
        notifier.notify();
        notifier.notify();
        notifier.notify();

        let start = Instant::now();
        notifier.sleep();
        assert!(start.elapsed() < Duration::from_millis(100));

        // Only one notification was recorded; the next timed sleep blocks.
        let start = Instant::now();
        notifier.sleep_until(Instant::now() + Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
