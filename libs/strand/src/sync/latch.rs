// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use crate::sync::WaitCell;
use core::fmt;
use core::task::{Context, Poll};

/// A decrement-to-zero resume gate with an optional value slot.
///
/// An awaitable that waits on out-of-band signals creates a `ResumeLatch`
/// armed with the number of expected [`release`][Self::release] calls; the
/// releaser that brings the count to zero wakes the registered waker. The
/// arming thread conventionally holds one of the counts itself and releases it
/// right after handing the remaining ones out, so a signal that fires while
/// the awaitable is still arming cannot resume the task early.
///
/// The value slot carries at most one `T` from a releaser to the resuming
/// task; it is written before the final release and read only after the latch
/// fired, so no further synchronization is needed.
pub(crate) struct ResumeLatch<T> {
    remaining: AtomicU32,
    cancelled: AtomicBool,
    value: UnsafeCell<Option<T>>,
    cell: WaitCell,
}

// === impl ResumeLatch ===

impl<T> ResumeLatch<T> {
    pub(crate) fn new(expected: u32) -> Self {
        assert!(expected > 0, "a latch must expect at least one release");

        Self {
            remaining: AtomicU32::new(expected),
            cancelled: AtomicBool::new(false),
            value: UnsafeCell::new(None),
            cell: WaitCell::new(),
        }
    }

    /// Consumes one expected signal. The final release wakes the waiter.
    ///
    /// Returns `true` when this call was the final one.
    pub(crate) fn release(&self, cancel: bool) -> bool {
        if cancel {
            self.cancelled.store(true, Ordering::Release);
        }

        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "latch released more often than armed");

        if prev == 1 {
            self.cell.wake();
            true
        } else {
            false
        }
    }

    /// Stores the carried value. Must be called at most once, by a releaser,
    /// before its (final) `release`.
    pub(crate) fn put_value(&self, value: T) {
        self.value.with_mut(|slot| {
            // Safety: the one-shot protocol has a single writer, and readers
            // wait for the final release.
            unsafe {
                debug_assert!((*slot).is_none(), "latch value stored twice");
                *slot = Some(value);
            }
        });
    }

    /// Registers the waiter and completes once all expected releases arrived.
    pub(crate) fn poll_fired(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.fired() {
            return Poll::Ready(());
        }

        match self.cell.poll_wait(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => {
                // Re-check: the final release may have slipped in between the
                // fast path above and the waker registration.
                if self.fired() {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
        }
    }

    pub(crate) fn fired(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }

    pub(crate) fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Takes the carried value. Only meaningful after the latch fired.
    pub(crate) fn take_value(&self) -> Option<T> {
        debug_assert!(self.fired());
        self.value.with_mut(|slot| {
            // Safety: the latch fired, so the writer is done with the slot and
            // only the resuming task calls this.
            unsafe { (*slot).take() }
        })
    }
}

// Safety: the value slot is synchronized through the `remaining` counter
// (write-before-final-release, read-after-fired).
unsafe impl<T: Send> Send for ResumeLatch<T> {}
// Safety: see the `Send` impl above.
unsafe impl<T: Send> Sync for ResumeLatch<T> {}

impl<T> fmt::Debug for ResumeLatch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumeLatch")
            .field("remaining", &self.remaining.load(Ordering::Relaxed))
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use std::sync::Arc;
    use std::task::{Wake, Waker};

    struct CountingWaker(std::sync::atomic::AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    #[test]
    fn fires_exactly_on_the_last_release() {
        let latch = ResumeLatch::<()>::new(3);
        let wakes = Arc::new(CountingWaker(std::sync::atomic::AtomicUsize::new(0)));
        let waker = Waker::from(wakes.clone());
        let mut cx = Context::from_waker(&waker);

        assert!(latch.poll_fired(&mut cx).is_pending());

        assert!(!latch.release(false));
        assert!(!latch.release(false));
        assert_eq!(wakes.0.load(std::sync::atomic::Ordering::Relaxed), 0);

        assert!(latch.release(false));
        assert_eq!(wakes.0.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(latch.poll_fired(&mut cx), Poll::Ready(()));
    }

    #[test]
    fn single_count_fires_immediately() {
        let latch = ResumeLatch::<u32>::new(1);
        latch.put_value(3);
        assert!(latch.release(false));
        assert!(latch.fired());
        assert_eq!(latch.take_value(), Some(3));
    }

    #[test]
    fn cancel_flag_is_sticky() {
        let latch = ResumeLatch::<()>::new(2);
        latch.release(true);
        latch.release(false);
        assert!(latch.fired());
        assert!(latch.was_cancelled());
    }

    #[test]
    fn value_crosses_threads() {
        loom::model(|| {
            let latch = Arc::new(ResumeLatch::<String>::new(2));

            let releaser = {
                let latch = latch.clone();
                loom::thread::spawn(move || {
                    latch.put_value("ping".to_owned());
                    latch.release(false);
                })
            };

            latch.release(false);
            releaser.join().unwrap();

            while !latch.fired() {
                std::thread::yield_now();
            }
            assert_eq!(latch.take_value().as_deref(), Some("ping"));
        });
    }
}
