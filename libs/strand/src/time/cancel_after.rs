// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::awaiter::{Awaited, Awaiter, CancelHandle, Continue, IntoAwaiter};
use crate::loom::sync::Arc;
use crate::queue::{ANY, QueueMark};
use crate::scheduler::context;
use crate::task::TaskRef;
use crate::time::TimerArm;
use core::fmt;
use core::ops::{BitAnd, BitOr};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// A watchdog awaiter: when its timer fires, the *awaiting task* (and with it
/// the whole combinator expression) is cancelled.
///
/// Its natural habitat is the right-hand side of `|`, as a timeout:
///
/// ```ignore
/// // Cancel `work` (and the current task) when 20ms pass without a result.
/// (work_handle | cancel_after(Duration::from_millis(20))).await;
/// ```
///
/// When a sibling finishes first, the combinator cancels the watchdog, which
/// simply removes the pending timer.
pub fn cancel_after(delay: Duration) -> CancelAfter {
    CancelAfter { delay, queue: None }
}

/// Like [`cancel_after`], but the cancel fires from `queue` instead of
/// [`ANY`].
pub fn cancel_after_on(delay: Duration, queue: QueueMark) -> CancelAfter {
    CancelAfter {
        delay,
        queue: Some(queue),
    }
}

/// Awaiter returned by [`cancel_after`] / [`cancel_after_on`].
pub struct CancelAfter {
    delay: Duration,
    queue: Option<QueueMark>,
}

/// State shared between the armed timer's job and the combinator's cancel
/// path.
struct Armed {
    arm: TimerArm,
    cont: Mutex<Option<Continue>>,
    task: TaskRef,
}

// === impl CancelAfter ===

impl Awaiter for CancelAfter {
    type Output = ();

    fn ready(&mut self) -> bool {
        false
    }

    fn suspend(&mut self, cont: Continue) -> CancelHandle {
        let (task, scheduler) = context::current_task();
        let queue = self.queue.unwrap_or(ANY);
        let deadline = Instant::now() + self.delay;

        let armed = Arc::new(Armed {
            arm: TimerArm::new(Arc::downgrade(scheduler.core())),
            cont: Mutex::new(Some(cont)),
            task,
        });

        tracing::trace!(delay = ?self.delay, ?queue, "CancelAfter::suspend");

        let job = {
            let armed = Arc::clone(&armed);
            move || {
                armed.arm.disarm();

                // Resume the enclosing combinator with the cancel indicator,
                // then cancel the task group.
                let cont = armed.cont.lock().take();
                if let Some(cont) = cont {
                    cont.fire(true);
                }
                armed.task.request_cancel();
            }
        };
        armed
            .arm
            .arm(scheduler
                .execution()
                .plan_execution_after(job, queue, deadline));

        CancelHandle::new(move || {
            if armed.arm.cancel_timer() {
                // The cancel won: report the watchdog as cancelled so the
                // combinator's bookkeeping drains.
                let cont = armed.cont.lock().take();
                if let Some(cont) = cont {
                    cont.fire(true);
                }
            }
            // Otherwise the timer fired (or is firing) and its job has the
            // last word.
        })
    }

    fn cancel(&mut self) {
        // Nothing armed before `suspend`; nothing to do.
    }

    fn resume(&mut self) {
        // The watchdog only ever finishes cancelled, so a combinator never
        // extracts a value from it.
    }
}

impl IntoAwaiter for CancelAfter {
    type Awaiter = Self;

    fn into_awaiter(self) -> Self {
        self
    }
}

impl IntoFuture for CancelAfter {
    type Output = ();
    type IntoFuture = Awaited<Self>;

    fn into_future(self) -> Awaited<Self> {
        Awaited::new(self)
    }
}

// cancel_after(..) | x and cancel_after(..) & x
impl<U: IntoAwaiter> BitOr<U> for CancelAfter {
    type Output = crate::awaiter::Any<(CancelAfter, U::Awaiter)>;

    fn bitor(self, rhs: U) -> Self::Output {
        crate::awaiter::Any::new((self, rhs.into_awaiter()))
    }
}

impl<U: IntoAwaiter> BitAnd<U> for CancelAfter {
    type Output = crate::awaiter::All<(CancelAfter, U::Awaiter)>;

    fn bitand(self, rhs: U) -> Self::Output {
        crate::awaiter::All::new((self, rhs.into_awaiter()))
    }
}

impl fmt::Debug for CancelAfter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelAfter")
            .field("delay", &self.delay)
            .field("queue", &self.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{ResumeHandle, await_callback};
    use crate::scheduler::start_task;
    use crate::task::TaskLauncher;
    use crate::test_util::{PATIENCE, drive_until, scheduler};
    use std::sync::Arc;

    async fn stuck(keep: Arc<()>) {
        let _keep = keep;
        await_callback(|resume: ResumeHandle<()>| drop(resume)).await;
    }

    #[test]
    fn watchdog_cancels_the_task_group() {
        let _trace = crate::test_util::init_tracing();

        let scheduler = scheduler();
        let tracker = Arc::new(());

        let handle = scheduler.spawn({
            let tracker = Arc::clone(&tracker);
            async move {
                let endless = start_task(TaskLauncher::new(stuck(tracker)));
                (endless | cancel_after(Duration::from_millis(20))).await;
            }
        });

        assert!(!handle.done());

        // After enough main-thread drain, the watchdog has fired: the task is
        // cancelled rather than completed, and the inner task is gone too.
        assert!(drive_until(&scheduler, PATIENCE, || {
            handle.is_cancelled() && Arc::strong_count(&tracker) == 1
        }));
        assert!(!handle.done());
    }

    #[test]
    fn finished_sibling_disarms_the_watchdog() {
        let scheduler = scheduler();

        let handle = scheduler.spawn(async {
            let quick = start_task(TaskLauncher::new(async { 5 }));
            (quick | cancel_after(Duration::from_secs(3600))).await
        });

        assert!(drive_until(&scheduler, PATIENCE, || handle.done()));
        assert!(matches!(handle.get(), crate::awaiter::OneOf2::First(5)));

        // With the watchdog's timer removed, shutdown is immediate.
        let begin = Instant::now();
        drop(scheduler);
        assert!(begin.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn standalone_await_cancels_the_task() {
        let scheduler = scheduler();

        let handle = scheduler.spawn(async {
            cancel_after(Duration::from_millis(10)).await;
        });

        assert!(drive_until(&scheduler, PATIENCE, || handle.is_cancelled()));
        assert!(!handle.done());
    }
}
