// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::Arc;
use crate::scheduler::context;
use crate::sync::ResumeLatch;
use crate::task::TaskRef;
use crate::time::TimerArm;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Runs `f` on the current task's queue once `delay` elapsed; the await
/// resolves to `f`'s return value.
///
/// Cancelling the task while the timer is pending removes the timer and `f`
/// never runs.
pub fn execute_after<F, R>(f: F, delay: Duration) -> ExecuteAfter<F, R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    ExecuteAfter {
        f: Some(f),
        delay,
        state: State::Unregistered,
    }
}

/// Future returned by [`execute_after`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct ExecuteAfter<F, R> {
    f: Option<F>,
    delay: Duration,
    state: State<R>,
}

enum State<R> {
    Unregistered,
    Registered {
        latch: Arc<ResumeLatch<R>>,
        arm: Arc<TimerArm>,
        task: TaskRef,
    },
    Completed,
}

// === impl ExecuteAfter ===

impl<F, R> Future for ExecuteAfter<F, R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    type Output = R;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: no field of `ExecuteAfter` is structurally pinned.
        let this = unsafe { self.get_unchecked_mut() };

        if let State::Unregistered = this.state {
            let (task, scheduler) = context::current_task();
            let queue = task.current_queue();

            let latch = Arc::new(ResumeLatch::<R>::new(2));
            match latch.poll_fired(cx) {
                Poll::Pending => {}
                Poll::Ready(()) => unreachable!("latch fired before arming"),
            }

            let arm = Arc::new(TimerArm::new(Arc::downgrade(scheduler.core())));
            let deadline = Instant::now() + this.delay;
            let f = this.f.take().expect("future polled twice before arming");

            let job = {
                let latch = Arc::clone(&latch);
                let arm = Arc::clone(&arm);
                let task = task.clone();
                move || {
                    arm.disarm();
                    task.clear_cancel_hook();
                    latch.put_value(f());
                    latch.release(false);
                }
            };
            arm.arm(
                scheduler
                    .execution()
                    .plan_execution_after(job, queue, deadline),
            );

            let installed = task.install_cancel_hook({
                let arm = Arc::clone(&arm);
                move || {
                    arm.cancel_timer();
                }
            });
            if !installed {
                arm.cancel_timer();
            }

            latch.release(false);
            this.state = State::Registered { latch, arm, task };
        }

        match &this.state {
            State::Registered { latch, .. } => match latch.poll_fired(cx) {
                Poll::Ready(()) => {
                    let value = latch.take_value().expect("timer fired without a value");
                    this.state = State::Completed;
                    Poll::Ready(value)
                }
                Poll::Pending => Poll::Pending,
            },
            State::Completed => panic!("ExecuteAfter polled after completion"),
            State::Unregistered => unreachable!(),
        }
    }
}

impl<F, R> Drop for ExecuteAfter<F, R> {
    fn drop(&mut self) {
        if let State::Registered { latch, arm, task } = &self.state
            && !latch.fired()
        {
            task.clear_cancel_hook();
            arm.cancel_timer();
        }
    }
}

impl<F, R> core::fmt::Debug for ExecuteAfter<F, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = match self.state {
            State::Unregistered => "unregistered",
            State::Registered { .. } => "registered",
            State::Completed => "completed",
        };
        f.debug_struct("ExecuteAfter")
            .field("delay", &self.delay)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{PATIENCE, drive_until, scheduler};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn value_arrives_after_the_delay() {
        let scheduler = scheduler();

        let handle = scheduler.spawn(async {
            let begin = Instant::now();
            let value = execute_after(|| 6 * 7, Duration::from_millis(25)).await;
            (value, begin.elapsed())
        });

        assert!(drive_until(&scheduler, PATIENCE, || handle.done()));
        let (value, elapsed) = handle.get();
        assert_eq!(value, 42);
        assert!(elapsed >= Duration::from_millis(25));
    }

    #[test]
    fn cancelled_task_never_runs_the_closure() {
        let scheduler = scheduler();
        let ran = Arc::new(AtomicBool::new(false));

        let handle = scheduler.spawn({
            let ran = Arc::clone(&ran);
            async move {
                execute_after(
                    move || {
                        ran.store(true, Ordering::Release);
                    },
                    Duration::from_millis(100),
                )
                .await;
            }
        });

        assert!(handle.request_cancel());
        assert!(drive_until(&scheduler, PATIENCE, || handle.is_cancelled()
            && !handle.done()));

        std::thread::sleep(Duration::from_millis(200));
        assert!(!ran.load(Ordering::Acquire), "the timer must have been torn down");
    }
}
