// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::Arc;
use crate::queue::QueueMark;
use crate::scheduler::context;
use crate::sync::ResumeLatch;
use crate::task::TaskRef;
use crate::time::TimerArm;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Suspends the current task for `duration`.
///
/// The task resumes on its current queue. Cancelling the task while it sleeps
/// removes the pending timer and culls the task at this suspension point.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        duration,
        queue: None,
        state: State::Unregistered,
    }
}

/// Like [`sleep`], but the task resumes on `queue` (it stays there
/// afterwards, like after a [`switch_to_queue`][crate::task::switch_to_queue]).
pub fn sleep_on(duration: Duration, queue: QueueMark) -> Sleep {
    Sleep {
        duration,
        queue: Some(queue),
        state: State::Unregistered,
    }
}

/// Future returned by [`sleep`] and [`sleep_on`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep {
    duration: Duration,
    queue: Option<QueueMark>,
    state: State,
}

enum State {
    Unregistered,
    Registered {
        latch: Arc<ResumeLatch<()>>,
        arm: Arc<TimerArm>,
        task: TaskRef,
    },
    Completed,
}

// === impl Sleep ===

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &self.state {
            State::Unregistered => {
                let (task, scheduler) = context::current_task();

                let queue = match self.queue {
                    Some(queue) => {
                        // Redirect the resume (and everything after it) onto
                        // the requested queue.
                        task.set_queue(queue);
                        queue
                    }
                    None => task.current_queue(),
                };

                tracing::trace!(
                    task.id = task.id().as_u64(),
                    duration = ?self.duration,
                    ?queue,
                    "Sleep::register"
                );

                // One release from the timer, one from this arming thread.
                let latch = Arc::new(ResumeLatch::<()>::new(2));
                match latch.poll_fired(cx) {
                    Poll::Pending => {}
                    Poll::Ready(()) => unreachable!("latch fired before arming"),
                }

                let arm = Arc::new(TimerArm::new(Arc::downgrade(scheduler.core())));
                let deadline = Instant::now() + self.duration;

                let job = {
                    let latch = Arc::clone(&latch);
                    let arm = Arc::clone(&arm);
                    let task = task.clone();
                    move || {
                        arm.disarm();
                        task.clear_cancel_hook();
                        latch.release(false);
                    }
                };
                arm.arm(
                    scheduler
                        .execution()
                        .plan_execution_after(job, queue, deadline),
                );

                // A cancel request against the task takes the timer with it.
                let installed = task.install_cancel_hook({
                    let arm = Arc::clone(&arm);
                    move || {
                        arm.cancel_timer();
                    }
                });
                if !installed {
                    // Already cancelled; the cull is imminent.
                    arm.cancel_timer();
                }

                latch.release(false);
                self.state = State::Registered { latch, arm, task };

                self.poll_registered(cx)
            }
            State::Registered { .. } => self.poll_registered(cx),
            State::Completed => Poll::Ready(()),
        }
    }
}

impl Sleep {
    fn poll_registered(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let State::Registered { latch, .. } = &self.state else {
            unreachable!();
        };

        match latch.poll_fired(cx) {
            Poll::Ready(()) => {
                self.state = State::Completed;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let State::Registered { latch, arm, task } = &self.state
            && !latch.fired()
        {
            // Dropped mid-sleep (typically: the task was cancelled and is
            // being culled). Remove our cancel hook and the pending timer.
            task.clear_cancel_hook();
            arm.cancel_timer();
        }
    }
}

impl core::fmt::Debug for Sleep {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = match self.state {
            State::Unregistered => "unregistered",
            State::Registered { .. } => "registered",
            State::Completed => "completed",
        };
        f.debug_struct("Sleep")
            .field("duration", &self.duration)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::WORKER;
    use crate::test_util::{PATIENCE, drive_until, scheduler};
    use std::thread;

    #[test]
    fn sleep_resumes_after_the_duration() {
        let scheduler = scheduler();

        let handle = scheduler.spawn(async {
            let begin = Instant::now();
            sleep(Duration::from_millis(40)).await;
            begin.elapsed()
        });

        assert!(drive_until(&scheduler, PATIENCE, || handle.done()));
        assert!(handle.get() >= Duration::from_millis(40));
    }

    #[test]
    fn sleep_on_moves_the_task_to_the_queue() {
        let scheduler = scheduler();
        let main_thread = thread::current().id();

        let handle = scheduler.spawn(async move {
            sleep_on(Duration::from_millis(10), WORKER).await;
            thread::current().id() != main_thread
        });

        assert!(drive_until(&scheduler, PATIENCE, || handle.done()));
        assert!(handle.get(), "the task must resume on the worker");
    }

    #[test]
    fn cancelling_a_sleeping_task_is_prompt() {
        let scheduler = scheduler();

        let handle = scheduler.spawn(async {
            sleep(Duration::from_secs(3600)).await;
        });
        assert!(!handle.done());

        let begin = Instant::now();
        assert!(handle.request_cancel());
        assert!(drive_until(&scheduler, PATIENCE, || handle.is_cancelled()
            && !handle.done()));

        // The hour-long timer did not hold anything up.
        assert!(begin.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn zero_duration_sleep_still_suspends_only_briefly() {
        let scheduler = scheduler();

        let handle = scheduler.spawn(async {
            sleep(Duration::ZERO).await;
            11
        });

        assert!(drive_until(&scheduler, PATIENCE, || handle.done()));
        assert_eq!(handle.get(), 11);
    }
}
