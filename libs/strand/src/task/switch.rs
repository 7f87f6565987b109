// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::queue::QueueMark;
use crate::scheduler::context;
use core::pin::Pin;
use core::task::{Context, Poll};

/// Moves the current task onto `queue`.
///
/// The await resolves to the task's previous queue marker (handy for
/// switching back). When the task already runs on `queue` this is a no-op
/// and does not suspend.
///
/// ```ignore
/// let prev = switch_to_queue(WORKER).await;
/// // ... heavy work off the main thread ...
/// switch_to_queue(prev).await;
/// ```
pub fn switch_to_queue(queue: QueueMark) -> SwitchToQueue {
    SwitchToQueue { queue, prev: None }
}

/// Future returned by [`switch_to_queue`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct SwitchToQueue {
    queue: QueueMark,
    prev: Option<QueueMark>,
}

impl Future for SwitchToQueue {
    type Output = QueueMark;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(prev) = self.prev {
            // Back after the switch, now running on the new queue.
            return Poll::Ready(prev);
        }

        let (task, _scheduler) = context::current_task();

        let prev = task.current_queue();
        if prev == self.queue {
            return Poll::Ready(prev);
        }

        tracing::trace!(task.id = task.id().as_u64(), from = ?prev, to = ?self.queue, "switching queue");

        self.prev = Some(prev);
        task.set_queue(self.queue);

        // Wake ourselves: the executor observes the wake at the end of this
        // poll and re-plans the task, now on the new queue.
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ANY, MAIN, WORKER};
    use crate::test_util::{PATIENCE, drive_until, scheduler};
    use std::thread;

    #[test]
    fn hop_to_worker_and_back_to_main() {
        let _trace = crate::test_util::init_tracing();

        let scheduler = scheduler();
        let main_thread = thread::current().id();

        let handle = scheduler.spawn(async move {
            let prev = switch_to_queue(WORKER).await;
            assert_eq!(prev, ANY);
            assert_ne!(thread::current().id(), main_thread);

            let prev = switch_to_queue(MAIN).await;
            assert_eq!(prev, WORKER);
            assert_eq!(thread::current().id(), main_thread);

            7
        });

        assert!(drive_until(&scheduler, PATIENCE, || handle.done()));
        assert_eq!(handle.get(), 7);
    }

    #[test]
    fn switch_to_the_current_queue_does_not_suspend() {
        let scheduler = scheduler();

        let handle = scheduler.spawn(async {
            let prev = switch_to_queue(ANY).await;
            let prev_again = switch_to_queue(ANY).await;
            (prev, prev_again)
        });

        // The task started inline and never suspended, so it is already done
        // without a single scheduler turn.
        assert!(handle.done());
        assert_eq!(handle.get(), (ANY, ANY));
    }
}
