// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::scheduler::context;
use core::pin::Pin;
use core::task::{Context, Poll};

/// Cancels the current task.
///
/// The await never resumes: the cancellation flag is set and the task is
/// culled at this very suspension point. Code after the await does not run.
pub fn cancel() -> Cancel {
    Cancel(())
}

/// Future returned by [`cancel`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Cancel(());

impl Future for Cancel {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let (task, _scheduler) = context::current_task();
        task.request_cancel();
        Poll::Pending
    }
}
