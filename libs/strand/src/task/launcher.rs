// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::queue::{ANY, QueueMark};
use core::fmt;

/// An immutable recipe for starting a task: the future plus its target queue.
///
/// ```
/// use strand::{TaskLauncher, WORKER};
///
/// let launcher = TaskLauncher::on(async { 6 * 7 }, WORKER);
/// # let _ = launcher;
/// ```
pub struct TaskLauncher<F> {
    future: F,
    queue: QueueMark,
}

// === impl TaskLauncher ===

impl<F: Future> TaskLauncher<F> {
    /// A launcher targeting the default queue ([`ANY`]).
    pub fn new(future: F) -> Self {
        Self::on(future, ANY)
    }

    /// A launcher targeting `queue`.
    pub fn on(future: F, queue: QueueMark) -> Self {
        Self { future, queue }
    }

    pub(crate) fn into_parts(self) -> (F, QueueMark) {
        (self.future, self.queue)
    }
}

impl<F> fmt::Debug for TaskLauncher<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskLauncher")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
