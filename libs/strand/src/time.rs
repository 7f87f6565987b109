// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Timer-driven awaitables. All of them use the execution system's monotonic
//! timer service and are cancellable: a cancel request against the awaiting
//! task tears the pending timer down through the task's one-shot cancel slot.

mod cancel_after;
mod execute_after;
mod sleep;

pub use cancel_after::{CancelAfter, cancel_after, cancel_after_on};
pub use execute_after::{ExecuteAfter, execute_after};
pub use sleep::{Sleep, sleep, sleep_on};

use crate::exec::DelayedId;
use crate::loom::sync::Weak;
use crate::loom::sync::atomic::{AtomicU64, Ordering};
use crate::scheduler::SchedulerCore;

/// A pending timer's id slot, shared between the arming poll, the firing job
/// and whoever cancels.
///
/// The id is claimed with an atomic swap, so exactly one of "fire" and
/// "cancel" acts on the timer service; the loser of the race sees the empty
/// slot.
pub(crate) struct TimerArm {
    id: AtomicU64,
    core: Weak<SchedulerCore>,
}

// === impl TimerArm ===

impl TimerArm {
    pub(crate) fn new(core: Weak<SchedulerCore>) -> Self {
        Self {
            id: AtomicU64::new(0),
            core,
        }
    }

    /// Publishes the scheduled timer's id.
    pub(crate) fn arm(&self, id: DelayedId) {
        self.id.store(id.to_raw(), Ordering::Release);
    }

    /// Claims the id on the firing path, so a later cancel finds nothing.
    pub(crate) fn disarm(&self) {
        self.id.swap(0, Ordering::AcqRel);
    }

    /// Claims the id and cancels the pending timer.
    ///
    /// Returns `true` when the timer was still pending and will never fire;
    /// `false` when it already fired (or is firing), in which case the firing
    /// path has the last word.
    pub(crate) fn cancel_timer(&self) -> bool {
        let Some(id) = DelayedId::from_raw(self.id.swap(0, Ordering::AcqRel)) else {
            return false;
        };
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        core.exec().cancel_execution(id)
    }
}
