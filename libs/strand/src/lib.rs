// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative tasks scheduled across named execution queues.
//!
//! `strand` runs futures as cooperative tasks on a small pool of worker
//! threads plus the host ("main") thread. Every task lives on exactly one
//! *execution queue* at a time; which threads may drain which queues is
//! static configuration ([`ExecSystemConfig`]). On top of that sit
//! composable awaitables: queue switches, timed sleeps, timer-driven
//! cancellation, callback bridges, and the `&`/`|` combinators with
//! cancellation propagation.
//!
//! ```
//! use strand::{ExecSystemConfig, ExecutionSystem, Scheduler, TaskLauncher, WORKER};
//! use strand::switch_to_queue;
//!
//! let scheduler = Scheduler::new(ExecutionSystem::new(ExecSystemConfig::default()));
//!
//! let handle = scheduler.start_task(TaskLauncher::new(async {
//!     // Hop onto a worker thread for the heavy part...
//!     let prev = switch_to_queue(WORKER).await;
//!     let answer = 6 * 7;
//!     // ...and back to where we came from.
//!     switch_to_queue(prev).await;
//!     answer
//! }));
//!
//! while !handle.done() {
//!     scheduler.update_from_main();
//! }
//! assert_eq!(handle.get(), 42);
//! ```
//!
//! Cancellation is cooperative throughout: requesting it sets a flag and the
//! task is culled at its next suspension point; synchronous code is never
//! interrupted.

mod awaiter;
mod callback;
mod error;
mod exec;
mod loom;
mod queue;
mod scheduler;
mod sync;
mod task;
#[cfg(test)]
mod test_util;
pub mod time;

pub use awaiter::{
    All, Any, Awaited, Awaiter, AwaiterTuple, CancelHandle, Continue, HandleAwaiter, IntoAwaiter,
    LauncherTuple, OneOf2, OneOf3, OneOf4, when_all, when_any,
};
pub use callback::{AwaitCallback, ResumeHandle, await_callback, await_callback_with_result};
pub use error::JoinError;
pub use exec::{DelayedId, ExecSystemConfig, ExecutionSystem, ExecutorData, WorkerConfig};
pub use queue::{ANY, MAIN, MAX_QUEUES, QueueMark, QueueMask, WORKER};
pub use scheduler::{Scheduler, current_scheduler, start_task};
pub use task::{
    Cancel, Id, SwitchToQueue, TaskHandle, TaskLauncher, TaskResult, YieldNow, cancel,
    switch_to_queue, yield_now,
};
pub use time::{CancelAfter, ExecuteAfter, Sleep, cancel_after, cancel_after_on, execute_after, sleep, sleep_on};
