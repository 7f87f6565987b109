// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::exec::{ExecSystemConfig, ExecutionSystem};
use crate::scheduler::Scheduler;
use std::time::{Duration, Instant};

/// A scheduler with the default layout: one worker plus the calling (main)
/// thread.
pub(crate) fn scheduler() -> Scheduler {
    Scheduler::new(ExecutionSystem::new(ExecSystemConfig::default()))
}

pub(crate) fn scheduler_with_workers(count: usize) -> Scheduler {
    Scheduler::new(ExecutionSystem::new(ExecSystemConfig::with_workers(count)))
}

/// Drives the main-thread loop until `cond` holds. Returns `false` on
/// timeout.
pub(crate) fn drive_until(
    scheduler: &Scheduler,
    timeout: Duration,
    mut cond: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        scheduler.update_from_main();
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
}

/// Default patience for timing-dependent assertions.
pub(crate) const PATIENCE: Duration = Duration::from_secs(5);

pub(crate) fn init_tracing() -> impl Drop {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .set_default()
}
