// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The execution system: named work queues drained by a pool of worker
//! threads plus the host ("main") thread, and the timer service behind
//! [`plan_execution_after`][ExecutionSystem::plan_execution_after].

mod local;
pub(crate) mod notifier;
mod timer;

use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::queue::{ANY, MAIN, MAX_QUEUES, QueueMark, QueueMask, WORKER};
use mpmc_queue::MpmcQueue;
use notifier::Notifier;
use std::sync::OnceLock;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

pub use local::ExecutorData;
pub use timer::DelayedId;
pub(crate) use timer::TimerQueue;

/// A type-erased work item.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Configuration of one worker thread.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    pub mask: QueueMask,
}

/// Configuration of an [`ExecutionSystem`].
///
/// One worker thread is spawned per entry in `worker_configs`. The host
/// thread (the one constructing the system and later calling
/// [`update_from_main`][ExecutionSystem::update_from_main]) participates with
/// `main_thread_mask`. `max_queue` is the highest queue marker in use; the
/// system creates one FIFO per marker up to it.
#[derive(Debug, Clone)]
pub struct ExecSystemConfig {
    pub worker_configs: Vec<WorkerConfig>,
    pub main_thread_mask: QueueMask,
    pub max_queue: QueueMark,
}

/// The thread pool and its queues.
///
/// Work enters through [`plan_execution`][Self::plan_execution] (or its timed
/// sibling) and is drained by whichever admitted thread gets to it first.
/// Within one queue, items run in FIFO order; across queues no order is
/// implied.
///
/// Dropping the system stops the workers: each drains the queues it admits
/// one final time, then exits; still-undrained items are dropped unexecuted.
pub struct ExecutionSystem {
    shared: Arc<ExecShared>,
    worker_handles: Vec<JoinHandle<()>>,
    timer_handle: Option<JoinHandle<()>>,
}

pub(crate) struct ExecShared {
    /// One FIFO per queue marker, indexed by `QueueMark::index`.
    queues: Box<[TaskQueue]>,
    workers: Box<[WorkerShared]>,
    /// Ascending queue indices the main thread drains.
    main_drain_order: Vec<u8>,
    main_mask: QueueMask,
    main_thread: ThreadId,
    timer: TimerQueue,
    stopping: AtomicBool,
}

struct TaskQueue {
    jobs: MpmcQueue<Job>,
    /// Indices of the workers whose mask admits this queue.
    admitted_workers: Vec<usize>,
}

struct WorkerShared {
    name: String,
    mask: QueueMask,
    notifier: Notifier,
    /// Ascending queue indices this worker drains; earlier entries win when
    /// several queues hold work (fixed priority, no round-robin).
    drain_order: Vec<u8>,
    thread_id: OnceLock<ThreadId>,
}

// === impl WorkerConfig ===

impl WorkerConfig {
    pub fn new(name: impl Into<String>, mask: impl Into<QueueMask>) -> Self {
        Self {
            name: name.into(),
            mask: mask.into(),
        }
    }
}

// === impl ExecSystemConfig ===

impl ExecSystemConfig {
    /// `count` workers named `worker-N`, each admitting the default
    /// worker-side queues.
    pub fn with_workers(count: usize) -> Self {
        Self {
            worker_configs: (0..count)
                .map(|i| WorkerConfig::new(format!("worker-{i}"), WORKER | ANY))
                .collect(),
            ..Self::default()
        }
    }
}

impl Default for ExecSystemConfig {
    fn default() -> Self {
        Self {
            worker_configs: vec![WorkerConfig::new("worker-0", WORKER | ANY)],
            main_thread_mask: MAIN | ANY,
            max_queue: ANY,
        }
    }
}

// === impl ExecutionSystem ===

impl ExecutionSystem {
    /// Builds the queues and spawns the worker and timer threads.
    ///
    /// Must be called on the thread that will drive
    /// [`update_from_main`][Self::update_from_main].
    ///
    /// # Panics
    ///
    /// Panics when a worker mask admits a queue beyond `max_queue`, or when
    /// OS thread spawning fails.
    #[must_use]
    pub fn new(config: ExecSystemConfig) -> Self {
        let num_queues = config.max_queue.index_u8() + 1;
        assert!(num_queues <= MAX_QUEUES);

        let workers: Box<[WorkerShared]> = config
            .worker_configs
            .iter()
            .map(|cfg| {
                let drain_order: Vec<u8> = cfg
                    .mask
                    .indices()
                    .inspect(|&qi| {
                        assert!(
                            qi < num_queues,
                            "worker {:?} admits queue {qi} beyond max_queue",
                            cfg.name
                        );
                    })
                    .collect();

                WorkerShared {
                    name: cfg.name.clone(),
                    mask: cfg.mask,
                    notifier: Notifier::new(),
                    drain_order,
                    thread_id: OnceLock::new(),
                }
            })
            .collect();

        let queues: Box<[TaskQueue]> = (0..num_queues)
            .map(|qi| TaskQueue {
                jobs: MpmcQueue::new(),
                admitted_workers: workers
                    .iter()
                    .enumerate()
                    .filter(|(_, w)| w.mask.admits(QueueMark::from_index(qi)))
                    .map(|(i, _)| i)
                    .collect(),
            })
            .collect();

        let main_drain_order: Vec<u8> = config
            .main_thread_mask
            .indices()
            .filter(|&qi| qi < num_queues)
            .collect();

        let shared = Arc::new(ExecShared {
            queues,
            workers,
            main_drain_order,
            main_mask: config.main_thread_mask,
            main_thread: thread::current().id(),
            timer: TimerQueue::new(),
            stopping: AtomicBool::new(false),
        });

        let worker_handles = (0..shared.workers.len())
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(shared.workers[index].name.clone())
                    .spawn(move || worker_loop(&shared, index))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        let timer_handle = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("strand-timer".to_owned())
                .spawn(move || timer_loop(&shared))
                .expect("failed to spawn timer thread")
        };

        Self {
            shared,
            worker_handles,
            timer_handle: Some(timer_handle),
        }
    }

    /// Queues `job` on `queue` and wakes a thread that can run it.
    pub fn plan_execution(&self, job: impl FnOnce() + Send + 'static, queue: QueueMark) {
        self.shared.plan_execution(Box::new(job), queue);
    }

    /// Runs `job` inline when the calling thread admits `queue`, otherwise
    /// defers to [`plan_execution`][Self::plan_execution].
    pub fn execute_or_plan_execution(&self, job: impl FnOnce() + Send + 'static, queue: QueueMark) {
        if self.is_current_thread_fits(queue) {
            job();
        } else {
            self.shared.plan_execution(Box::new(job), queue);
        }
    }

    /// Whether the calling thread is allowed to drain `queue`.
    #[must_use]
    pub fn is_current_thread_fits(&self, queue: QueueMark) -> bool {
        self.shared.current_thread_mask().admits(queue)
    }

    /// Schedules `job` to be planned on `queue` once `deadline` passes.
    ///
    /// The returned id cancels the timer via
    /// [`cancel_execution`][Self::cancel_execution].
    pub fn plan_execution_after(
        &self,
        job: impl FnOnce() + Send + 'static,
        queue: QueueMark,
        deadline: Instant,
    ) -> DelayedId {
        self.shared.timer.schedule(Box::new(job), queue, deadline)
    }

    /// Cancels a pending delayed job.
    ///
    /// Returns `true` when the cancel won the race against the deadline; on
    /// `false` the job has already fired (or is firing) and the caller has to
    /// wait for its effects instead.
    pub fn cancel_execution(&self, id: DelayedId) -> bool {
        self.shared.timer.cancel(id)
    }

    /// Runs up to one queued job from each queue the main thread admits, in
    /// ascending queue order, without blocking.
    pub fn update_from_main(&self) {
        self.shared.update_from_main();
    }

    /// Number of worker threads in the pool.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.shared.workers.len()
    }

    /// Number of threads (workers plus possibly the main thread) that may
    /// drain `queue`.
    #[must_use]
    pub fn num_workers_for_queue(&self, queue: QueueMark) -> usize {
        let main = usize::from(self.shared.main_mask.admits(queue));
        self.shared.queues[queue.index()].admitted_workers.len() + main
    }

    pub(crate) fn shared(&self) -> &Arc<ExecShared> {
        &self.shared
    }
}

impl ExecutionSystem {
    /// Stops the pool: signals every worker and the timer thread, then joins
    /// them. Each worker drains the queues it admits one final time before
    /// exiting. Idempotent; also runs on drop.
    pub(crate) fn shutdown(&mut self) {
        if self.worker_handles.is_empty() && self.timer_handle.is_none() {
            return;
        }

        tracing::debug!("ExecutionSystem: stopping");
        self.shared.stopping.store(true, Ordering::Release);

        for worker in &self.shared.workers {
            worker.notifier.notify();
        }
        self.shared.timer.notifier.notify();

        for handle in self.worker_handles.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.timer_handle.take() {
            let _ = handle.join();
        }
        // Jobs still queued at this point (queues nobody admits, work planned
        // mid-shutdown) are dropped unexecuted with the queues.
    }
}

impl Drop for ExecutionSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl core::fmt::Debug for ExecutionSystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExecutionSystem")
            .field("queues", &self.shared.queues.len())
            .field("workers", &self.shared.workers.len())
            .finish_non_exhaustive()
    }
}

// === impl ExecShared ===

impl ExecShared {
    pub(crate) fn plan_execution(&self, job: Job, queue: QueueMark) {
        tracing::trace!(?queue, "plan_execution");
        let task_queue = &self.queues[queue.index()];
        task_queue.jobs.push(job);

        // Prefer waking an idle worker; when everyone is busy, poke the first
        // admitted one so its next sleep attempt is skipped.
        for &w in &task_queue.admitted_workers {
            if self.workers[w].notifier.is_sleeping() {
                self.workers[w].notifier.notify();
                return;
            }
        }
        if let Some(&w) = task_queue.admitted_workers.first() {
            self.workers[w].notifier.notify();
        }
        // Queues admitted only by the main thread are polled, not notified.
    }

    pub(crate) fn is_current_thread_fits(&self, queue: QueueMark) -> bool {
        self.current_thread_mask().admits(queue)
    }

    pub(crate) fn update_from_main(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.main_thread,
            "update_from_main called off the main thread"
        );

        for &qi in &self.main_drain_order {
            if let Some(job) = self.queues[qi as usize].jobs.try_pop() {
                job();
            }
        }
    }

    fn current_thread_mask(&self) -> QueueMask {
        let current = thread::current().id();
        if current == self.main_thread {
            return self.main_mask;
        }

        self.workers
            .iter()
            .find(|w| w.thread_id.get() == Some(&current))
            .map_or(QueueMask::EMPTY, |w| w.mask)
    }
}

fn worker_loop(shared: &ExecShared, index: usize) {
    let me = &shared.workers[index];
    me.thread_id
        .set(thread::current().id())
        .expect("worker thread id set twice");

    let _span = tracing::debug_span!("worker loop", worker = %me.name).entered();

    loop {
        let mut ran_any = false;

        for &qi in &me.drain_order {
            while let Some(job) = shared.queues[qi as usize].jobs.try_pop() {
                job();
                ran_any = true;
            }
        }

        if ran_any {
            continue;
        }

        if shared.stopping.load(Ordering::Acquire) {
            tracing::debug!(worker = %me.name, "stop signal received, shutting down");
            break;
        }

        me.notifier.sleep();
    }
}

fn timer_loop(shared: &ExecShared) {
    let _span = tracing::debug_span!("timer loop").entered();

    loop {
        if shared.stopping.load(Ordering::Acquire) {
            tracing::debug!("timer thread shutting down");
            break;
        }

        let (due, next_deadline) = shared.timer.pop_due(Instant::now());
        let fired = due.len();

        for (job, queue) in due {
            shared.plan_execution(job, queue);
        }

        // Firing may have unblocked more work; only sleep once nothing was
        // due.
        if fired > 0 {
            continue;
        }

        match next_deadline {
            Some(deadline) => shared.timer.notifier.sleep_until(deadline),
            None => shared.timer.notifier.sleep(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::queue::QueueMask;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn plan_execution_runs_on_an_admitted_worker() {
        loom::model(|| {
            let exec = ExecutionSystem::new(ExecSystemConfig::with_workers(2));
            let main_id = thread::current().id();

            let (tx, rx) = mpsc::channel();
            exec.plan_execution(
                move || {
                    tx.send(thread::current().id()).unwrap();
                },
                WORKER,
            );

            let ran_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_ne!(ran_on, main_id);
        });
    }

    #[test]
    fn current_thread_mask_is_respected() {
        let exec = ExecutionSystem::new(ExecSystemConfig::default());

        assert!(exec.is_current_thread_fits(MAIN));
        assert!(exec.is_current_thread_fits(ANY));
        assert!(!exec.is_current_thread_fits(WORKER));

        let (tx, rx) = mpsc::channel();
        let fits = {
            let shared = Arc::clone(exec.shared());
            move || {
                tx.send((
                    shared.is_current_thread_fits(WORKER),
                    shared.is_current_thread_fits(MAIN),
                ))
                .unwrap();
            }
        };
        exec.plan_execution(fits, WORKER);

        let (worker_fits_worker, worker_fits_main) =
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(worker_fits_worker);
        assert!(!worker_fits_main);

        // An unrelated thread admits nothing.
        let shared = Arc::clone(exec.shared());
        thread::spawn(move || {
            assert!(!shared.is_current_thread_fits(ANY));
            assert!(!shared.is_current_thread_fits(MAIN));
            assert!(!shared.is_current_thread_fits(WORKER));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn update_from_main_drains_one_item_per_queue() {
        let exec = ExecutionSystem::new(ExecSystemConfig {
            worker_configs: Vec::new(),
            main_thread_mask: MAIN | ANY,
            max_queue: ANY,
        });

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = counter.clone();
            exec.plan_execution(
                move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                },
                MAIN,
            );
        }

        exec.update_from_main();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        exec.update_from_main();
        exec.update_from_main();
        exec.update_from_main();
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn execute_or_plan_runs_inline_when_admitted() {
        let exec = ExecutionSystem::new(ExecSystemConfig::default());

        let ran_inline = Arc::new(AtomicBool::new(false));
        {
            let ran_inline = ran_inline.clone();
            let main_id = thread::current().id();
            exec.execute_or_plan_execution(
                move || {
                    assert_eq!(thread::current().id(), main_id);
                    ran_inline.store(true, Ordering::Relaxed);
                },
                MAIN,
            );
        }
        assert!(ran_inline.load(Ordering::Relaxed));
    }

    #[test]
    fn timer_fires_after_the_deadline() {
        let exec = ExecutionSystem::new(ExecSystemConfig::with_workers(1));

        let fired = Arc::new(AtomicBool::new(false));
        let begin = Instant::now();
        {
            let fired = fired.clone();
            exec.plan_execution_after(
                move || {
                    fired.store(true, Ordering::Release);
                },
                WORKER,
                begin + Duration::from_millis(30),
            );
        }

        wait_until(|| fired.load(Ordering::Acquire));
        assert!(begin.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn timer_with_past_deadline_fires_promptly() {
        let exec = ExecutionSystem::new(ExecSystemConfig::with_workers(1));

        let fired = Arc::new(AtomicBool::new(false));
        {
            let fired = fired.clone();
            exec.plan_execution_after(
                move || {
                    fired.store(true, Ordering::Release);
                },
                WORKER,
                Instant::now() - Duration::from_millis(5),
            );
        }

        wait_until(|| fired.load(Ordering::Acquire));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let exec = ExecutionSystem::new(ExecSystemConfig::with_workers(1));

        let fired = Arc::new(AtomicBool::new(false));
        let id = {
            let fired = fired.clone();
            exec.plan_execution_after(
                move || {
                    fired.store(true, Ordering::Release);
                },
                WORKER,
                Instant::now() + Duration::from_millis(100),
            )
        };

        assert!(exec.cancel_execution(id));
        thread::sleep(Duration::from_millis(200));
        assert!(!fired.load(Ordering::Acquire));
    }

    #[test]
    fn timer_cancel_race_has_no_double_fire() {
        let exec = Arc::new(ExecutionSystem::new(ExecSystemConfig::with_workers(1)));

        for _ in 0..20 {
            let fires = Arc::new(AtomicUsize::new(0));
            let id = {
                let fires = fires.clone();
                exec.plan_execution_after(
                    move || {
                        fires.fetch_add(1, Ordering::AcqRel);
                    },
                    WORKER,
                    Instant::now() + Duration::from_millis(2),
                )
            };

            thread::sleep(Duration::from_millis(2));
            let cancelled = exec.cancel_execution(id);
            thread::sleep(Duration::from_millis(100));

            let count = fires.load(Ordering::Acquire);
            if cancelled {
                assert_eq!(count, 0, "cancel won but the job still fired");
            } else {
                assert_eq!(count, 1, "cancel lost but the job did not fire once");
            }
        }
    }

    #[test]
    fn unadmitted_queue_is_never_drained() {
        let exec = ExecutionSystem::new(ExecSystemConfig {
            worker_configs: vec![WorkerConfig::new("w", QueueMask::from(WORKER))],
            main_thread_mask: MAIN.mask(),
            max_queue: ANY,
        });

        let ran = Arc::new(AtomicBool::new(false));
        {
            let ran = ran.clone();
            exec.plan_execution(
                move || {
                    ran.store(true, Ordering::Release);
                },
                ANY,
            );
        }

        exec.update_from_main();
        thread::sleep(Duration::from_millis(50));
        assert!(!ran.load(Ordering::Acquire), "nobody admits queue `any`");
    }

    #[test]
    fn worker_count_queries() {
        let exec = ExecutionSystem::new(ExecSystemConfig::with_workers(3));
        assert_eq!(exec.num_workers(), 3);
        assert_eq!(exec.num_workers_for_queue(WORKER), 3);
        // Workers plus the main thread.
        assert_eq!(exec.num_workers_for_queue(ANY), 4);
        assert_eq!(exec.num_workers_for_queue(MAIN), 1);
    }
}
