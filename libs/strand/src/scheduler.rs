// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::exec::ExecutionSystem;
use crate::loom::sync::Arc;
use crate::queue::{ANY, QueueMark};
use crate::task::{Id, PollResult, TaskHandle, TaskLauncher, TaskRef};
use core::fmt;
use parking_lot::Mutex;
use std::collections::HashMap;

/// The facade that starts tasks and routes their steps onto the execution
/// system.
///
/// A `Scheduler` is a cheap clonable reference; the last clone to drop shuts
/// the execution system down (workers drain their queues cooperatively and
/// join, queued-but-unstarted steps are dropped).
///
/// ```
/// use strand::{ExecSystemConfig, ExecutionSystem, Scheduler, TaskLauncher};
///
/// let scheduler = Scheduler::new(ExecutionSystem::new(ExecSystemConfig::default()));
///
/// let handle = scheduler.start_task(TaskLauncher::new(async { 6 * 7 }));
/// while !handle.done() {
///     scheduler.update_from_main();
/// }
/// assert_eq!(handle.get(), 42);
/// ```
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<SchedulerCore>,
}

pub(crate) struct SchedulerCore {
    exec: ExecutionSystem,
    /// Every live task, so shutdown can cull the ones still suspended.
    tasks: Mutex<HashMap<u64, TaskRef>>,
    /// Parent/child edges recorded when one task awaits another (keyed by the
    /// parent's id). A cancel request against the parent is forwarded along
    /// them; the edges are acyclic because a task can only await a child
    /// while that child is not (transitively) awaiting it.
    children: Mutex<HashMap<u64, Vec<TaskRef>>>,
}

// === impl Scheduler ===

impl Scheduler {
    /// Takes ownership of an execution system.
    #[must_use]
    pub fn new(exec: ExecutionSystem) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                exec,
                tasks: Mutex::new(HashMap::new()),
                children: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The scheduler of the task currently executing on this thread.
    ///
    /// # Panics
    ///
    /// Panics when called from outside a task.
    #[must_use]
    pub fn current() -> Self {
        Self::try_current().expect("not running inside a strand task")
    }

    /// Like [`current`][Self::current], but `None` outside of tasks.
    #[must_use]
    pub fn try_current() -> Option<Self> {
        context::current().map(|(_, scheduler)| scheduler)
    }

    /// Starts the launcher's task on its target queue.
    ///
    /// When the calling thread is allowed to run that queue, the task's first
    /// step executes inline (up to its first suspension) before this returns.
    pub fn start_task<F>(&self, launcher: TaskLauncher<F>) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (future, queue) = launcher.into_parts();
        let (task, handle) = TaskRef::allocate(future, queue, Arc::downgrade(&self.core));

        tracing::trace!(task.id = task.id().as_u64(), ?queue, "Scheduler::start_task");

        self.core.register_task(&task);

        let enqueue = task.start_wake();
        debug_assert!(enqueue, "a fresh task must accept its first wake");
        plan_step(&self.core, task, true);

        handle
    }

    /// Starts `future` as a task on the default queue.
    pub fn spawn<F>(&self, future: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.start_task(TaskLauncher::on(future, ANY))
    }

    /// Starts `future` as a task on `queue`.
    pub fn spawn_on<F>(&self, future: F, queue: QueueMark) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.start_task(TaskLauncher::on(future, queue))
    }

    /// Routes the task's next resumption (and everything after it) onto
    /// `queue`.
    ///
    /// Takes effect at the task's next scheduling point; a step already
    /// queued elsewhere still runs where it was planned. Tasks switch their
    /// own queue with [`switch_to_queue`][crate::task::switch_to_queue].
    pub fn change_queue<T: Send + 'static>(&self, handle: &TaskHandle<T>, queue: QueueMark) {
        handle.raw().set_queue(queue);
    }

    /// Records the task currently running on this thread as the parent of
    /// `child`'s task.
    ///
    /// A cancel request against the parent is forwarded along the recorded
    /// edge immediately, so a child does not outlive the task that awaits
    /// it. Awaiting a handle (directly or through a combinator) records the
    /// edge automatically; call this yourself when a task stashes a child
    /// handle somewhere else but should still own its cancellation.
    ///
    /// Outside of a task this is a no-op.
    pub fn on_child_task_added<T: Send + 'static>(&self, child: &TaskHandle<T>) {
        if let Some((parent, _scheduler)) = context::current() {
            self.core.on_child_task_added(&parent, child.raw().clone());
        }
    }

    /// Runs up to one queued step from each queue the main thread admits.
    ///
    /// The host thread's way of participating in the cooperative pool; call
    /// it from the application's main loop.
    pub fn update_from_main(&self) {
        self.core.exec.update_from_main();
    }

    /// The underlying execution system.
    #[must_use]
    pub fn execution(&self) -> &ExecutionSystem {
        &self.core.exec
    }

    pub(crate) fn core(&self) -> &Arc<SchedulerCore> {
        &self.core
    }

    pub(crate) fn from_core(core: Arc<SchedulerCore>) -> Self {
        Self { core }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("exec", &self.core.exec)
            .finish()
    }
}

// === impl SchedulerCore ===

impl SchedulerCore {
    pub(crate) fn exec(&self) -> &ExecutionSystem {
        &self.exec
    }

    fn register_task(&self, task: &TaskRef) {
        self.tasks.lock().insert(task.id().as_u64(), task.clone());
    }

    /// Called from completion processing; a task that finished takes care of
    /// itself, and its outgoing parent/child edges are obsolete.
    pub(crate) fn forget_task(&self, id: Id) {
        self.tasks.lock().remove(&id.as_u64());
        self.children.lock().remove(&id.as_u64());
    }

    pub(crate) fn on_child_task_added(&self, parent: &TaskRef, child: TaskRef) {
        tracing::trace!(
            parent.id = parent.id().as_u64(),
            child.id = child.id().as_u64(),
            "parent/child task edge recorded"
        );

        self.children
            .lock()
            .entry(parent.id().as_u64())
            .or_default()
            .push(child);
    }

    /// Forwards a parent's cancel request to its recorded children.
    pub(crate) fn cancel_children_of(&self, parent: Id) {
        // Take the edges out before cancelling: the children recurse into
        // their own edges through this same map.
        let children = { self.children.lock().remove(&parent.as_u64()) };
        let Some(children) = children else { return };

        for child in children {
            child.request_cancel();
        }
    }
}

impl Drop for SchedulerCore {
    fn drop(&mut self) {
        // Stop and join the workers first, so no task is mid-poll while the
        // stragglers below are culled on this thread.
        self.exec.shutdown();

        let stragglers: Vec<TaskRef> = self.tasks.lock().drain().map(|(_, task)| task).collect();
        for task in stragglers {
            tracing::trace!(task.id = task.id().as_u64(), "culling task at shutdown");
            task.request_cancel();
            // With the cancel flag set, one poll culls the task: its future
            // is dropped and its continuation fires with the cancel
            // indicator.
            let _ = task.poll();
        }
    }
}

/// Plans a resume step for a woken task on its current queue.
pub(crate) fn plan_resume(core: &Arc<SchedulerCore>, task: TaskRef) {
    plan_step(core, task, false);
}

fn plan_step(core: &Arc<SchedulerCore>, task: TaskRef, allow_inline: bool) {
    let queue = task.current_queue();
    let weak = Arc::downgrade(core);

    let step = move || {
        if let Some(core) = weak.upgrade() {
            poll_task(&core, task);
        }
        // A step that outlives its scheduler just drops the task.
    };

    if allow_inline {
        core.exec.execute_or_plan_execution(step, queue);
    } else {
        core.exec.plan_execution(step, queue);
    }
}

/// Runs one scheduling step of `task` with the task context installed.
fn poll_task(core: &Arc<SchedulerCore>, task: TaskRef) {
    let result = {
        let _enter = context::enter(task.clone(), Scheduler::from_core(Arc::clone(core)));
        task.poll()
    };

    if result == PollResult::PendingSchedule {
        // Woken mid-poll (yields, queue switches): plan the next step on the
        // task's (possibly new) queue.
        plan_resume(core, task);
    }
}

/// Starts a task on the current scheduler, from inside another task.
///
/// Shorthand for `Scheduler::current().start_task(launcher)`; the handle is
/// returned without suspending.
///
/// # Panics
///
/// Panics when called from outside a task.
pub fn start_task<F>(launcher: TaskLauncher<F>) -> TaskHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Scheduler::current().start_task(launcher)
}

/// The scheduler of the task currently executing on this thread.
///
/// # Panics
///
/// Panics when called from outside a task.
#[must_use]
pub fn current_scheduler() -> Scheduler {
    Scheduler::current()
}

/// The thread-local "currently polled task" stack.
///
/// A stack rather than a single slot because a task step may start another
/// task inline (`execute_or_plan_execution`), nesting a second poll inside
/// the first.
pub(crate) mod context {
    use super::Scheduler;
    use crate::task::TaskRef;
    use core::cell::RefCell;

    std::thread_local! {
        static CONTEXT: RefCell<Vec<(TaskRef, Scheduler)>> = const { RefCell::new(Vec::new()) };
    }

    pub(crate) struct Enter(());

    pub(crate) fn enter(task: TaskRef, scheduler: Scheduler) -> Enter {
        CONTEXT.with(|stack| stack.borrow_mut().push((task, scheduler)));
        Enter(())
    }

    impl Drop for Enter {
        fn drop(&mut self) {
            CONTEXT.with(|stack| {
                stack.borrow_mut().pop();
            });
        }
    }

    /// The innermost task being polled on this thread, with its scheduler.
    pub(crate) fn current() -> Option<(TaskRef, Scheduler)> {
        CONTEXT.with(|stack| {
            stack
                .borrow()
                .last()
                .map(|(task, scheduler)| (task.clone(), scheduler.clone()))
        })
    }

    /// The innermost task being polled on this thread.
    ///
    /// # Panics
    ///
    /// Panics outside of a task step.
    pub(crate) fn current_task() -> (TaskRef, Scheduler) {
        current().expect("not running inside a strand task")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{ResumeHandle, await_callback};
    use crate::queue::WORKER;
    use crate::task::yield_now;
    use crate::test_util::{PATIENCE, drive_until, scheduler, scheduler_with_workers};
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Suspends forever; only a cancel request gets rid of the task.
    async fn stuck() {
        await_callback(|resume: ResumeHandle<()>| drop(resume)).await;
    }

    #[test]
    fn start_inline_on_an_admitted_queue() {
        let scheduler = scheduler();

        // The default launch queue is admitted by the main thread, so the
        // task runs to completion inside `spawn`.
        let handle = scheduler.spawn(async { 41 + 1 });
        assert!(handle.done());
        assert_eq!(handle.get(), 42);
    }

    #[test]
    fn worker_queue_task_completes() {
        let scheduler = scheduler();

        let handle = scheduler.spawn_on(
            async {
                yield_now().await;
                String::from("ok")
            },
            WORKER,
        );

        assert!(drive_until(&scheduler, PATIENCE, || handle.done()));
        assert_eq!(handle.get(), "ok");
    }

    #[test]
    fn continuation_fires_once_with_the_value() {
        let scheduler = scheduler();
        let seen = Arc::new(PlMutex::new(Vec::new()));

        let handle = scheduler.spawn_on(async { 7 }, WORKER);
        handle.continue_with({
            let seen = Arc::clone(&seen);
            move |result, cancelled| {
                seen.lock().push((result.take_value(), cancelled));
            }
        });

        assert!(drive_until(&scheduler, PATIENCE, || !seen.lock().is_empty()));
        assert_eq!(&*seen.lock(), &[(Some(7), false)]);
    }

    #[test]
    fn continuation_attached_after_completion_runs_inline() {
        let scheduler = scheduler();
        let handle = scheduler.spawn(async { 3_usize });
        assert!(handle.done());

        let seen = Arc::new(AtomicUsize::new(0));
        handle.continue_with({
            let seen = Arc::clone(&seen);
            move |result, cancelled| {
                assert!(!cancelled);
                seen.store(result.take_value().unwrap_or(0), Ordering::Relaxed);
            }
        });
        assert_eq!(seen.load(Ordering::Relaxed), 3);
    }

    #[test]
    #[should_panic(expected = "already attached")]
    fn second_continuation_is_rejected() {
        let scheduler = scheduler();
        let handle = scheduler.spawn_on(stuck(), WORKER);

        handle.continue_with(|_, _| {});
        handle.continue_with(|_, _| {});
    }

    #[test]
    fn cancel_of_a_suspended_task_reports_through_the_continuation() {
        let scheduler = scheduler();
        let seen = Arc::new(PlMutex::new(Vec::new()));

        let handle = scheduler.spawn_on(stuck(), WORKER);
        handle.continue_with({
            let seen = Arc::clone(&seen);
            move |result, cancelled| {
                seen.lock().push((result.take_value().is_some(), cancelled));
            }
        });

        assert!(handle.request_cancel());
        assert!(!handle.request_cancel());

        assert!(drive_until(&scheduler, PATIENCE, || !seen.lock().is_empty()));
        assert_eq!(&*seen.lock(), &[(false, true)]);
        assert!(!handle.done());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn cancel_after_normal_completion_is_rejected() {
        let scheduler = scheduler();
        let handle = scheduler.spawn(async { 1 });
        assert!(handle.done());
        assert!(!handle.request_cancel());
        assert!(!handle.is_cancelled());
        assert_eq!(handle.get(), 1);
    }

    #[test]
    fn completed_task_releases_its_resources() {
        let scheduler = scheduler();
        let tracker = Arc::new(());

        let handle = scheduler.spawn_on(
            {
                let tracker = Arc::clone(&tracker);
                async move {
                    let _keep = tracker;
                    yield_now().await;
                }
            },
            WORKER,
        );
        handle.detach();

        // The future (and with it the tracker clone) is dropped on
        // completion, even while task bookkeeping may live a little longer.
        assert!(drive_until(&scheduler, PATIENCE, || {
            Arc::strong_count(&tracker) == 1
        }));
    }

    #[test]
    fn shutdown_culls_suspended_tasks() {
        let scheduler = scheduler_with_workers(1);
        let tracker = Arc::new(());
        let seen = Arc::new(PlMutex::new(Vec::new()));

        let handle = scheduler.spawn_on(
            {
                let tracker = Arc::clone(&tracker);
                async move {
                    let _keep = tracker;
                    stuck().await;
                }
            },
            WORKER,
        );
        handle.continue_with({
            let seen = Arc::clone(&seen);
            move |_result, cancelled| seen.lock().push(cancelled)
        });

        // Let the task reach its suspension point.
        std::thread::sleep(Duration::from_millis(50));

        drop(scheduler);

        assert_eq!(&*seen.lock(), &[true]);
        assert_eq!(Arc::strong_count(&tracker), 1);
    }

    #[test]
    fn current_scheduler_is_available_inside_tasks() {
        let scheduler = scheduler();

        let handle = scheduler.spawn(async {
            let inner = Scheduler::current();
            let nested = inner.spawn(async { 5 });
            assert!(nested.done());
            nested.get()
        });

        assert!(drive_until(&scheduler, PATIENCE, || handle.done()));
        assert_eq!(handle.get(), 5);
    }

    #[test]
    fn handle_can_be_awaited_from_another_task() {
        let scheduler = scheduler();

        let producer = scheduler.spawn_on(
            async {
                yield_now().await;
                21
            },
            WORKER,
        );

        let consumer = scheduler.spawn(async move {
            let value = producer.await.expect("producer must not be cancelled");
            value * 2
        });

        assert!(drive_until(&scheduler, PATIENCE, || consumer.done()));
        assert_eq!(consumer.get(), 42);
    }

    #[test]
    fn awaiting_a_cancelled_task_yields_the_cancel_error() {
        let scheduler = scheduler();

        let stuck_task = scheduler.spawn_on(stuck(), WORKER);
        assert!(stuck_task.request_cancel());

        let observer = scheduler.spawn(async move {
            match stuck_task.await {
                Err(err) => err.is_cancelled(),
                Ok(()) => false,
            }
        });

        assert!(drive_until(&scheduler, PATIENCE, || observer.done()));
        assert!(observer.get());
    }

    #[test]
    fn cancelling_a_parent_reaches_awaited_children() {
        let scheduler = scheduler_with_workers(1);
        let tracker = Arc::new(());

        let parent = scheduler.spawn_on(
            {
                let tracker = Arc::clone(&tracker);
                async move {
                    let child = Scheduler::current().spawn_on(
                        async move {
                            let _keep = tracker;
                            stuck().await;
                        },
                        WORKER,
                    );
                    // Awaiting the handle links the child to this task.
                    let _ = child.await;
                }
            },
            WORKER,
        );

        // Let parent and child reach their suspension points.
        std::thread::sleep(Duration::from_millis(50));

        assert!(parent.request_cancel());

        // The cancel request travels down the recorded edge: the child is
        // culled along with its parent instead of sticking around.
        assert!(drive_until(&scheduler, PATIENCE, || {
            parent.is_cancelled() && Arc::strong_count(&tracker) == 1
        }));
        assert!(!parent.done());
    }

    #[test]
    fn explicit_child_links_forward_cancellation() {
        let scheduler = scheduler_with_workers(1);
        let tracker = Arc::new(());

        let parent = scheduler.spawn_on(
            {
                let tracker = Arc::clone(&tracker);
                async move {
                    let inner = Scheduler::current();
                    let child = inner.spawn_on(
                        async move {
                            let _keep = tracker;
                            stuck().await;
                        },
                        WORKER,
                    );
                    // The child is handed off rather than awaited; link it
                    // explicitly so it still follows this task's
                    // cancellation.
                    inner.on_child_task_added(&child);
                    child.detach();

                    stuck().await;
                }
            },
            WORKER,
        );

        std::thread::sleep(Duration::from_millis(50));
        assert!(parent.request_cancel());

        assert!(drive_until(&scheduler, PATIENCE, || {
            parent.is_cancelled() && Arc::strong_count(&tracker) == 1
        }));
    }

    #[test]
    fn task_panic_is_captured_and_resurfaces() {
        let scheduler = scheduler();

        let doomed = scheduler.spawn_on(
            async {
                panic!("boom");
            },
            WORKER,
        );

        let observer = scheduler.spawn(async move {
            match doomed.await {
                Err(err) => err.is_panic(),
                Ok(()) => false,
            }
        });

        assert!(drive_until(&scheduler, PATIENCE, || observer.done()));
        assert!(observer.get());
    }
}
