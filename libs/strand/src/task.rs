// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod cancel_self;
mod handle;
mod id;
mod launcher;
mod state;
mod switch;
mod yield_now;

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::Weak;
use crate::loom::sync::atomic::{AtomicU8, Ordering};
use crate::queue::QueueMark;
use crate::scheduler::SchedulerCore;
use crate::sync::hook::{self, HookHeader};
use crate::sync::tagged::{AlignedTaggedPtr, Tagged};
use crate::sync::{CancelCell, WaitCell};
use core::any::type_name;
use core::fmt;
use core::mem::{self, ManuallyDrop, MaybeUninit};
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::ptr::NonNull;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub use cancel_self::{Cancel, cancel};
pub use handle::TaskHandle;
pub use id::Id;
pub use launcher::TaskLauncher;
pub(crate) use state::PollResult;
use state::{StartPollAction, State, WakeAction};
pub use switch::{SwitchToQueue, switch_to_queue};
pub use yield_now::{YieldNow, yield_now};

/// What a finished task left behind.
///
/// Completion continuations receive this by mutable reference and may take
/// the value in place.
pub enum TaskResult<T> {
    /// No value: the task was cancelled before finishing, or the value was
    /// already taken.
    Empty,
    /// The task ran to completion.
    Done(T),
    /// The task panicked; the payload is what the panic carried.
    Panicked(Box<dyn core::any::Any + Send + 'static>),
}

/// Argument block passed (type-erased) to a completion continuation hook.
pub(crate) struct ContinueArg<T> {
    pub(crate) result: *mut TaskResult<T>,
    pub(crate) cancelled: bool,
}

/// A type-erased, reference-counted pointer to a spawned task.
///
/// Spawned tasks are pinned in memory; schedulers and wakers pass these thin
/// pointers around instead. All operations that need the concrete future type
/// go through the task's vtable, so one copy of the scheduling machinery
/// serves every future type. The task is deallocated when the last `TaskRef`
/// drops.
pub(crate) struct TaskRef(NonNull<Header>);

#[repr(C)]
struct Task<F: Future> {
    /// This must be the first field so a `Task<F>` pointer doubles as a
    /// `Header` pointer.
    header: Header,

    /// The future, and later its result.
    ///
    /// The `POLLING` bit of the state word is the lock for this field; after
    /// `FINAL` it belongs to completion processing, and after `JOINABLE` to
    /// the task handle.
    stage: UnsafeCell<Stage<F>>,
}

struct Header {
    state: State,
    vtable: &'static VTable,
    id: Id,
    /// Index of the queue the task currently runs on.
    queue: AtomicU8,
    /// Route back to the scheduler for wakes; weak so that queued task
    /// references cannot keep a dropped scheduler alive.
    scheduler: Weak<SchedulerCore>,
    /// One-shot "on cancel" slot (see [`CancelCell`]).
    cancel: CancelCell,
    /// One-shot completion continuation slot.
    continuation: ContinuationCell,
    /// Waker of a task awaiting this one through its handle.
    join_waker: WaitCell,
    span: tracing::Span,
}

/// The current lifecycle stage of the future: the future itself, or what it
/// produced.
enum Stage<F: Future> {
    Pending(F),
    Finished(TaskResult<F::Output>),
}

struct VTable {
    /// Runs one scheduling step: state transition, poll, completion
    /// processing.
    poll: unsafe fn(NonNull<Header>) -> PollResult,

    /// Moves the task's result into `out` (a `*mut TaskResult<T>` where `T`
    /// is the task's output type). Requires `JOINABLE`.
    take_output: unsafe fn(NonNull<Header>, out: *mut ()),

    /// Runs a continuation hook against the finished task's result. Requires
    /// `JOINABLE`.
    continue_now: unsafe fn(NonNull<Header>, hook: NonNull<HookHeader>),

    /// Drops the task and frees its memory.
    deallocate: unsafe fn(NonNull<Header>),
}

/// The one-shot completion continuation slot.
///
/// The low tag bit records that the task finished and the slot was claimed;
/// a continuation attached after that point runs inline instead.
struct ContinuationCell {
    slot: AlignedTaggedPtr<HookHeader>,
}

const FINISHED_TAG: usize = 1;

// === impl TaskResult ===

impl<T> TaskResult<T> {
    /// Takes the result, leaving `Empty` behind.
    pub fn take(&mut self) -> TaskResult<T> {
        mem::replace(self, TaskResult::Empty)
    }

    /// Takes just the value, if the task completed with one.
    pub fn take_value(&mut self) -> Option<T> {
        match self.take() {
            TaskResult::Done(value) => Some(value),
            other => {
                *self = other;
                None
            }
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, TaskResult::Done(_))
    }
}

impl<T> fmt::Debug for TaskResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskResult::Empty => f.write_str("TaskResult::Empty"),
            TaskResult::Done(_) => f.write_str("TaskResult::Done(..)"),
            TaskResult::Panicked(_) => f.write_str("TaskResult::Panicked(..)"),
        }
    }
}

// === impl TaskRef ===

impl TaskRef {
    /// Allocates a task for `future`, returning the scheduler-side reference
    /// and the external handle.
    pub(crate) fn allocate<F>(
        future: F,
        queue: QueueMark,
        scheduler: Weak<SchedulerCore>,
    ) -> (TaskRef, TaskHandle<F::Output>)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let id = Id::next();
        let span = tracing::trace_span!(
            "task",
            task.id = id.as_u64(),
            task.output = %type_name::<F::Output>(),
        );

        let task = Box::new(Task {
            header: Header {
                state: State::new(),
                vtable: &Task::<F>::VTABLE,
                id,
                queue: AtomicU8::new(queue.index_u8()),
                scheduler,
                cancel: CancelCell::new(),
                continuation: ContinuationCell::new(),
                join_waker: WaitCell::new(),
                span,
            },
            stage: UnsafeCell::new(Stage::Pending(future)),
        });

        // Safety: `Box::into_raw` never returns null, and `Task` is `repr(C)`
        // with the header first.
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(task)).cast::<Header>() };

        let task = TaskRef(ptr);
        debug_assert_eq!(task.state().ref_count(), 1);
        let handle = TaskHandle::new(task.clone());

        (task, handle)
    }

    pub(crate) fn id(&self) -> Id {
        self.header().id
    }

    pub(crate) fn header(&self) -> &Header {
        // Safety: the pointee lives until the last `TaskRef` drops.
        unsafe { self.0.as_ref() }
    }

    fn state(&self) -> &State {
        &self.header().state
    }

    pub(crate) fn current_queue(&self) -> QueueMark {
        QueueMark::from_index(self.header().queue.load(Ordering::Acquire))
    }

    pub(crate) fn set_queue(&self, queue: QueueMark) {
        self.header().queue.store(queue.index_u8(), Ordering::Release);
    }

    /// `true` once the task ran to completion with a value.
    pub(crate) fn is_complete(&self) -> bool {
        self.state().is_joinable() && self.state().is_complete()
    }

    /// `true` once completion processing finished, whether the task completed
    /// or was cancelled.
    pub(crate) fn is_joinable(&self) -> bool {
        self.state().is_joinable()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state().is_cancelled()
    }

    /// Requests cooperative cancellation.
    ///
    /// Sets the flag, fires the one-shot cancel hook and wakes the task so
    /// the cull happens at its next scheduling point. Returns `false` when
    /// the task already finished or was already cancelled.
    pub(crate) fn request_cancel(&self) -> bool {
        if !self.state().cancel() {
            return false;
        }

        tracing::trace!(task.id = self.id().as_u64(), "task cancel requested");

        // Notify whoever armed the cancel slot (timers, callback bridges),
        // forward the request along recorded parent/child edges, then force a
        // scheduling point so the cancel takes effect.
        self.header().cancel.cancel();
        if let Some(core) = self.header().scheduler.upgrade() {
            core.cancel_children_of(self.id());
        }
        self.wake_by_ref();
        true
    }

    /// Installs a hook in the task's one-shot cancel slot.
    ///
    /// Returns `false` (dropping the hook) when the task is already
    /// cancelled; the caller short-circuits its own cancellation path then.
    pub(crate) fn install_cancel_hook<H>(&self, hook: H) -> bool
    where
        H: FnOnce() + Send + 'static,
    {
        self.header().cancel.install(hook)
    }

    /// Clears the cancel slot after the guarded operation completed.
    pub(crate) fn clear_cancel_hook(&self) {
        self.header().cancel.take();
    }

    pub(crate) fn wake_by_ref(&self) {
        if self.state().wake() == WakeAction::Enqueue {
            schedule(self.clone());
        }
    }

    /// Marks a freshly allocated task as queued for its first step, exactly
    /// like a wake (so wakes racing the start are absorbed). The caller plans
    /// the step itself.
    pub(crate) fn start_wake(&self) -> bool {
        self.state().wake() == WakeAction::Enqueue
    }

    /// Runs one scheduling step of the task.
    pub(crate) fn poll(&self) -> PollResult {
        let poll_fn = self.header().vtable.poll;
        // Safety: called through the task's own vtable.
        unsafe { poll_fn(self.0) }
    }

    /// Moves the task's result out.
    ///
    /// # Safety
    ///
    /// `T` must be the task's output type, and the task must have finished
    /// (its continuation fired, or [`is_joinable`][Self::is_joinable]).
    pub(crate) unsafe fn take_output<T>(&self) -> TaskResult<T> {
        // A continuation may have woken us a moment before completion
        // processing published the result; wait out that window.
        while !self.state().is_joinable() {
            core::hint::spin_loop();
        }

        let take_fn = self.header().vtable.take_output;
        let mut out = MaybeUninit::<TaskResult<T>>::uninit();
        // Safety: `T` is the output type (caller contract), and `out` is a
        // valid slot for it.
        unsafe {
            take_fn(self.0, out.as_mut_ptr().cast());
            out.assume_init()
        }
    }

    /// Attaches the one-shot completion continuation.
    ///
    /// `hook` is invoked with a `*mut ContinueArg<T>` exactly once: when the
    /// task finishes, or inline here if it already has.
    ///
    /// # Safety
    ///
    /// The hook's argument protocol must match the task's output type `T`.
    ///
    /// # Panics
    ///
    /// Panics when a continuation was already attached.
    pub(crate) unsafe fn attach_continuation(&self, hook: NonNull<HookHeader>) {
        match self.header().continuation.install(hook) {
            Ok(()) => {}
            Err(hook) => {
                // The task finished before we could attach. Completion
                // processing may still be publishing the result; wait for the
                // handoff, then run the continuation inline.
                while !self.state().is_joinable() {
                    core::hint::spin_loop();
                }

                let continue_fn = self.header().vtable.continue_now;
                // Safety: JOINABLE was observed and the caller vouches for
                // the hook's argument type.
                unsafe { continue_fn(self.0, hook) };
            }
        }
    }

    /// Registers `cx`'s waker to fire once the task becomes joinable.
    ///
    /// Completes immediately when it already is.
    pub(crate) fn poll_joinable(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.is_joinable() {
            return Poll::Ready(());
        }

        match self.header().join_waker.poll_wait(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => {
                if self.is_joinable() {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl Clone for TaskRef {
    fn clone(&self) -> Self {
        self.state().clone_ref();
        Self(self.0)
    }
}

impl Drop for TaskRef {
    fn drop(&mut self) {
        if !self.state().drop_ref() {
            return;
        }

        let deallocate = self.header().vtable.deallocate;
        // Safety: we held the last reference.
        unsafe { deallocate(self.0) };
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id())
            .field("state", self.state())
            .finish()
    }
}

// Safety: the state word arbitrates all cross-thread access to the task.
unsafe impl Send for TaskRef {}
// Safety: see the `Send` impl above.
unsafe impl Sync for TaskRef {}

/// Routes a woken task back to its scheduler.
fn schedule(task: TaskRef) {
    let core = task.header().scheduler.upgrade();
    match core {
        Some(core) => crate::scheduler::plan_resume(&core, task),
        None => {
            // The scheduler is gone; the wake (and with it the task) is
            // dropped, which is the documented shutdown behavior.
            tracing::trace!(task.id = task.id().as_u64(), "wake after scheduler shutdown");
        }
    }
}

// === impl Task ===

impl<F> Task<F>
where
    F: Future,
{
    const VTABLE: VTable = VTable {
        poll: Self::poll,
        take_output: Self::take_output,
        continue_now: Self::continue_now,
        deallocate: Self::deallocate,
    };

    /// Runs one scheduling step.
    ///
    /// # Safety
    ///
    /// `ptr` must point at the header of a `Task<F>`.
    unsafe fn poll(ptr: NonNull<Header>) -> PollResult {
        // Safety: ensured by caller.
        let this = unsafe { ptr.cast::<Self>().as_ref() };
        let _span = this.header.span.clone().entered();

        match this.header.state.start_poll() {
            StartPollAction::DontPoll => PollResult::Ready,
            StartPollAction::Cancel => {
                tracing::trace!("task culled by cancel request");
                this.cull();
                this.finish(true);
                PollResult::Ready
            }
            StartPollAction::Poll => {
                // Borrow this task reference as a waker without touching the
                // reference count; clones made during the poll do count.
                let waker = {
                    let raw = raw_waker(ptr);
                    // Safety: the waker vtable functions uphold the `RawWaker`
                    // contract.
                    ManuallyDrop::new(unsafe { Waker::from_raw(raw) })
                };

                let completed = this.poll_stage(&waker);
                let result = this.header.state.end_poll(completed);
                if completed {
                    this.finish(false);
                }
                result
            }
        }
    }

    /// Polls the future, storing its output (or panic) in the stage.
    /// Returns `true` when the future finished.
    fn poll_stage(&self, waker: &Waker) -> bool {
        self.stage.with_mut(|stage| {
            // Safety: the POLLING bit grants exclusive stage access.
            let stage = unsafe { &mut *stage };

            let Stage::Pending(future) = &mut *stage else {
                unreachable!("polled a task whose future already finished");
            };

            // Safety: the future is heap-pinned inside the task allocation
            // and only dropped in place.
            let future = unsafe { Pin::new_unchecked(future) };
            let mut cx = Context::from_waker(waker);

            match std::panic::catch_unwind(AssertUnwindSafe(|| future.poll(&mut cx))) {
                Ok(Poll::Pending) => false,
                Ok(Poll::Ready(value)) => {
                    *stage = Stage::Finished(TaskResult::Done(value));
                    true
                }
                Err(payload) => {
                    tracing::warn!("task panicked");
                    *stage = Stage::Finished(TaskResult::Panicked(payload));
                    true
                }
            }
        })
    }

    /// Drops the pending future of a cancel-culled task.
    fn cull(&self) {
        self.stage.with_mut(|stage| {
            // Safety: `start_poll` returned `Cancel`, which (like POLLING)
            // grants exclusive access.
            unsafe {
                *stage = Stage::Finished(TaskResult::Empty);
            }
        });
    }

    /// Completion processing: fire the continuation, publish the result, wake
    /// the join side.
    fn finish(&self, cancelled: bool) {
        // A cancel hook armed by some awaitable is stale now.
        self.header.cancel.take();

        if let Some(hook) = self.header.continuation.claim() {
            self.stage.with_mut(|stage| {
                // Safety: FINAL is set and JOINABLE is not yet: completion
                // processing owns the stage.
                let result = match unsafe { &mut *stage } {
                    Stage::Finished(result) => result,
                    Stage::Pending(_) => unreachable!("finishing a pending task"),
                };

                let mut arg = ContinueArg::<F::Output> { result, cancelled };
                // Safety: the hook was attached through a `TaskHandle<F::Output>`,
                // so its argument protocol matches.
                unsafe { hook::invoke(hook, (&raw mut arg).cast()) };
            });
        }

        self.header.state.set_joinable();
        self.header.join_waker.wake();

        // The task no longer needs shutdown supervision.
        if let Some(core) = self.header.scheduler.upgrade() {
            core.forget_task(self.header.id);
        }
    }

    /// Moves the result into `out`.
    ///
    /// # Safety
    ///
    /// `ptr` must point at the header of a `Task<F>`, `out` at a
    /// `MaybeUninit<TaskResult<F::Output>>`, and the task must be joinable.
    unsafe fn take_output(ptr: NonNull<Header>, out: *mut ()) {
        // Safety: ensured by caller.
        let this = unsafe { ptr.cast::<Self>().as_ref() };
        debug_assert!(this.header.state.is_joinable());

        this.stage.with_mut(|stage| {
            // Safety: after JOINABLE the stage belongs to the (single-owner)
            // handle side, which is the only caller of this function.
            let result = match unsafe { &mut *stage } {
                Stage::Finished(result) => result.take(),
                Stage::Pending(_) => unreachable!("taking output of a pending task"),
            };

            // Safety: `out` points at a valid, properly typed slot.
            unsafe { out.cast::<TaskResult<F::Output>>().write(result) };
        });
    }

    /// Runs a late-attached continuation against the finished result.
    ///
    /// # Safety
    ///
    /// `ptr` must point at the header of a `Task<F>`, the hook's argument
    /// protocol must be `ContinueArg<F::Output>`, and the task must be
    /// joinable.
    unsafe fn continue_now(ptr: NonNull<Header>, hook: NonNull<HookHeader>) {
        // Safety: ensured by caller.
        let this = unsafe { ptr.cast::<Self>().as_ref() };
        debug_assert!(this.header.state.is_joinable());

        let snapshot = this.header.state.load(Ordering::Acquire);
        let cancelled = snapshot.contains(state::Snapshot::CANCELLED)
            && !snapshot.contains(state::Snapshot::COMPLETE);

        this.stage.with_mut(|stage| {
            // Safety: see `take_output`; handle side is single-owner.
            let result = match unsafe { &mut *stage } {
                Stage::Finished(result) => result,
                Stage::Pending(_) => unreachable!("continuing a pending task"),
            };

            let mut arg = ContinueArg::<F::Output> { result, cancelled };
            // Safety: argument protocol vouched for by the caller.
            unsafe { hook::invoke(hook, (&raw mut arg).cast()) };
        });
    }

    /// Drops the task and frees its memory.
    ///
    /// # Safety
    ///
    /// `ptr` must point at the header of a `Task<F>` whose reference count
    /// reached zero.
    unsafe fn deallocate(ptr: NonNull<Header>) {
        // Safety: ensured by caller.
        unsafe {
            debug_assert_eq!(ptr.as_ref().state.ref_count(), 0);
            drop(Box::from_raw(ptr.cast::<Self>().as_ptr()));
        }
    }
}

// === waker plumbing ===

static WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(clone_waker, wake_by_val, waker_wake_by_ref, drop_waker);

// `Waker::will_wake` compares data and vtable pointers; keeping this out of
// line gives every task waker the same vtable address across codegen units,
// which avoids needless re-registration in wait cells.
#[inline(never)]
fn raw_waker(ptr: NonNull<Header>) -> RawWaker {
    RawWaker::new(ptr.as_ptr().cast(), &WAKER_VTABLE)
}

unsafe fn clone_waker(ptr: *const ()) -> RawWaker {
    // Safety: waker data pointers are always task headers.
    let header = unsafe { &*ptr.cast::<Header>() };
    header.state.clone_ref();
    // Safety: non-null by construction.
    raw_waker(unsafe { NonNull::new_unchecked(ptr.cast_mut().cast()) })
}

unsafe fn wake_by_val(ptr: *const ()) {
    // Safety: waker data pointers are always task headers; this waker owns
    // one reference, which `TaskRef`'s `Drop`/transfer below accounts for.
    let task = unsafe { TaskRef(NonNull::new_unchecked(ptr.cast_mut().cast())) };

    if task.state().wake() == WakeAction::Enqueue {
        // The waker's reference rides along into the queue.
        schedule(task);
    } else {
        drop(task);
    }
}

unsafe fn waker_wake_by_ref(ptr: *const ()) {
    // Safety: waker data pointers are always task headers; wake_by_ref does
    // not consume the reference, so keep the borrow alive only briefly.
    let task = ManuallyDrop::new(unsafe { TaskRef(NonNull::new_unchecked(ptr.cast_mut().cast())) });
    task.wake_by_ref();
}

unsafe fn drop_waker(ptr: *const ()) {
    // Safety: waker data pointers are always task headers; dropping the
    // `TaskRef` releases the waker's reference.
    drop(unsafe { TaskRef(NonNull::new_unchecked(ptr.cast_mut().cast())) });
}

// === impl ContinuationCell ===

impl ContinuationCell {
    fn new() -> Self {
        Self {
            slot: AlignedTaggedPtr::null(),
        }
    }

    /// Stores the continuation hook, or hands it back when the task already
    /// finished (the caller then runs it inline).
    ///
    /// # Panics
    ///
    /// Panics when a continuation is already attached.
    fn install(&self, hook: NonNull<HookHeader>) -> Result<(), NonNull<HookHeader>> {
        let mut current = self.slot.load(Ordering::Acquire);
        loop {
            if current.tag & FINISHED_TAG != 0 {
                return Err(hook);
            }

            assert!(
                current.ptr.is_null(),
                "a completion continuation is already attached"
            );

            match self.slot.compare_exchange(
                current,
                Tagged::new(hook.as_ptr(), current.tag),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Claims the slot at completion, returning the attached hook (if any).
    /// Late installs observe the finished tag afterwards.
    fn claim(&self) -> Option<NonNull<HookHeader>> {
        let mut current = self.slot.load(Ordering::Acquire);
        loop {
            debug_assert_eq!(current.tag & FINISHED_TAG, 0, "task finished twice");

            match self.slot.compare_exchange(
                current,
                Tagged::new(core::ptr::null_mut(), FINISHED_TAG),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => return NonNull::new(prev.ptr),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Drop for ContinuationCell {
    fn drop(&mut self) {
        let current = self.slot.load(Ordering::Relaxed);
        if let Some(hook) = NonNull::new(current.ptr) {
            // Safety: with the task gone nobody else can claim the hook.
            unsafe { hook::destroy(hook) };
        }
    }
}
