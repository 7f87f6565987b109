// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::Ordering;
use crate::sync::hook::{self, HookHeader};
use crate::sync::tagged::{PackedTaggedPtr, Tagged};
use core::fmt;
use core::ptr;

/// The one-shot "on cancel" slot of a task.
///
/// An awaitable that wants to learn about cancellation while the task is
/// suspended [`install`]s a hook; [`cancel`] claims the cancelled tag bit,
/// removes whatever hook is installed and runs it. Installing after the
/// cancelled bit is set fails, which lets the installer short-circuit its own
/// cancellation path instead.
///
/// The slot is a single tagged word: bit 0 of the tag is the cancelled claim,
/// the remaining tag bits count install/clear generations to defeat ABA
/// between a slow [`take`] and a concurrent re-install.
///
/// [`install`]: Self::install
/// [`cancel`]: Self::cancel
/// [`take`]: Self::take
pub(crate) struct CancelCell {
    slot: PackedTaggedPtr<HookHeader>,
}

const CANCELLED: usize = 1;
const GEN_ONE: usize = 2;
const TAG_MASK: usize = PackedTaggedPtr::<HookHeader>::MAX_TAG;

// === impl CancelCell ===

impl CancelCell {
    pub(crate) fn new() -> Self {
        Self {
            slot: PackedTaggedPtr::null(),
        }
    }

    /// Installs `f` as the one-shot cancel hook.
    ///
    /// Returns `false` (dropping `f` unexecuted) when the cell was already
    /// cancelled; the caller must then run its cancellation path itself.
    ///
    /// At most one hook may be installed at a time; installing over an
    /// existing hook is a caller bug.
    pub(crate) fn install<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let node = hook::allocate(move |_| f());

        let mut current = self.slot.load(Ordering::Acquire);
        loop {
            if current.tag & CANCELLED != 0 {
                // Safety: the node was allocated above and never shared.
                unsafe { hook::destroy(node) };
                return false;
            }

            debug_assert!(
                current.ptr.is_null(),
                "a cancel hook is already installed"
            );

            match self.slot.compare_exchange(
                current,
                Tagged::new(node.as_ptr(), current.tag),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Removes the installed hook, if any, without running it.
    ///
    /// Used when the guarded operation completes normally and its hook is now
    /// stale. Returns `true` when a hook was removed.
    pub(crate) fn take(&self) -> bool {
        let mut current = self.slot.load(Ordering::Acquire);
        loop {
            if current.ptr.is_null() {
                return false;
            }

            match self.slot.compare_exchange(
                current,
                Tagged::new(ptr::null_mut(), bump_generation(current.tag)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => {
                    // Safety: the CAS transferred ownership of the node to us.
                    unsafe { hook::destroy(ptr_of(prev)) };
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Claims the cancelled bit and runs the installed hook, if any.
    ///
    /// Returns `false` when the cell was already cancelled (the hook, if one
    /// existed, has already been run by the first caller).
    pub(crate) fn cancel(&self) -> bool {
        let mut current = self.slot.load(Ordering::Acquire);
        loop {
            if current.tag & CANCELLED != 0 {
                return false;
            }

            match self.slot.compare_exchange(
                current,
                Tagged::new(ptr::null_mut(), bump_generation(current.tag) | CANCELLED),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => {
                    if !prev.ptr.is_null() {
                        tracing::trace!("CancelCell: running cancel hook");
                        // Safety: the CAS transferred ownership of the node.
                        unsafe { hook::invoke(ptr_of(prev), ptr::null_mut()) };
                    }
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.slot.load(Ordering::Acquire).tag & CANCELLED != 0
    }
}

impl Drop for CancelCell {
    fn drop(&mut self) {
        let current = self.slot.load(Ordering::Relaxed);
        if !current.ptr.is_null() {
            // Safety: with `&mut self` nobody else can claim the node.
            unsafe { hook::destroy(ptr_of(current)) };
        }
    }
}

impl fmt::Debug for CancelCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self.slot.load(Ordering::Relaxed);
        f.debug_struct("CancelCell")
            .field("cancelled", &(current.tag & CANCELLED != 0))
            .field("armed", &!current.ptr.is_null())
            .finish()
    }
}

fn bump_generation(tag: usize) -> usize {
    (tag.wrapping_add(GEN_ONE) & TAG_MASK & !CANCELLED) | (tag & CANCELLED)
}

fn ptr_of(tagged: Tagged<HookHeader>) -> core::ptr::NonNull<HookHeader> {
    debug_assert!(!tagged.ptr.is_null());
    // Safety: checked by the caller via the CAS result.
    unsafe { core::ptr::NonNull::new_unchecked(tagged.ptr) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cancel_runs_installed_hook_once() {
        let cell = CancelCell::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let witness = calls.clone();
        assert!(cell.install(move || {
            witness.fetch_add(1, Ordering::Relaxed);
        }));

        assert!(cell.cancel());
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        // The second cancel lost the race and must not run anything.
        assert!(!cell.cancel());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn install_after_cancel_short_circuits() {
        let cell = CancelCell::new();
        assert!(cell.cancel());
        assert!(cell.is_cancelled());

        assert!(!cell.install(|| unreachable!("hook must not be stored")));
    }

    #[test]
    fn take_discards_without_running() {
        let cell = CancelCell::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let witness = calls.clone();
        assert!(cell.install(move || {
            witness.fetch_add(1, Ordering::Relaxed);
        }));

        assert!(cell.take());
        assert!(!cell.take());

        // Cancelling afterwards finds an empty slot.
        assert!(cell.cancel());
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert_eq!(Arc::strong_count(&calls), 1);
    }

    #[test]
    fn install_take_cycles_bump_the_generation() {
        let cell = CancelCell::new();

        for _ in 0..3 {
            assert!(cell.install(|| {}));
            assert!(cell.take());
        }

        let tag = cell.slot.load(Ordering::Relaxed).tag;
        assert_eq!(tag, 3 * GEN_ONE);
    }
}
