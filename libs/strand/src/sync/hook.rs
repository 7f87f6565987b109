// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One-shot, type-erased callback nodes behind *thin* pointers.
//!
//! A [`HookHeader`] embeds its own (invoke, drop) function-pointer pair, so a
//! bare `NonNull<HookHeader>` is enough to either run or destroy the callback.
//! This is what lets the cancel and continuation slots store a callback inside
//! a single tagged machine word; everywhere a fat pointer is acceptable the
//! crate uses `Box<dyn FnOnce>` instead.
//!
//! A node must be consumed exactly once, by either [`invoke`] or [`destroy`].

use core::mem::ManuallyDrop;
use core::ptr::NonNull;

/// Leading header of every hook allocation.
///
/// The 8-byte alignment guarantees three low tag bits when a header pointer is
/// stored in an [`AlignedTaggedPtr`][super::tagged::AlignedTaggedPtr].
#[repr(C, align(8))]
pub(crate) struct HookHeader {
    /// Runs the callback with `arg` and releases the allocation.
    invoke: unsafe fn(NonNull<HookHeader>, arg: *mut ()),
    /// Releases the allocation without running the callback.
    drop_fn: unsafe fn(NonNull<HookHeader>),
}

#[repr(C)]
struct Hook<F> {
    /// This must be the first field so that a `Hook<F>` pointer and its header
    /// pointer are interchangeable.
    header: HookHeader,
    f: ManuallyDrop<F>,
}

/// Heap-allocates a hook node for `f` and leaks it as a thin header pointer.
///
/// The returned pointer owns the allocation; pass it to [`invoke`] or
/// [`destroy`] exactly once.
pub(crate) fn allocate<F>(f: F) -> NonNull<HookHeader>
where
    F: FnOnce(*mut ()) + Send + 'static,
{
    let hook = Box::new(Hook {
        header: HookHeader {
            invoke: invoke_raw::<F>,
            drop_fn: drop_raw::<F>,
        },
        f: ManuallyDrop::new(f),
    });

    // Safety: `Box::into_raw` never returns null, and `Hook` is `repr(C)` with
    // the header first, so the cast yields a valid header pointer.
    unsafe { NonNull::new_unchecked(Box::into_raw(hook)).cast() }
}

/// Runs the hook with `arg` and releases its allocation.
///
/// # Safety
///
/// `ptr` must have come from [`allocate`] and must not have been consumed yet.
pub(crate) unsafe fn invoke(ptr: NonNull<HookHeader>, arg: *mut ()) {
    // Safety: ensured by caller.
    unsafe {
        let invoke = ptr.as_ref().invoke;
        invoke(ptr, arg);
    }
}

/// Releases the hook's allocation without running it.
///
/// # Safety
///
/// `ptr` must have come from [`allocate`] and must not have been consumed yet.
pub(crate) unsafe fn destroy(ptr: NonNull<HookHeader>) {
    // Safety: ensured by caller.
    unsafe {
        let drop_fn = ptr.as_ref().drop_fn;
        drop_fn(ptr);
    }
}

unsafe fn invoke_raw<F: FnOnce(*mut ())>(ptr: NonNull<HookHeader>, arg: *mut ()) {
    // Safety: the pointer was created by `allocate::<F>`, so the pointee
    // really is a `Hook<F>`, and the one-shot contract gives us ownership.
    let f = unsafe {
        let mut hook = Box::from_raw(ptr.cast::<Hook<F>>().as_ptr());
        ManuallyDrop::take(&mut hook.f)
    };
    f(arg);
}

unsafe fn drop_raw<F>(ptr: NonNull<HookHeader>) {
    // Safety: see `invoke_raw`.
    unsafe {
        let mut hook = Box::from_raw(ptr.cast::<Hook<F>>().as_ptr());
        ManuallyDrop::drop(&mut hook.f);
    }
}
