// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Atomic (pointer, tag) pairs packed into a single word.
//!
//! Two encodings with the same API:
//!
//! - [`AlignedTaggedPtr`] keeps the tag in the pointer's alignment low bits.
//! - [`PackedTaggedPtr`] keeps the tag in the top 16 bits of the address,
//!   which are unused on the virtual-address layouts we target.
//!
//! In both cases the tag carries a small amount of state (a claim bit) plus a
//! generation counter in the remaining bits, which lets one-shot slots defeat
//! ABA on install/clear cycles.

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use core::fmt;
use core::marker::PhantomData;
use core::ptr;
use static_assertions::const_assert;

/// A snapshot of a tagged pointer: the pointer and its tag, unpacked.
pub(crate) struct Tagged<T> {
    pub(crate) ptr: *mut T,
    pub(crate) tag: usize,
}

/// Tagged pointer storing the tag in the alignment low bits of the pointer.
///
/// The number of usable tag bits is `log2(align_of::<T>())`; slots that need
/// more than a claim bit and a couple of generation bits should prefer
/// [`PackedTaggedPtr`].
pub(crate) struct AlignedTaggedPtr<T> {
    raw: AtomicUsize,
    _pointee: PhantomData<*mut T>,
}

/// Tagged pointer storing the tag in the top 16 bits of a 64-bit address.
pub(crate) struct PackedTaggedPtr<T> {
    raw: AtomicUsize,
    _pointee: PhantomData<*mut T>,
}

// The high-bit encoding assumes 64-bit virtual addresses with an unused top
// half-word.
const_assert!(usize::BITS == 64);

// === impl Tagged ===

impl<T> Tagged<T> {
    pub(crate) const fn null() -> Self {
        Self {
            ptr: ptr::null_mut(),
            tag: 0,
        }
    }

    pub(crate) const fn new(ptr: *mut T, tag: usize) -> Self {
        Self { ptr, tag }
    }
}

impl<T> Copy for Tagged<T> {}
impl<T> Clone for Tagged<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for Tagged<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr && self.tag == other.tag
    }
}
impl<T> Eq for Tagged<T> {}

impl<T> fmt::Debug for Tagged<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tagged")
            .field("ptr", &self.ptr)
            .field("tag", &self.tag)
            .finish()
    }
}

// === impl AlignedTaggedPtr ===

impl<T> AlignedTaggedPtr<T> {
    /// Number of low bits available for the tag.
    pub(crate) const TAG_BITS: u32 = align_of::<T>().trailing_zeros();

    /// Largest tag value this encoding can hold.
    pub(crate) const MAX_TAG: usize = align_of::<T>() - 1;

    const PTR_MASK: usize = !Self::MAX_TAG;

    pub(crate) fn null() -> Self {
        const { assert!(align_of::<T>() >= 2, "pointee alignment leaves no tag bits") };

        Self {
            raw: AtomicUsize::new(0),
            _pointee: PhantomData,
        }
    }

    pub(crate) fn load(&self, order: Ordering) -> Tagged<T> {
        Self::unpack(self.raw.load(order))
    }

    pub(crate) fn store(&self, value: Tagged<T>, order: Ordering) {
        self.raw.store(Self::pack(value), order);
    }

    pub(crate) fn compare_exchange(
        &self,
        current: Tagged<T>,
        new: Tagged<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Tagged<T>, Tagged<T>> {
        self.raw
            .compare_exchange(Self::pack(current), Self::pack(new), success, failure)
            .map(Self::unpack)
            .map_err(Self::unpack)
    }

    fn pack(value: Tagged<T>) -> usize {
        let addr = value.ptr.expose_provenance();
        debug_assert_eq!(addr & Self::MAX_TAG, 0, "pointer is underaligned");
        debug_assert!(value.tag <= Self::MAX_TAG, "tag out of range");
        addr | (value.tag & Self::MAX_TAG)
    }

    fn unpack(raw: usize) -> Tagged<T> {
        Tagged {
            ptr: ptr::with_exposed_provenance_mut(raw & Self::PTR_MASK),
            tag: raw & Self::MAX_TAG,
        }
    }
}

impl<T> fmt::Debug for AlignedTaggedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AlignedTaggedPtr")
            .field(&self.load(Ordering::Relaxed))
            .finish()
    }
}

// === impl PackedTaggedPtr ===

impl<T> PackedTaggedPtr<T> {
    /// Number of high bits available for the tag.
    pub(crate) const TAG_BITS: u32 = 16;

    /// Largest tag value this encoding can hold.
    pub(crate) const MAX_TAG: usize = (1 << Self::TAG_BITS) - 1;

    const TAG_SHIFT: u32 = usize::BITS - Self::TAG_BITS;
    const PTR_MASK: usize = (1 << Self::TAG_SHIFT) - 1;

    pub(crate) fn null() -> Self {
        Self {
            raw: AtomicUsize::new(0),
            _pointee: PhantomData,
        }
    }

    pub(crate) fn load(&self, order: Ordering) -> Tagged<T> {
        Self::unpack(self.raw.load(order))
    }

    pub(crate) fn store(&self, value: Tagged<T>, order: Ordering) {
        self.raw.store(Self::pack(value), order);
    }

    pub(crate) fn compare_exchange(
        &self,
        current: Tagged<T>,
        new: Tagged<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Tagged<T>, Tagged<T>> {
        self.raw
            .compare_exchange(Self::pack(current), Self::pack(new), success, failure)
            .map(Self::unpack)
            .map_err(Self::unpack)
    }

    fn pack(value: Tagged<T>) -> usize {
        let addr = value.ptr.expose_provenance();
        debug_assert_eq!(addr & !Self::PTR_MASK, 0, "address uses the tag bits");
        debug_assert!(value.tag <= Self::MAX_TAG, "tag out of range");
        addr | ((value.tag & Self::MAX_TAG) << Self::TAG_SHIFT)
    }

    fn unpack(raw: usize) -> Tagged<T> {
        Tagged {
            ptr: ptr::with_exposed_provenance_mut(raw & Self::PTR_MASK),
            tag: raw >> Self::TAG_SHIFT,
        }
    }
}

impl<T> fmt::Debug for PackedTaggedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PackedTaggedPtr")
            .field(&self.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(8))]
    struct Node(u64);

    #[test]
    fn aligned_roundtrip() {
        let boxed = Box::into_raw(Box::new(Node(42)));
        let slot = AlignedTaggedPtr::<Node>::null();

        assert_eq!(slot.load(Ordering::Relaxed), Tagged::null());

        slot.store(Tagged::new(boxed, 5), Ordering::Relaxed);
        let got = slot.load(Ordering::Relaxed);
        assert_eq!(got.ptr, boxed);
        assert_eq!(got.tag, 5);

        // Safety: `boxed` came out of `Box::into_raw` above and the packing
        // round-trip preserves the address.
        unsafe { drop(Box::from_raw(got.ptr)) };
    }

    #[test]
    fn aligned_tag_capacity_follows_alignment() {
        assert_eq!(AlignedTaggedPtr::<Node>::TAG_BITS, 3);
        assert_eq!(AlignedTaggedPtr::<Node>::MAX_TAG, 7);
    }

    #[test]
    fn packed_roundtrip() {
        let boxed = Box::into_raw(Box::new(Node(7)));
        let slot = PackedTaggedPtr::<Node>::null();

        slot.store(Tagged::new(boxed, 0xbeef), Ordering::Relaxed);
        let got = slot.load(Ordering::Relaxed);
        assert_eq!(got.ptr, boxed);
        assert_eq!(got.tag, 0xbeef);

        // Safety: same as `aligned_roundtrip`.
        unsafe { drop(Box::from_raw(got.ptr)) };
    }

    #[test]
    fn compare_exchange_detects_generation_change() {
        let slot = PackedTaggedPtr::<Node>::null();

        // Simulate an install/clear cycle bumping the generation.
        slot.store(Tagged::new(ptr::null_mut(), 1), Ordering::Relaxed);

        // A CAS against the stale generation must fail even though the pointer
        // matches.
        let stale = Tagged::null();
        let err = slot
            .compare_exchange(
                stale,
                Tagged::new(ptr::null_mut(), 2),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap_err();
        assert_eq!(err.tag, 1);

        // Retrying with the observed value succeeds.
        slot.compare_exchange(
            err,
            Tagged::new(ptr::null_mut(), 2),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .unwrap();
        assert_eq!(slot.load(Ordering::Relaxed).tag, 2);
    }
}
