//! A multi-producer, multi-consumer (MPMC) queue backed by block-allocated
//! slab storage.
//!
//! See the documentation for the [`MpmcQueue`] type for details.
//!
//! Values are stored in fixed-size *banks* of slots. Exhausted slots are
//! recycled through a free list, so a queue that reaches a steady state stops
//! allocating entirely. The queue head is additionally published through an
//! atomic pointer which allows [`has_value`][MpmcQueue::has_value] to observe
//! emptiness without taking any lock.

mod loom;

use crate::loom::{cell::UnsafeCell, sync::atomic::AtomicPtr, sync::atomic::Ordering};
use core::fmt;
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};
use parking_lot::Mutex;

/// A growable MPMC FIFO queue of `T`s.
///
/// The queue maintains two independent locks: one guarding the linked value
/// list (taken by [`try_pop`][Self::try_pop] and the linking step of
/// [`push`][Self::push]) and one guarding the free list and bank storage
/// (taken when slots are allocated or recycled). Keeping allocation and
/// consumption on separate locks reduces contention when producers and
/// consumers run on different threads.
///
/// `BLOCK_SIZE` is the number of value slots allocated per bank.
///
/// # Examples
///
/// ```
/// use mpmc_queue::MpmcQueue;
/// use std::sync::Arc;
/// use std::thread;
///
/// let q = Arc::new(MpmcQueue::<i32>::new());
///
/// let producers: Vec<_> = (0..4)
///     .map(|p| {
///         let q = q.clone();
///         thread::spawn(move || {
///             for i in 0..100 {
///                 q.push(p * 100 + i);
///             }
///         })
///     })
///     .collect();
///
/// for h in producers {
///     h.join().unwrap();
/// }
///
/// let mut seen = Vec::new();
/// while let Some(v) = q.try_pop() {
///     seen.push(v);
/// }
/// seen.sort();
/// assert_eq!(seen.len(), 400);
/// ```
pub struct MpmcQueue<T, const BLOCK_SIZE: usize = 64> {
    /// Free slots ready for reuse, plus the backing bank storage.
    free: Mutex<FreeList<T, BLOCK_SIZE>>,

    /// The tail of the value list. `push` appends here.
    tail: Mutex<Tail<T>>,

    /// The head of the value list.
    ///
    /// Only mutated while holding the `tail` lock, but published atomically so
    /// that `has_value` can observe it without locking.
    head: AtomicPtr<Slot<T>>,
}

struct FreeList<T, const BLOCK_SIZE: usize> {
    head: *mut Slot<T>,
    banks: Vec<Box<Bank<T, BLOCK_SIZE>>>,
}

struct Tail<T> {
    last: *mut Slot<T>,
}

/// One value cell. `value` is only initialized while the slot is part of the
/// value list; `next` threads the slot into either the value list or the free
/// list, never both.
struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    next: *mut Slot<T>,
}

struct Bank<T, const BLOCK_SIZE: usize> {
    slots: [Slot<T>; BLOCK_SIZE],
}

// === impl MpmcQueue ===

impl<T> MpmcQueue<T> {
    /// Creates an empty queue with the default block size and one pre-allocated
    /// bank of slots.
    #[must_use]
    pub fn new() -> Self {
        Self::with_block_size()
    }
}

impl<T> Default for MpmcQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const BLOCK_SIZE: usize> MpmcQueue<T, BLOCK_SIZE> {
    /// Creates an empty queue with `BLOCK_SIZE` slots per bank.
    #[must_use]
    pub fn with_block_size() -> Self {
        const { assert!(BLOCK_SIZE > 0, "a bank must hold at least one slot") };

        let mut free = FreeList {
            head: ptr::null_mut(),
            banks: Vec::with_capacity(1),
        };
        Self::grow(&mut free);

        Self {
            free: Mutex::new(free),
            tail: Mutex::new(Tail {
                last: ptr::null_mut(),
            }),
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Appends `value` to the queue, allocating a new bank of slots if the
    /// free list is exhausted.
    pub fn push(&self, value: T) {
        let slot = {
            let mut free = self.free.lock();
            if free.head.is_null() {
                Self::grow(&mut free);
            }
            Self::take_free_slot(&mut free)
        };

        self.link(slot, value);
    }

    /// Appends `value` without allocating.
    ///
    /// # Errors
    ///
    /// Returns the value back when no recycled slot is available.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let slot = {
            let mut free = self.free.lock();
            if free.head.is_null() {
                return Err(value);
            }
            Self::take_free_slot(&mut free)
        };

        self.link(slot, value);
        Ok(())
    }

    /// Removes the value at the head of the queue, if any.
    ///
    /// This method never blocks on producers; it only takes the value-list
    /// lock for the unlink step.
    pub fn try_pop(&self) -> Option<T> {
        let slot = {
            let mut tail = self.tail.lock();

            let head = self.head.load(Ordering::Relaxed);
            if head.is_null() {
                return None;
            }

            // Safety: `head` was read while holding the value-list lock, so the
            // slot is a live member of the value list.
            let next = unsafe { (*head).next };

            let _prev = self
                .head
                .compare_exchange(head, next, Ordering::Relaxed, Ordering::Relaxed);
            debug_assert!(
                _prev.is_ok(),
                "queue head changed while the value-list lock was held"
            );

            if tail.last == head {
                tail.last = next;
            }

            head
        };

        // Safety: the slot was unlinked from the value list above, so this
        // thread has exclusive access to it, and its value was initialized by
        // the `push` that linked it.
        let value = unsafe { (*slot).value.with(|v| (*v).assume_init_read()) };

        let mut free = self.free.lock();
        // Safety: the slot is owned by this thread until it is threaded back
        // onto the free list below.
        unsafe {
            (*slot).next = free.head;
        }
        free.head = slot;

        Some(value)
    }

    /// Returns `true` if the queue currently holds at least one value.
    ///
    /// This is a lock-free snapshot; concurrent pushes and pops may invalidate
    /// the answer immediately.
    #[must_use]
    pub fn has_value(&self) -> bool {
        !self.head.load(Ordering::Relaxed).is_null()
    }

    /// Writes `value` into `slot` and links the slot onto the value list.
    fn link(&self, slot: NonNull<Slot<T>>, value: T) {
        let slot = slot.as_ptr();

        // Safety: the slot was just taken off the free list, so this thread
        // has exclusive access until the slot is published below.
        unsafe {
            (*slot).value.with_mut(|v| {
                (*v).write(value);
            });
            (*slot).next = ptr::null_mut();
        }

        let mut tail = self.tail.lock();

        // Set the head only when the queue is currently empty; otherwise the
        // predecessor keeps the head in place and we just extend the chain.
        let _ = self
            .head
            .compare_exchange(ptr::null_mut(), slot, Ordering::Relaxed, Ordering::Relaxed);

        if !tail.last.is_null() {
            // Safety: `tail.last` is a live member of the value list and the
            // value-list lock is held.
            unsafe {
                (*tail.last).next = slot;
            }
        }
        tail.last = slot;
    }

    fn take_free_slot(free: &mut FreeList<T, BLOCK_SIZE>) -> NonNull<Slot<T>> {
        let slot = free.head;
        debug_assert!(!slot.is_null());
        // Safety: free-list members are always valid slot pointers into one of
        // the banks, and the free-list lock is held.
        free.head = unsafe { (*slot).next };
        // Safety: checked non-null above.
        unsafe { NonNull::new_unchecked(slot) }
    }

    /// Allocates a new bank and threads its slots onto the free list.
    fn grow(free: &mut FreeList<T, BLOCK_SIZE>) {
        tracing::trace!(
            banks = free.banks.len() + 1,
            block_size = BLOCK_SIZE,
            "MpmcQueue::grow"
        );

        let bank = Box::new(Bank {
            slots: core::array::from_fn(|_| Slot {
                value: UnsafeCell::new(MaybeUninit::uninit()),
                next: ptr::null_mut(),
            }),
        });
        free.banks.push(bank);

        let bank = free.banks.last_mut().expect("bank was just pushed");
        let base: *mut Slot<T> = bank.slots.as_mut_ptr();

        for i in 0..BLOCK_SIZE {
            let next = if i + 1 == BLOCK_SIZE {
                free.head
            } else {
                // Safety: `i + 1` is within the bank's slot array.
                unsafe { base.add(i + 1) }
            };
            // Safety: `i` is within the bank's slot array, and the bank is
            // exclusively owned until its slots are published on the free list.
            unsafe {
                (*base.add(i)).next = next;
            }
        }

        free.head = base;
    }
}

impl<T, const BLOCK_SIZE: usize> Drop for MpmcQueue<T, BLOCK_SIZE> {
    fn drop(&mut self) {
        let mut head = self.head.load(Ordering::Relaxed);

        while !head.is_null() {
            // Safety: we have `&mut self`, so no other thread can touch the
            // value list; every member of it holds an initialized value.
            unsafe {
                (*head).value.with_mut(|v| (*v).assume_init_drop());
                head = (*head).next;
            }
        }
        // Bank storage is released by the `FreeList`'s `Vec` drop.
    }
}

// Safety: values are handed between threads through the queue, so `T: Send`
// is required; all shared state is protected by the two mutexes or accessed
// through atomics.
unsafe impl<T: Send, const BLOCK_SIZE: usize> Send for MpmcQueue<T, BLOCK_SIZE> {}
// Safety: see the `Send` impl above.
unsafe impl<T: Send, const BLOCK_SIZE: usize> Sync for MpmcQueue<T, BLOCK_SIZE> {}

impl<T, const BLOCK_SIZE: usize> fmt::Debug for MpmcQueue<T, BLOCK_SIZE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpmcQueue")
            .field("has_value", &self.has_value())
            .field("block_size", &BLOCK_SIZE)
            .finish_non_exhaustive()
    }
}
