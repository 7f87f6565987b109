// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::any::{Any, TypeId};
use core::fmt;

/// A typed side-table private to the executing thread.
///
/// Work items that need scratch state scoped to the thread they happen to run
/// on (caches, buffers, per-thread statistics) fetch it here instead of
/// carrying it through every closure. Each executor thread owns an independent
/// table; entries are created on first access with `T::default()` and live
/// until the thread exits.
///
/// ```
/// use strand::ExecutorData;
///
/// #[derive(Default)]
/// struct ScratchBuf(Vec<u8>);
///
/// ExecutorData::with(|data| {
///     let buf = data.get_or_default::<ScratchBuf>();
///     buf.0.push(1);
/// });
/// ```
pub struct ExecutorData {
    // Keyed by `TypeId`; tables stay small (a handful of entries), so a linear
    // scan beats a hash map here.
    slots: Vec<(TypeId, Box<dyn Any>)>,
}

std::thread_local! {
    static EXECUTOR_DATA: core::cell::RefCell<ExecutorData> =
        core::cell::RefCell::new(ExecutorData { slots: Vec::new() });
}

// === impl ExecutorData ===

impl ExecutorData {
    /// Grants access to the calling thread's table.
    ///
    /// # Panics
    ///
    /// Panics on re-entrant use (calling `with` from inside `f`).
    pub fn with<R>(f: impl FnOnce(&mut ExecutorData) -> R) -> R {
        EXECUTOR_DATA.with(|data| f(&mut data.borrow_mut()))
    }

    /// Returns the thread's `T` entry, default-constructing it on first use.
    pub fn get_or_default<T: Default + 'static>(&mut self) -> &mut T {
        let key = TypeId::of::<T>();

        let index = match self.slots.iter().position(|(k, _)| *k == key) {
            Some(index) => index,
            None => {
                self.slots.push((key, Box::new(T::default())));
                self.slots.len() - 1
            }
        };

        self.slots[index]
            .1
            .downcast_mut::<T>()
            .expect("slot holds the type it was keyed with")
    }
}

impl fmt::Debug for ExecutorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorData")
            .field("entries", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;

    #[derive(Default)]
    struct Counter(u32);

    #[derive(Default)]
    struct Tag(String);

    #[test]
    fn entries_persist_per_type() {
        ExecutorData::with(|data| {
            data.get_or_default::<Counter>().0 += 1;
            data.get_or_default::<Counter>().0 += 1;
            data.get_or_default::<Tag>().0.push('x');
        });

        ExecutorData::with(|data| {
            assert_eq!(data.get_or_default::<Counter>().0, 2);
            assert_eq!(data.get_or_default::<Tag>().0, "x");
        });
    }

    #[test]
    fn tables_are_thread_local() {
        ExecutorData::with(|data| {
            data.get_or_default::<Counter>().0 = 42;
        });

        loom::thread::spawn(|| {
            ExecutorData::with(|data| {
                // A fresh thread starts from the default.
                assert_eq!(data.get_or_default::<Counter>().0, 0);
            });
        })
        .join()
        .unwrap();
    }
}
