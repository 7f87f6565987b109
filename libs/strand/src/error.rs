// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::any::Any;
use core::fmt;

/// Why awaiting a [`TaskHandle`][crate::TaskHandle] produced no value.
pub enum JoinError {
    /// The task was cancelled before it produced a value.
    Cancelled,
    /// The task panicked; the payload is what the panic carried.
    Panicked(Box<dyn Any + Send + 'static>),
}

// === impl JoinError ===

impl JoinError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    #[must_use]
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }

    /// Consumes the error, resuming the task's panic on the calling thread.
    ///
    /// # Panics
    ///
    /// Always panics for the `Panicked` variant; panics with a generic message
    /// for `Cancelled`.
    pub fn unwrap_panic(self) -> ! {
        match self {
            Self::Panicked(payload) => std::panic::resume_unwind(payload),
            Self::Cancelled => panic!("task was cancelled"),
        }
    }
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("JoinError::Cancelled"),
            Self::Panicked(_) => f.write_str("JoinError::Panicked(..)"),
        }
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("task was cancelled"),
            Self::Panicked(_) => f.write_str("task panicked"),
        }
    }
}

impl core::error::Error for JoinError {}
