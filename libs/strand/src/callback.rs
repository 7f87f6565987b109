// Copyright 2026 Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::Arc;
use crate::sync::ResumeLatch;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};

/// Bridges callback-style APIs into a suspension point.
///
/// `register` is invoked once, with a one-shot [`ResumeHandle`]; the task
/// suspends until the handle is called, from any thread, and possibly
/// synchronously inside `register` itself.
///
/// ```ignore
/// let answer = await_callback(|resume| {
///     thread::spawn(move || resume.resume(42));
/// })
/// .await;
/// ```
pub fn await_callback<F>(register: F) -> AwaitCallback<F, ()>
where
    F: FnOnce(ResumeHandle<()>),
{
    AwaitCallback {
        register: Some(register),
        state: State::Unregistered,
    }
}

/// Like [`await_callback`], but the value passed to
/// [`ResumeHandle::resume`] becomes the await's result.
pub fn await_callback_with_result<T, F>(register: F) -> AwaitCallback<F, T>
where
    F: FnOnce(ResumeHandle<T>),
    T: Send + 'static,
{
    AwaitCallback {
        register: Some(register),
        state: State::Unregistered,
    }
}

/// One-shot resumer handed to the callback registered with
/// [`await_callback`].
///
/// Dropping the handle without calling [`resume`][Self::resume] leaves the
/// task suspended forever (until it is cancelled).
pub struct ResumeHandle<T> {
    latch: Arc<ResumeLatch<T>>,
}

/// Future returned by [`await_callback`] / [`await_callback_with_result`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct AwaitCallback<F, T> {
    register: Option<F>,
    state: State<T>,
}

enum State<T> {
    Unregistered,
    Registered { latch: Arc<ResumeLatch<T>> },
    Completed,
}

// === impl ResumeHandle ===

impl<T: Send + 'static> ResumeHandle<T> {
    /// Resumes the suspended task with `value`.
    pub fn resume(self, value: T) {
        self.latch.put_value(value);
        self.latch.release(false);
    }
}

impl<T> fmt::Debug for ResumeHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResumeHandle(..)")
    }
}

// === impl AwaitCallback ===

impl<F, T> Future for AwaitCallback<F, T>
where
    F: FnOnce(ResumeHandle<T>),
    T: Send + 'static,
{
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: no field of `AwaitCallback` is structurally pinned.
        let this = unsafe { self.get_unchecked_mut() };

        if let State::Unregistered = this.state {
            // One release from the resume handle, one from this arming
            // thread, so a synchronous `resume` inside `register` does not
            // complete the latch prematurely.
            let latch = Arc::new(ResumeLatch::<T>::new(2));
            match latch.poll_fired(cx) {
                Poll::Pending => {}
                Poll::Ready(()) => unreachable!("latch fired before arming"),
            }

            let register = this.register.take().expect("callback registered twice");
            register(ResumeHandle {
                latch: Arc::clone(&latch),
            });

            latch.release(false);
            this.state = State::Registered { latch };
        }

        match &this.state {
            State::Registered { latch } => match latch.poll_fired(cx) {
                Poll::Ready(()) => {
                    let value = latch.take_value().expect("resumed without a value");
                    this.state = State::Completed;
                    Poll::Ready(value)
                }
                Poll::Pending => Poll::Pending,
            },
            State::Completed => panic!("AwaitCallback polled after completion"),
            State::Unregistered => unreachable!(),
        }
    }
}

impl<F, T> fmt::Debug for AwaitCallback<F, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Unregistered => "unregistered",
            State::Registered { .. } => "registered",
            State::Completed => "completed",
        };
        f.debug_struct("AwaitCallback")
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{PATIENCE, drive_until, scheduler};
    use parking_lot::Mutex;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn resume_later_completes_the_task() {
        let scheduler = scheduler();
        let saved: Arc<Mutex<Option<ResumeHandle<()>>>> = Arc::new(Mutex::new(None));

        let handle = scheduler.spawn({
            let saved = Arc::clone(&saved);
            async move {
                await_callback(move |resume| {
                    *saved.lock() = Some(resume);
                })
                .await;
                3
            }
        });

        // The callback ran (inline start), but nobody resumed yet.
        assert!(!handle.done());
        let resume = saved.lock().take().expect("callback must have run");

        resume.resume(());
        assert!(drive_until(&scheduler, PATIENCE, || handle.done()));
        assert_eq!(handle.get(), 3);
    }

    #[test]
    fn synchronous_resume_completes_inline() {
        let scheduler = scheduler();

        let handle = scheduler.spawn(async {
            await_callback_with_result::<i32, _>(|resume| resume.resume(9)).await
        });

        assert!(handle.done());
        assert_eq!(handle.get(), 9);
    }

    #[test]
    fn resume_from_another_thread() {
        let scheduler = scheduler();

        let handle = scheduler.spawn(async {
            await_callback_with_result::<String, _>(|resume| {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10));
                    resume.resume(String::from("pong"));
                });
            })
            .await
        });

        assert!(drive_until(&scheduler, PATIENCE, || handle.done()));
        assert_eq!(handle.get(), "pong");
    }
}
