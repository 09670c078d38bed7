//! Lock-aware timeouts
//!
//! A [`Timeout`] runs a callback after a delay, optionally repeating, with
//! the per-call lock held. The callback returns a [`Deferred`] which is run
//! once the lock has been released again.
//!
//! Each timeout is one spawned tokio task. The task only holds a [`Weak`]
//! reference to the lock, so a call that has been dropped simply lets its
//! pending timers lapse.
//!
//! Cancellation sets a flag that the task re-checks *after* it has acquired
//! the lock. A timer that is cancelled from inside another locked section
//! therefore never fires, even if its sleep had already elapsed and it was
//! waiting on the lock at the time.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::common::Deferred;

/// Handle to a scheduled callback
#[derive(Debug)]
pub struct Timeout {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Timeout {
    /// Schedule `f` to run with `lock` held after `after`.
    ///
    /// `repeat` is the number of firings; `None` repeats until cancelled.
    /// Returns `None` when the timer is disabled: a zero duration or a
    /// repeat count of zero.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<T, F>(
        lock: Weak<Mutex<T>>,
        after: Duration,
        repeat: Option<u32>,
        mut f: F,
    ) -> Option<Self>
    where
        T: Send + 'static,
        F: FnMut(&mut T) -> Deferred + Send + 'static,
    {
        if after.is_zero() || repeat == Some(0) {
            return None;
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        let task = tokio::spawn(async move {
            let mut remaining = repeat;
            loop {
                tokio::time::sleep(after).await;

                let Some(lock) = lock.upgrade() else {
                    trace!("timer target dropped before firing");
                    return;
                };
                let deferred = {
                    let mut guard = lock.lock();
                    if flag.load(Ordering::Acquire) {
                        return;
                    }
                    f(&mut *guard)
                };
                drop(lock);
                deferred.run();

                if let Some(n) = remaining.as_mut() {
                    *n -= 1;
                    if *n == 0 {
                        flag.store(true, Ordering::Release);
                        return;
                    }
                }
            }
        });

        Some(Self { cancelled, task })
    }

    /// Stop the timer. Safe to call any number of times, before or after
    /// the timer has fired.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.task.abort();
    }
}
