//! Awaitable events.
//!
//! An [`Event`] bridges callback-driven completion into async code: any
//! thread may [`set`](Event::set) it, and the task that owns it awaits
//! [`wait`](Event::wait). It stays set until [`reset`](Event::reset), so a
//! `set` that lands before the wait starts is not lost.

use crate::context::{CallbackRef, Context};
use crate::error::TransportError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Manually reset, cross-thread wakeup for one waiting task.
#[derive(Debug, Default)]
pub struct Event {
    signaled: AtomicBool,
    notify: Notify,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the event. Idempotent until the next reset.
    pub fn set(&self) {
        if !self.signaled.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    /// Rearms the event for another wait cycle.
    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Waits until the event is set. Returns at once if it already is.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Runs one begin/end transport operation, awaiting its completion.
///
/// The transport callback may fire on any thread, or inline before `begin`
/// returns; either way it only records the context and sets an event.
pub async fn complete_two_phase<T>(
    begin: impl FnOnce(CallbackRef) -> Result<Context, TransportError>,
    end: impl FnOnce(&Context) -> Result<T, TransportError>,
) -> Result<T, TransportError> {
    let event = Arc::new(Event::new());
    let completed = Arc::new(Mutex::new(None::<Context>));

    let signal = event.clone();
    let slot = completed.clone();
    let callback: CallbackRef = Arc::new(move |context: &Context| {
        *slot.lock() = Some(context.clone());
        signal.set();
    });

    let pending = begin(callback)?;
    event.wait().await;
    let context = completed.lock().take().unwrap_or(pending);
    end(&context)
}
