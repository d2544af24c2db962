//! Background command worker.
//!
//! One named thread per engine. It sleeps on a [`WakeSignal`] that register
//! writes raise when the command buffer has work, polls on a timeout as a
//! safety net, and exits when the engine's stop flag is set.

use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::iommu::Shared;
use crate::platform::Platform;

/// Name of the worker thread.
pub const WORKER_THREAD_NAME: &str = "amd-vi-cmd";

/// A sticky wake-up flag paired with a condition variable.
///
/// A notification that arrives while nobody waits is remembered, so the next
/// wait returns at once.
#[derive(Debug, Default)]
pub struct WakeSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    /// Creates a signal with no pending wake-up.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal and wakes the waiter.
    pub fn notify(&self) {
        *self.pending.lock() = true;
        self.cond.notify_one();
    }

    /// Waits for a notification or until `timeout` elapses.
    ///
    /// Returns `true` if woken by a notification.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            let _ = self.cond.wait_for(&mut pending, timeout);
        }
        std::mem::take(&mut *pending)
    }
}

/// Starts the worker thread for `shared`.
pub(crate) fn spawn<P: Platform>(shared: Arc<Shared<P>>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(WORKER_THREAD_NAME.into())
        .spawn(move || run(&shared))
}

fn run<P: Platform>(shared: &Shared<P>) {
    log::debug!("amd-vi: command worker started");
    let poll = shared.config.worker_poll_interval();
    while !shared.stop.load(Ordering::Acquire) {
        shared.drain_commands();
        shared.wake.wait(poll);
    }
    log::debug!("amd-vi: command worker stopped");
}
