// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wake notification for blocking CQ/EQ/counter reads in automatic
//! progress mode.
//!
//! The progress thread calls [`WakeNotifier::notify`] after queueing an
//! entry; readers park in [`WakeNotifier::wait_timeout`]. An atomic flag
//! keeps the notify path lock-free unless a reader is actually asleep.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct WakeNotifier {
    ready: AtomicBool,
    /// Number of sleeping readers
    sleepers: Mutex<usize>,
    condvar: Condvar,
}

impl WakeNotifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn notify(&self) {
        self.ready.store(true, Ordering::Release);
        if *self.sleepers.lock() > 0 {
            self.condvar.notify_all();
        }
    }

    /// Park until notified or `timeout` elapses. Returns `true` if notified.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.ready.swap(false, Ordering::Acquire) {
            return true;
        }

        let mut sleepers = self.sleepers.lock();
        // re-check under the lock so a notify between the swap and the
        // lock is not lost
        if self.ready.swap(false, Ordering::Acquire) {
            return true;
        }
        *sleepers += 1;
        let result = self.condvar.wait_for(&mut sleepers, timeout);
        *sleepers -= 1;

        self.ready.swap(false, Ordering::Acquire) || !result.timed_out()
    }
}
