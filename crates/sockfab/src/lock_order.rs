// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lock hierarchy.
//!
//! Every shared lock in the engine carries a level. A thread may only
//! acquire a lock whose level is strictly greater than every level it
//! already holds:
//!
//! ```text
//! Wait (poll waiter) -> List (endpoint registry) -> Group (address vector)
//!      -> Progress (endpoints, pool, poll set) -> Queue (CQ / EQ)
//! ```
//!
//! Debug builds track the held levels per thread and panic on an
//! out-of-order acquisition. Release builds compile the checks away.

use std::cell::Cell;
use std::fmt;
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum LockLevel {
    Wait = 0,
    List = 1,
    Group = 2,
    Progress = 3,
    Queue = 4,
}

impl LockLevel {
    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

thread_local! {
    static HELD: Cell<u8> = const { Cell::new(0) };
}

fn acquire(level: LockLevel) {
    if cfg!(debug_assertions) {
        HELD.with(|held| {
            let mask = held.get();
            // any held level >= the requested one is an inversion
            let conflicting = mask & !(level.bit() - 1);
            assert!(
                conflicting == 0,
                "lock order violation: acquiring {level:?} while holding mask {mask:#07b}"
            );
            held.set(mask | level.bit());
        });
    }
}

fn release(level: LockLevel) {
    if cfg!(debug_assertions) {
        HELD.with(|held| held.set(held.get() & !level.bit()));
    }
}

/// Mutex tagged with its position in the lock hierarchy.
pub(crate) struct OrderedMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub(crate) fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    pub(crate) fn lock(&self) -> OrderedGuard<'_, T> {
        acquire(self.level);
        OrderedGuard {
            guard: self.inner.lock(),
            level: self.level,
        }
    }

    /// Non-blocking acquire; `None` if another thread holds the lock.
    pub(crate) fn try_lock(&self) -> Option<OrderedGuard<'_, T>> {
        acquire(self.level);
        match self.inner.try_lock() {
            Some(guard) => Some(OrderedGuard {
                guard,
                level: self.level,
            }),
            None => {
                release(self.level);
                None
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for OrderedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedMutex")
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

pub(crate) struct OrderedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    level: LockLevel,
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        release(self.level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_acquisition() {
        let list = OrderedMutex::new(LockLevel::List, 1u32);
        let progress = OrderedMutex::new(LockLevel::Progress, 2u32);
        let queue = OrderedMutex::new(LockLevel::Queue, 3u32);

        let a = list.lock();
        let b = progress.lock();
        let c = queue.lock();
        assert_eq!(*a + *b + *c, 6);
        drop(c);
        drop(b);
        drop(a);

        // levels are released, so the sequence can be repeated
        let _b = progress.lock();
        let _c = queue.lock();
    }

    #[test]
    fn test_try_lock_contended() {
        let m = OrderedMutex::new(LockLevel::Progress, ());
        let guard = m.lock();
        let other = std::thread::scope(|s| s.spawn(|| m.try_lock().is_none()).join().unwrap());
        assert!(other);
        drop(guard);
        assert!(m.try_lock().is_some());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn test_inversion_panics() {
        let progress = OrderedMutex::new(LockLevel::Progress, ());
        let list = OrderedMutex::new(LockLevel::List, ());
        let _p = progress.lock();
        let _l = list.lock();
    }
}
