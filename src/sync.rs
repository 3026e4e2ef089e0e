//! Mutual exclusion shared between the control handler, the worker and application code.
//!
//! [`Lock`] is a non-recursive lock. Acquiring it a second time from the context that already
//! holds it is reported as [`Error::LockReentered`] rather than deadlocking.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::worker::current_context_id;
use crate::{Error, Result};

/// No context holds the lock.
const UNOWNED: u64 = 0;

/// A mutual exclusion lock protecting a value of type `T`.
pub struct Lock<T> {
    owner: AtomicU64,
    value: Mutex<T>,
}

impl<T> Lock<T> {
    /// Create a new unlocked lock.
    pub const fn new(value: T) -> Self {
        Lock {
            owner: AtomicU64::new(UNOWNED),
            value: parking_lot::const_mutex(value),
        }
    }

    /// Acquire the lock, blocking until it is available.
    pub fn acquire(&self) -> Result<LockGuard<'_, T>> {
        let context = self.check_reentry()?;
        let guard = self.value.lock();
        Ok(self.claim(context, guard))
    }

    /// Acquire the lock only if it is free right now.
    pub fn try_acquire(&self) -> Result<Option<LockGuard<'_, T>>> {
        let context = self.check_reentry()?;
        Ok(self
            .value
            .try_lock()
            .map(|guard| self.claim(context, guard)))
    }

    /// Whether any context currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.value.is_locked()
    }

    /// Destroy the lock and return the protected value.
    ///
    /// Taking `self` by value guarantees nobody holds or can later acquire the lock.
    pub fn destroy(self) -> T {
        self.value.into_inner()
    }

    fn check_reentry(&self) -> Result<u64> {
        let context = current_context_id();
        if self.owner.load(Ordering::Acquire) == context {
            return Err(Error::LockReentered(context));
        }
        Ok(context)
    }

    fn claim<'a>(&'a self, context: u64, guard: MutexGuard<'a, T>) -> LockGuard<'a, T> {
        self.owner.store(context, Ordering::Release);
        LockGuard {
            owner: &self.owner,
            guard,
        }
    }
}

impl<T: Default> Default for Lock<T> {
    fn default() -> Self {
        Lock::new(T::default())
    }
}

impl<T> fmt::Debug for Lock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Proof of holding a [`Lock`]. The lock is released when the guard is dropped.
pub struct LockGuard<'a, T> {
    owner: &'a AtomicU64,
    guard: MutexGuard<'a, T>,
}

impl<T> LockGuard<'_, T> {
    /// Release the lock explicitly.
    pub fn release(self) {}
}

impl<T> Deref for LockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for LockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for LockGuard<'_, T> {
    fn drop(&mut self) {
        // Clear ownership before the inner guard unlocks.
        self.owner.store(UNOWNED, Ordering::Release);
    }
}
