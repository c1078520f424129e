//! A held lock that the wait machinery can slip across fiber suspension
//!
//! `wait(lock, pred)` must release the caller's lock only *after* the
//! suspending fiber has recorded its new state under the worker mutex, and
//! re-acquire it before the predicate runs again. A plain guard cannot be
//! released and re-taken in place, so this wrapper keeps the mutex reference
//! alongside an optional guard.

use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};

/// A held [`parking_lot::Mutex`] that fiber waits can release and re-acquire.
///
/// Constructed locked. While a wait is in progress the lock is released
/// across the suspension; at every point user code can observe (predicate
/// calls and the return from a wait) it is held again.
pub struct Lock<'a, T> {
    mutex: &'a Mutex<T>,
    guard: Option<MutexGuard<'a, T>>,
}

impl<'a, T> Lock<'a, T> {
    /// Acquire `mutex` and wrap the held guard.
    pub fn new(mutex: &'a Mutex<T>) -> Self {
        Self {
            mutex,
            guard: Some(mutex.lock()),
        }
    }

    pub(crate) fn unlock(&mut self) {
        debug_assert!(self.guard.is_some(), "lock is not held");
        self.guard = None;
    }

    pub(crate) fn relock(&mut self) {
        debug_assert!(self.guard.is_none(), "lock is already held");
        self.guard = Some(self.mutex.lock());
    }

    pub(crate) fn data_mut(&mut self) -> &mut T {
        self.guard.as_deref_mut().expect("lock is not held")
    }

    pub(crate) fn guard_mut(&mut self) -> &mut MutexGuard<'a, T> {
        self.guard.as_mut().expect("lock is not held")
    }
}

impl<T> Deref for Lock<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_deref().expect("lock is not held")
    }
}

impl<T> DerefMut for Lock<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_holds_and_derefs() {
        let mutex = Mutex::new(7);
        let mut lock = Lock::new(&mutex);
        assert_eq!(*lock, 7);
        *lock += 1;
        assert_eq!(*lock, 8);
        assert!(mutex.try_lock().is_none());
    }

    #[test]
    fn test_unlock_releases_the_mutex() {
        let mutex = Mutex::new(0);
        let mut lock = Lock::new(&mutex);
        lock.unlock();
        assert!(mutex.try_lock().is_some());
        lock.relock();
        assert!(mutex.try_lock().is_none());
    }
}
