//! Fiber-aware condition variable

use crate::fiber::Fiber;
use crate::lock::Lock;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Blocks fibers or plain threads until a predicate change is signalled.
///
/// A waiter on a scheduler-bound thread suspends its fiber, letting the
/// worker run other tasks; a waiter on any other thread blocks on an OS
/// condition variable. Notifies wake every registered fiber — the predicate
/// decides who proceeds, and spurious wakeups are part of the contract.
pub struct ConditionVariable {
    /// Suspended fiber waiters. Guarded by its own mutex, acquired strictly
    /// after the caller's lock.
    waiting: Mutex<Vec<Arc<Fiber>>>,
    condition: Condvar,
    num_waiting: AtomicUsize,
    num_waiting_on_condition: AtomicUsize,
}

impl ConditionVariable {
    pub fn new() -> Self {
        Self {
            waiting: Mutex::new(Vec::new()),
            condition: Condvar::new(),
            num_waiting: AtomicUsize::new(0),
            num_waiting_on_condition: AtomicUsize::new(0),
        }
    }

    /// Wake one waiter whose predicate may now hold.
    pub fn notify_one(&self) {
        if self.num_waiting.load(Ordering::Acquire) == 0 {
            return;
        }
        for fiber in self.waiting.lock().iter() {
            fiber.notify();
        }
        if self.num_waiting_on_condition.load(Ordering::Acquire) > 0 {
            self.condition.notify_one();
        }
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        if self.num_waiting.load(Ordering::Acquire) == 0 {
            return;
        }
        for fiber in self.waiting.lock().iter() {
            fiber.notify();
        }
        if self.num_waiting_on_condition.load(Ordering::Acquire) > 0 {
            self.condition.notify_all();
        }
    }

    /// Block until `pred` holds. `lock` guards the data `pred` reads and is
    /// released for the duration of each suspension.
    pub fn wait<T>(&self, lock: &mut Lock<'_, T>, mut pred: impl FnMut(&mut T) -> bool) {
        if pred(lock.data_mut()) {
            return;
        }
        self.num_waiting.fetch_add(1, Ordering::AcqRel);
        if let Some(fiber) = Fiber::current() {
            self.waiting.lock().push(fiber.clone());
            fiber.wait(lock, pred);
            self.deregister(&fiber);
        } else {
            self.num_waiting_on_condition.fetch_add(1, Ordering::AcqRel);
            while !pred(lock.data_mut()) {
                self.condition.wait(lock.guard_mut());
            }
            self.num_waiting_on_condition.fetch_sub(1, Ordering::AcqRel);
        }
        self.num_waiting.fetch_sub(1, Ordering::AcqRel);
    }

    /// Like [`wait`](Self::wait) with a deadline. Returns false if the
    /// deadline passed with `pred` still false.
    pub fn wait_until<T>(
        &self,
        lock: &mut Lock<'_, T>,
        deadline: Instant,
        mut pred: impl FnMut(&mut T) -> bool,
    ) -> bool {
        if pred(lock.data_mut()) {
            return true;
        }
        self.num_waiting.fetch_add(1, Ordering::AcqRel);
        let satisfied = if let Some(fiber) = Fiber::current() {
            self.waiting.lock().push(fiber.clone());
            let satisfied = fiber.wait_until(lock, deadline, pred);
            self.deregister(&fiber);
            satisfied
        } else {
            self.num_waiting_on_condition.fetch_add(1, Ordering::AcqRel);
            let satisfied = loop {
                if pred(lock.data_mut()) {
                    break true;
                }
                if self
                    .condition
                    .wait_until(lock.guard_mut(), deadline)
                    .timed_out()
                {
                    break pred(lock.data_mut());
                }
            };
            self.num_waiting_on_condition.fetch_sub(1, Ordering::AcqRel);
            satisfied
        };
        self.num_waiting.fetch_sub(1, Ordering::AcqRel);
        satisfied
    }

    /// Like [`wait_until`](Self::wait_until) with a relative timeout.
    pub fn wait_for<T>(
        &self,
        lock: &mut Lock<'_, T>,
        timeout: Duration,
        pred: impl FnMut(&mut T) -> bool,
    ) -> bool {
        self.wait_until(lock, Instant::now() + timeout, pred)
    }

    fn deregister(&self, fiber: &Arc<Fiber>) {
        let mut waiting = self.waiting.lock();
        if let Some(pos) = waiting.iter().position(|f| Arc::ptr_eq(f, fiber)) {
            waiting.swap_remove(pos);
        }
    }
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_thread_wait_and_notify() {
        let mutex = Arc::new(Mutex::new(false));
        let cv = Arc::new(ConditionVariable::new());

        let handle = {
            let (mutex, cv) = (mutex.clone(), cv.clone());
            thread::spawn(move || {
                let mut lock = Lock::new(&mutex);
                cv.wait(&mut lock, |ready| *ready);
                assert!(*lock);
            })
        };

        thread::sleep(Duration::from_millis(20));
        *mutex.lock() = true;
        cv.notify_one();
        handle.join().expect("waiter panicked");
    }

    #[test]
    fn test_thread_wait_timeout() {
        let mutex = Mutex::new(());
        let cv = ConditionVariable::new();
        let mut lock = Lock::new(&mutex);
        let start = Instant::now();
        let satisfied = cv.wait_for(&mut lock, Duration::from_millis(30), |_| false);
        assert!(!satisfied);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_notify_all_releases_every_thread() {
        let mutex = Arc::new(Mutex::new(false));
        let cv = Arc::new(ConditionVariable::new());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let (mutex, cv) = (mutex.clone(), cv.clone());
                thread::spawn(move || {
                    let mut lock = Lock::new(&mutex);
                    cv.wait(&mut lock, |ready| *ready);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        *mutex.lock() = true;
        cv.notify_all();
        for waiter in waiters {
            waiter.join().expect("waiter panicked");
        }
    }
}
