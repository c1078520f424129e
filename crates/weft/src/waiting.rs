//! Ordered set of fibers waiting with a deadline
//!
//! Keyed by `(deadline, fiber identity)` so equal deadlines coexist, with a
//! parallel fiber→deadline map: `notify()` must erase a waiter by identity
//! without knowing its deadline.

use crate::fiber::Fiber;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Default)]
pub(crate) struct WaitingFibers {
    timeouts: BTreeMap<(Instant, usize), Arc<Fiber>>,
    deadlines: FxHashMap<usize, Instant>,
}

fn key(fiber: &Arc<Fiber>) -> usize {
    Arc::as_ptr(fiber) as usize
}

impl WaitingFibers {
    /// Register `fiber` to expire at `deadline`.
    pub fn add(&mut self, deadline: Instant, fiber: Arc<Fiber>) {
        let key = key(&fiber);
        let prev = self.deadlines.insert(key, deadline);
        debug_assert!(prev.is_none(), "fiber is already in the waiting set");
        self.timeouts.insert((deadline, key), fiber);
    }

    /// Remove `fiber` regardless of its deadline. Returns false if absent.
    pub fn erase(&mut self, fiber: &Arc<Fiber>) -> bool {
        let key = key(fiber);
        match self.deadlines.remove(&key) {
            Some(deadline) => {
                let removed = self.timeouts.remove(&(deadline, key));
                debug_assert!(removed.is_some());
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, fiber: &Arc<Fiber>) -> bool {
        self.deadlines.contains_key(&key(fiber))
    }

    /// Earliest deadline in the set.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timeouts.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Remove and return the fiber with the earliest deadline if it has
    /// expired by `now`.
    pub fn take(&mut self, now: Instant) -> Option<Arc<Fiber>> {
        let &(deadline, key) = self.timeouts.keys().next()?;
        if deadline > now {
            return None;
        }
        self.deadlines.remove(&key);
        self.timeouts.remove(&(deadline, key))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.timeouts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_fiber() -> Arc<Fiber> {
        Fiber::detached_for_tests()
    }

    #[test]
    fn test_take_respects_deadline_order() {
        let mut waiting = WaitingFibers::default();
        let now = Instant::now();
        let (a, b, c) = (test_fiber(), test_fiber(), test_fiber());

        waiting.add(now + Duration::from_millis(30), c.clone());
        waiting.add(now + Duration::from_millis(10), a.clone());
        waiting.add(now + Duration::from_millis(20), b.clone());

        assert_eq!(waiting.next_deadline(), Some(now + Duration::from_millis(10)));

        let late = now + Duration::from_millis(25);
        assert!(Arc::ptr_eq(&waiting.take(late).unwrap(), &a));
        assert!(Arc::ptr_eq(&waiting.take(late).unwrap(), &b));
        assert!(waiting.take(late).is_none());
        assert_eq!(waiting.len(), 1);
        assert!(waiting.contains(&c));
    }

    #[test]
    fn test_equal_deadlines_coexist() {
        let mut waiting = WaitingFibers::default();
        let deadline = Instant::now();
        let (a, b) = (test_fiber(), test_fiber());

        waiting.add(deadline, a.clone());
        waiting.add(deadline, b.clone());
        assert_eq!(waiting.len(), 2);

        assert!(waiting.take(deadline).is_some());
        assert!(waiting.take(deadline).is_some());
        assert!(waiting.is_empty());
    }

    #[test]
    fn test_erase_by_identity() {
        let mut waiting = WaitingFibers::default();
        let now = Instant::now();
        let (a, b) = (test_fiber(), test_fiber());

        waiting.add(now + Duration::from_millis(5), a.clone());
        waiting.add(now + Duration::from_millis(6), b.clone());

        assert!(waiting.erase(&a));
        assert!(!waiting.erase(&a));
        assert!(!waiting.contains(&a));

        // Only b remains and becomes the next deadline.
        assert_eq!(waiting.next_deadline(), Some(now + Duration::from_millis(6)));
        assert!(Arc::ptr_eq(
            &waiting.take(now + Duration::from_millis(10)).unwrap(),
            &b
        ));
    }
}
