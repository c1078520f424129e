//! WaitGroup — wait for a counted set of jobs to finish

use crate::lock::Lock;
use crate::sync::ConditionVariable;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct Data {
    count: AtomicU32,
    mutex: Mutex<()>,
    cv: ConditionVariable,
}

/// Counter that can be added to, decremented, and waited on until zero.
///
/// Clones share the counter, so a task can move a clone and call
/// [`done`](Self::done) when it finishes while the spawner waits.
#[derive(Clone)]
pub struct WaitGroup {
    data: Arc<Data>,
}

impl WaitGroup {
    pub fn new(initial: u32) -> Self {
        Self {
            data: Arc::new(Data {
                count: AtomicU32::new(initial),
                mutex: Mutex::new(()),
                cv: ConditionVariable::new(),
            }),
        }
    }

    /// Increment the counter by `count`.
    pub fn add(&self, count: u32) {
        self.data.count.fetch_add(count, Ordering::AcqRel);
    }

    /// Decrement the counter by one; true when it reached zero.
    ///
    /// Panics if called more times than the counter was raised.
    pub fn done(&self) -> bool {
        let previous = self.data.count.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "WaitGroup::done() called with a zero count");
        if previous == 1 {
            let _held = self.data.mutex.lock();
            self.data.cv.notify_all();
            return true;
        }
        false
    }

    /// Block until the counter reaches zero.
    pub fn wait(&self) {
        let mut lock = Lock::new(&self.data.mutex);
        let count = &self.data.count;
        self.data
            .cv
            .wait(&mut lock, |_| count.load(Ordering::Acquire) == 0);
    }

    /// Current counter value; racy by nature, useful for diagnostics.
    pub fn count(&self) -> u32 {
        self.data.count.load(Ordering::Acquire)
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_zero_count_does_not_block() {
        WaitGroup::new(0).wait();
    }

    #[test]
    fn test_done_reports_zero_crossing() {
        let wg = WaitGroup::new(2);
        assert!(!wg.done());
        assert!(wg.done());
    }

    #[test]
    #[should_panic(expected = "zero count")]
    fn test_done_underflow_panics() {
        WaitGroup::new(0).done();
    }

    #[test]
    fn test_wait_across_threads() {
        let wg = WaitGroup::new(3);
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let wg = wg.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10));
                    wg.done();
                })
            })
            .collect();
        wg.wait();
        assert_eq!(wg.count(), 0);
        for worker in workers {
            worker.join().expect("worker panicked");
        }
    }
}
