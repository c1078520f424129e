//! Task — the unit of work handed to the scheduler

/// A move-only, one-shot unit of work.
///
/// Ownership transfers to the scheduler on enqueue and to the executing
/// fiber's frame once popped; running the task consumes it, so it can never
/// be observed after it has returned.
pub struct Task(Box<dyn FnOnce() + Send>);

impl Task {
    /// Wrap a closure as a schedulable task.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(f))
    }

    pub(crate) fn run(self) {
        (self.0)()
    }
}

impl<F> From<F> for Task
where
    F: FnOnce() + Send + 'static,
{
    fn from(f: F) -> Self {
        Self::new(f)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Task")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_task_runs_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = Task::new(move || {
            h.fetch_add(1, Ordering::Relaxed);
        });
        task.run();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_captured_state_dropped_after_run() {
        struct Probe(Arc<AtomicUsize>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let probe = Probe(drops.clone());
        let task = Task::new(move || {
            let _keep = &probe;
        });
        assert_eq!(drops.load(Ordering::Relaxed), 0);
        task.run();
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }
}
