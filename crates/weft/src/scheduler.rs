//! Scheduler — worker ownership, thread binding, and task routing

use crate::config::{Config, MAX_WORKER_THREADS};
use crate::task::Task;
use crate::worker::{self, Mode, Worker};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use tracing::{debug, warn};

thread_local! {
    static BOUND: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };
}

/// Number of slots advertising recently-spinning workers to the enqueue
/// balancer.
const SPINNING_SLOTS: usize = 8;

pub(crate) type ThreadInitializer = Arc<dyn Fn() + Send + Sync>;

/// Owns the workers and routes every scheduled task to one of them.
///
/// A scheduler must be *bound* to a thread before `schedule()` can be called
/// there; binding also creates the thread's single-threaded worker so that
/// waits on that thread make progress. Worker threads are bound implicitly.
pub struct Scheduler {
    cfg: Config,
    workers: RwLock<Vec<Arc<Worker>>>,
    single_threaded: Mutex<FxHashMap<ThreadId, Arc<Worker>>>,

    /// Worker ids that recently began spinning, claimed by `enqueue` so new
    /// work lands on a hot thread. -1 marks an empty slot.
    spinning_workers: [AtomicIsize; SPINNING_SLOTS],
    /// Advances forward when a spinner registers, backward when the
    /// balancer claims; both wrap over the slot array.
    spinning_idx: AtomicUsize,
    next_enqueue_idx: AtomicUsize,

    thread_init: Mutex<Option<ThreadInitializer>>,
    /// Latched on the first enqueue; guards the worker-count precondition.
    any_enqueued: AtomicBool,
}

impl Scheduler {
    /// Create a scheduler and spawn `cfg.worker_threads` workers.
    ///
    /// Panics if the configuration fails [`Config::validate`].
    pub fn new(cfg: Config) -> Arc<Self> {
        cfg.validate().expect("invalid scheduler configuration");
        let worker_threads = cfg.worker_threads;
        let scheduler = Arc::new(Self {
            cfg,
            workers: RwLock::new(Vec::new()),
            single_threaded: Mutex::new(FxHashMap::default()),
            spinning_workers: [const { AtomicIsize::new(-1) }; SPINNING_SLOTS],
            spinning_idx: AtomicUsize::new(0),
            next_enqueue_idx: AtomicUsize::new(0),
            thread_init: Mutex::new(None),
            any_enqueued: AtomicBool::new(false),
        });
        if worker_threads > 0 {
            scheduler.set_worker_thread_count(worker_threads);
        }
        scheduler
    }

    /// The scheduler bound to the current thread.
    pub fn get() -> Option<Arc<Scheduler>> {
        BOUND.with(|b| b.borrow().as_ref().and_then(Weak::upgrade))
    }

    pub(crate) fn set_bound(weak: Weak<Scheduler>) {
        BOUND.with(|b| *b.borrow_mut() = Some(weak));
    }

    /// Bind this scheduler to the current thread, creating the thread's
    /// single-threaded worker.
    ///
    /// Panics if any scheduler is already bound here.
    pub fn bind(self: &Arc<Self>) {
        BOUND.with(|b| {
            let mut bound = b.borrow_mut();
            assert!(
                bound.as_ref().and_then(Weak::upgrade).is_none(),
                "a scheduler is already bound to this thread"
            );
            *bound = Some(Arc::downgrade(self));
        });
        let worker = Worker::new(self, Mode::SingleThreaded, 0);
        worker.start();
        let tid = std::thread::current().id();
        let prev = self.single_threaded.lock().insert(tid, worker);
        debug_assert!(prev.is_none());
        debug!(thread = ?tid, "scheduler bound");
    }

    /// Undo [`bind`](Self::bind): drain the thread's single-threaded worker
    /// (running queued tasks and waiting out blocked fibers), destroy it,
    /// and clear the thread-local binding.
    ///
    /// Panics if no scheduler is bound to the current thread.
    pub fn unbind() {
        let scheduler = Self::get().expect("no scheduler bound to this thread");
        let tid = std::thread::current().id();
        let worker = scheduler
            .single_threaded
            .lock()
            .remove(&tid)
            .expect("no single-threaded worker for this thread");
        worker.flush();
        worker.stop();
        worker::set_current(None);
        BOUND.with(|b| *b.borrow_mut() = None);
        debug!(thread = ?tid, "scheduler unbound");
    }

    /// Hand `task` to a worker: a spinning worker if one advertised itself,
    /// otherwise round-robin. With no worker threads the task goes to the
    /// calling thread's single-threaded worker.
    pub fn enqueue(&self, task: Task) {
        self.any_enqueued.store(true, Ordering::Relaxed);
        let workers = self.workers.read();
        if workers.is_empty() {
            drop(workers);
            let tid = std::thread::current().id();
            let single_threaded = self.single_threaded.lock();
            let worker = single_threaded
                .get(&tid)
                .expect("scheduling requires worker threads or a scheduler bound to this thread");
            worker.enqueue(task);
            return;
        }
        let n = workers.len();
        loop {
            let slot =
                self.spinning_idx.fetch_sub(1, Ordering::Relaxed).wrapping_sub(1) % SPINNING_SLOTS;
            let spinning = self.spinning_workers[slot].swap(-1, Ordering::Relaxed);
            let idx = if spinning >= 0 {
                spinning as usize % n
            } else {
                self.next_enqueue_idx.fetch_add(1, Ordering::Relaxed) % n
            };
            // Selecting under the worker's lock keeps the balancer's view of
            // `num` and the queue append atomic; contention just retries.
            if let Some(guard) = workers[idx].try_lock() {
                workers[idx].enqueue_and_unlock(guard, task);
                return;
            }
        }
    }

    /// Called by a worker entering its pre-park spin so the balancer can
    /// route the next task straight to it.
    pub(crate) fn on_begin_spinning(&self, worker_id: usize) {
        let slot = self.spinning_idx.fetch_add(1, Ordering::Relaxed) % SPINNING_SLOTS;
        self.spinning_workers[slot].store(worker_id as isize, Ordering::Relaxed);
    }

    /// Steal one task from the worker selected by `rnd`, on behalf of
    /// `thief`. Tasks move; fibers never do.
    pub(crate) fn steal_work(&self, thief: usize, rnd: u64) -> Option<Task> {
        let workers = self.workers.read();
        if workers.is_empty() {
            return None;
        }
        let victim = &workers[(rnd % workers.len() as u64) as usize];
        if victim.id() == thief {
            return None;
        }
        victim.steal()
    }

    /// Replace the worker pool with `count` multi-threaded workers.
    ///
    /// Must be called before any task is enqueued (asserted); the pool is
    /// not otherwise dynamic. Counts above the maximum are clamped.
    pub fn set_worker_thread_count(self: &Arc<Self>, count: usize) {
        assert!(
            !self.any_enqueued.load(Ordering::Relaxed),
            "worker thread count must be set before any task is scheduled"
        );
        let count = if count > MAX_WORKER_THREADS {
            warn!(
                requested = count,
                max = MAX_WORKER_THREADS,
                "clamping worker thread count"
            );
            MAX_WORKER_THREADS
        } else {
            count
        };
        // Old workers may be inside `steal_work`, which takes the read
        // lock; stop them before taking the write lock for the new pool.
        let old = std::mem::take(&mut *self.workers.write());
        for worker in &old {
            worker.stop();
        }
        drop(old);
        let mut workers = self.workers.write();
        for id in 0..count {
            let worker = Worker::new(self, Mode::MultiThreaded, id);
            worker.start();
            workers.push(worker);
        }
        debug!(count, "worker pool started");
    }

    /// Number of multi-threaded workers.
    pub fn worker_thread_count(&self) -> usize {
        self.workers.read().len()
    }

    /// Run `f` at the start of every subsequently spawned worker thread,
    /// before its run-loop.
    pub fn set_thread_initializer<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.thread_init.lock() = Some(Arc::new(f));
    }

    pub(crate) fn thread_initializer(&self) -> Option<ThreadInitializer> {
        self.thread_init.lock().clone()
    }

    pub(crate) fn cfg(&self) -> &Config {
        &self.cfg
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        {
            let single_threaded = self.single_threaded.lock();
            assert!(
                single_threaded.is_empty(),
                "scheduler dropped while still bound on {} thread(s); unbind first",
                single_threaded.len()
            );
        }
        let workers = std::mem::take(&mut *self.workers.write());
        for worker in &workers {
            worker.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = Scheduler::new(Config::default());
        assert_eq!(scheduler.worker_thread_count(), 0);

        let scheduler = Scheduler::new(Config {
            worker_threads: 2,
            ..Config::default()
        });
        assert_eq!(scheduler.worker_thread_count(), 2);
    }

    #[test]
    fn test_workers_execute_tasks() {
        let scheduler = Scheduler::new(Config {
            worker_threads: 2,
            ..Config::default()
        });
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let hits = hits.clone();
            scheduler.enqueue(Task::new(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }));
        }
        assert!(wait_until(Duration::from_secs(5), || {
            hits.load(Ordering::Relaxed) == 64
        }));
    }

    #[test]
    fn test_fifo_order_on_a_single_worker() {
        let scheduler = Scheduler::new(Config {
            worker_threads: 1,
            ..Config::default()
        });
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..32 {
            let order = order.clone();
            scheduler.enqueue(Task::new(move || {
                order.lock().push(i);
            }));
        }
        assert!(wait_until(Duration::from_secs(5), || {
            order.lock().len() == 32
        }));
        assert_eq!(*order.lock(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_tasks_can_schedule_more_tasks() {
        let scheduler = Scheduler::new(Config {
            worker_threads: 2,
            ..Config::default()
        });
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let hits = hits.clone();
            scheduler.enqueue(Task::new(move || {
                let hits = hits.clone();
                let inner = Scheduler::get().expect("worker threads are bound");
                inner.enqueue(Task::new(move || {
                    hits.fetch_add(1, Ordering::Relaxed);
                }));
            }));
        }
        assert!(wait_until(Duration::from_secs(5), || {
            hits.load(Ordering::Relaxed) == 8
        }));
    }

    #[test]
    fn test_drop_drains_workers() {
        let scheduler = Scheduler::new(Config {
            worker_threads: 4,
            ..Config::default()
        });
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..128 {
            let hits = hits.clone();
            scheduler.enqueue(Task::new(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }));
        }
        drop(scheduler);
        assert_eq!(hits.load(Ordering::Relaxed), 128);
    }

    #[test]
    fn test_bind_unbind_round_trip() {
        let scheduler = Scheduler::new(Config::default());
        scheduler.bind();
        assert!(Scheduler::get().is_some());
        Scheduler::unbind();
        assert!(Scheduler::get().is_none());
    }

    #[test]
    fn test_single_threaded_tasks_run_at_unbind() {
        let scheduler = Scheduler::new(Config::default());
        scheduler.bind();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let hits = hits.clone();
            crate::schedule(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            });
        }
        // Single-threaded mode never executes synchronously with enqueue.
        Scheduler::unbind();
        assert_eq!(hits.load(Ordering::Relaxed), 100);
    }

    #[test]
    #[should_panic(expected = "before any task is scheduled")]
    fn test_worker_count_frozen_after_enqueue() {
        let scheduler = Scheduler::new(Config {
            worker_threads: 1,
            ..Config::default()
        });
        scheduler.enqueue(Task::new(|| {}));
        scheduler.set_worker_thread_count(2);
    }

    #[test]
    fn test_thread_initializer_runs_per_worker() {
        let inits = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(Config::default());
        let counter = inits.clone();
        scheduler.set_thread_initializer(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        scheduler.set_worker_thread_count(3);
        assert!(wait_until(Duration::from_secs(5), || {
            inits.load(Ordering::Relaxed) == 3
        }));
    }
}
