//! Worker — one run queue, one blocked-fiber set, one thread of execution
//!
//! A worker owns every fiber it creates for life. Multi-threaded workers
//! drive a dedicated OS thread; the single-threaded worker borrows the
//! thread that bound the scheduler and only makes progress while that
//! thread waits or unbinds.
//!
//! All queues and every fiber state transition are guarded by the single
//! `work` mutex. Lock order is always caller lock → work mutex; the work
//! mutex is released after a suspending fiber records its state and before
//! the context switch, and each resumed path re-acquires what it needs.

use crate::config::Config;
use crate::context;
use crate::fiber::{Fiber, FiberState};
use crate::lock::Lock;
use crate::scheduler::Scheduler;
use crate::stack::StackAllocator;
use crate::task::Task;
use crate::thread;
use crate::waiting::WaitingFibers;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cell::{RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Arc<Worker>>> = const { RefCell::new(None) };
}

/// Worker driving this thread, if any.
pub(crate) fn current() -> Option<Arc<Worker>> {
    CURRENT_WORKER.with(|w| w.borrow().clone())
}

pub(crate) fn set_current(worker: Option<Arc<Worker>>) {
    CURRENT_WORKER.with(|w| *w.borrow_mut() = worker);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Owns an OS thread and runs its loop until stopped
    MultiThreaded,
    /// Bound to the thread that called `Scheduler::bind`
    SingleThreaded,
}

/// Everything guarded by the work mutex.
#[derive(Default)]
pub(crate) struct Work {
    tasks: VecDeque<Task>,
    /// Queued fibers, resumed in notify order
    fibers: VecDeque<Arc<Fiber>>,
    waiting: WaitingFibers,
    idle_fibers: Vec<Arc<Fiber>>,
    /// Every task fiber ever created; fixes ids and pins allocations
    all_fibers: Vec<Arc<Fiber>>,
    /// Fibers currently Yielded or Waiting
    num_blocked_fibers: usize,
    /// Latch: a parked thread wants `added` signalled on new work
    notify_added: bool,
    shutdown: bool,
}

impl Work {
    fn num_ready(&self) -> usize {
        self.tasks.len() + self.fibers.len()
    }
}

pub(crate) struct Worker {
    id: usize,
    mode: Mode,
    scheduler: Weak<Scheduler>,
    self_weak: Weak<Worker>,

    work: Mutex<Work>,
    added: Condvar,
    /// Mirror of `tasks.len() + fibers.len()`, readable without the mutex.
    /// Heuristic only; the mutex-guarded queues are authoritative.
    num: AtomicUsize,

    stack_size: usize,
    guard_pages: bool,
    allocator: Arc<dyn StackAllocator>,
    pin_to: Option<usize>,

    main_fiber: OnceLock<Arc<Fiber>>,
    /// Fiber executing on this worker's thread. Touched only by that thread.
    current_fiber: UnsafeCell<Option<Arc<Fiber>>>,
    /// Victim selection for stealing. Only the worker's thread draws from it.
    steal_rng: Mutex<SmallRng>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

// `current_fiber` is only accessed from the worker's own thread; everything
// else is either immutable, atomic, or behind a mutex.
unsafe impl Send for Worker {}
unsafe impl Sync for Worker {}

impl Worker {
    pub(crate) fn new(scheduler: &Arc<Scheduler>, mode: Mode, id: usize) -> Arc<Worker> {
        let cfg: &Config = scheduler.cfg();
        Arc::new_cyclic(|self_weak| Worker {
            id,
            mode,
            scheduler: Arc::downgrade(scheduler),
            self_weak: self_weak.clone(),
            work: Mutex::new(Work::default()),
            added: Condvar::new(),
            num: AtomicUsize::new(0),
            stack_size: cfg.fiber_stack_size,
            guard_pages: cfg.guard_pages,
            allocator: cfg.stack_allocator.clone(),
            pin_to: cfg
                .pin_workers
                .then(|| id % thread::num_logical_cpus()),
            main_fiber: OnceLock::new(),
            current_fiber: UnsafeCell::new(None),
            steal_rng: Mutex::new(SmallRng::seed_from_u64(id as u64 + 1)),
            thread: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Start the worker. Multi-threaded workers spawn their thread;
    /// single-threaded workers adopt the calling thread.
    pub(crate) fn start(self: &Arc<Self>) {
        match self.mode {
            Mode::MultiThreaded => {
                let worker = self.clone();
                let handle = thread::spawn_worker(self.id, self.pin_to, move || {
                    Worker::thread_main(worker);
                })
                .expect("failed to spawn worker thread");
                *self.thread.lock() = Some(handle);
            }
            Mode::SingleThreaded => {
                self.adopt_main_fiber();
                set_current(Some(self.clone()));
            }
        }
    }

    /// Stop the worker and reclaim its thread. For multi-threaded workers
    /// this blocks until the run-loop has drained (no tasks, no ready or
    /// blocked fibers).
    pub(crate) fn stop(&self) {
        match self.mode {
            Mode::MultiThreaded => {
                {
                    let mut work = self.work.lock();
                    work.shutdown = true;
                }
                self.added.notify_one();
                if let Some(handle) = self.thread.lock().take() {
                    if handle.thread().id() == std::thread::current().id() {
                        // The scheduler is being dropped from this worker's
                        // own thread (last handle released mid-steal). The
                        // run-loop will observe shutdown once we unwind;
                        // joining ourselves would deadlock.
                        return;
                    }
                    handle.join().expect("worker thread panicked");
                }
            }
            Mode::SingleThreaded => {
                let work = self.work.lock();
                debug_assert_eq!(work.num_ready(), 0, "single-threaded worker stopped with work");
                debug_assert_eq!(
                    work.num_blocked_fibers, 0,
                    "single-threaded worker stopped with blocked fibers"
                );
            }
        }
    }

    fn thread_main(worker: Arc<Worker>) {
        if let Some(scheduler) = worker.scheduler.upgrade() {
            Scheduler::set_bound(Arc::downgrade(&scheduler));
            if let Some(init) = scheduler.thread_initializer() {
                init();
            }
        }
        set_current(Some(worker.clone()));
        worker.adopt_main_fiber();
        debug!(worker = worker.id, "worker started");

        worker.run();

        debug!(worker = worker.id, "worker stopped");
        set_current(None);
        Scheduler::set_bound(Weak::new());
    }

    fn adopt_main_fiber(self: &Arc<Self>) {
        let main = Fiber::adopt(0, self.self_weak.clone());
        self.set_current_fiber(main.clone());
        self.main_fiber
            .set(main)
            .unwrap_or_else(|_| panic!("worker already started"));
    }

    fn main_fiber(&self) -> &Arc<Fiber> {
        self.main_fiber.get().expect("worker not started")
    }

    pub(crate) fn try_current_fiber(&self) -> Option<Arc<Fiber>> {
        unsafe { (*self.current_fiber.get()).clone() }
    }

    fn current_fiber(&self) -> Arc<Fiber> {
        self.try_current_fiber().expect("no fiber running on this worker")
    }

    fn set_current_fiber(&self, fiber: Arc<Fiber>) {
        unsafe {
            *self.current_fiber.get() = Some(fiber);
        }
    }

    fn sync_num(&self, work: &Work) {
        self.num.store(work.num_ready(), Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Enqueue / steal
    // ------------------------------------------------------------------

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, Work>> {
        self.work.try_lock()
    }

    /// Append a task under a lock taken by the caller (the scheduler's
    /// balancing path selects its target worker this way).
    pub(crate) fn enqueue_and_unlock(&self, mut work: MutexGuard<'_, Work>, task: Task) {
        work.tasks.push_back(task);
        self.sync_num(&work);
        let signal = work.notify_added;
        if signal {
            work.notify_added = false;
        }
        drop(work);
        if signal {
            self.added.notify_one();
        }
    }

    pub(crate) fn enqueue(&self, task: Task) {
        let work = self.work.lock();
        self.enqueue_and_unlock(work, task);
    }

    /// Move a suspended fiber back to the ready queue (notify and timeout
    /// path). Running/Queued fibers are left alone: a spurious notify.
    pub(crate) fn enqueue_fiber(&self, fiber: &Arc<Fiber>) {
        let mut signal = false;
        {
            let mut work = self.work.lock();
            match fiber.state() {
                FiberState::Running | FiberState::Queued => return,
                FiberState::Waiting => {
                    work.waiting.erase(fiber);
                }
                // A fiber is in the waiting set iff it is Waiting.
                FiberState::Yielded => debug_assert!(!work.waiting.contains(fiber)),
                FiberState::Idle => {
                    debug_assert!(false, "notify on an idle fiber");
                    return;
                }
            }
            fiber.set_state(FiberState::Queued);
            work.fibers.push_back(fiber.clone());
            self.sync_num(&work);
            if work.notify_added {
                work.notify_added = false;
                signal = true;
            }
        }
        if signal {
            self.added.notify_one();
        }
    }

    /// Give up the most recently enqueued task to another worker. Fibers are
    /// pinned here and are never handed out.
    pub(crate) fn steal(&self) -> Option<Task> {
        if self.num.load(Ordering::Relaxed) == 0 {
            return None;
        }
        let mut work = self.work.try_lock()?;
        let task = work.tasks.pop_back()?;
        self.sync_num(&work);
        Some(task)
    }

    // ------------------------------------------------------------------
    // Run loop (main fiber)
    // ------------------------------------------------------------------

    fn run(&self) {
        let mut work = self.work.lock();
        loop {
            self.wait_for_work(&mut work);
            if work.shutdown && work.num_ready() == 0 && work.num_blocked_fibers == 0 {
                break;
            }
            self.run_until_idle(&mut work);
        }
    }

    fn wait_for_work(&self, work: &mut MutexGuard<'_, Work>) {
        debug_assert_eq!(
            self.num.load(Ordering::Relaxed),
            work.num_ready(),
            "ready-work mirror out of sync"
        );
        if self.mode == Mode::MultiThreaded && work.num_ready() == 0 && !work.shutdown {
            if let Some(scheduler) = self.scheduler.upgrade() {
                scheduler.on_begin_spinning(self.id);
                MutexGuard::unlocked(work, || self.spin_for_work(&scheduler));
            }
        }
        loop {
            self.enqueue_fiber_timeouts(work);
            if work.num_ready() > 0 || (work.shutdown && work.num_blocked_fibers == 0) {
                return;
            }
            self.park_on_added(work);
        }
    }

    /// Park on the `added` condvar, waking no later than the earliest wait
    /// deadline.
    fn park_on_added(&self, work: &mut MutexGuard<'_, Work>) {
        work.notify_added = true;
        match work.waiting.next_deadline() {
            Some(deadline) => {
                let _ = self.added.wait_until(work, deadline);
            }
            None => {
                self.added.wait(work);
            }
        }
        work.notify_added = false;
    }

    /// Move every expired fiber from the waiting set to the ready queue.
    fn enqueue_fiber_timeouts(&self, work: &mut Work) {
        let now = Instant::now();
        while let Some(fiber) = work.waiting.take(now) {
            debug_assert_eq!(fiber.state(), FiberState::Waiting);
            trace!(worker = self.id, fiber = fiber.id(), "wait deadline expired");
            fiber.set_state(FiberState::Queued);
            work.fibers.push_back(fiber);
            self.sync_num(work);
        }
    }

    /// Execute ready fibers and tasks until both queues drain.
    fn run_until_idle(&self, work: &mut MutexGuard<'_, Work>) {
        loop {
            self.enqueue_fiber_timeouts(work);
            if !self.dispatch_one(work) {
                return;
            }
        }
    }

    /// Resume one ready fiber, or bind one task into an idle fiber and run
    /// it. Returns false when neither queue has work. Runs on the main
    /// fiber; control returns here when the dispatched fiber suspends or
    /// finishes.
    fn dispatch_one(&self, work: &mut MutexGuard<'_, Work>) -> bool {
        if let Some(fiber) = work.fibers.pop_front() {
            self.sync_num(work);
            debug_assert_eq!(fiber.state(), FiberState::Queued);
            fiber.set_state(FiberState::Running);
            self.resume_from_main(work, &fiber);
            return true;
        }
        if let Some(task) = work.tasks.pop_front() {
            self.sync_num(work);
            let fiber = self.acquire_fiber(work);
            debug_assert_eq!(fiber.state(), FiberState::Idle);
            unsafe { fiber.bind_task(task) };
            fiber.set_state(FiberState::Running);
            self.resume_from_main(work, &fiber);
            return true;
        }
        false
    }

    /// Switch from the main fiber to `to`, with the work mutex released for
    /// the duration and re-held on return.
    fn resume_from_main(&self, work: &mut MutexGuard<'_, Work>, to: &Arc<Fiber>) {
        let main = self.main_fiber().clone();
        debug_assert!(Arc::ptr_eq(&self.current_fiber(), &main));
        debug_assert!(!Arc::ptr_eq(to, &main));
        self.set_current_fiber(to.clone());
        MutexGuard::unlocked(work, || unsafe {
            context::switch(main.ctx_ptr(), to.ctx_ptr());
        });
        // Whoever switched back (a parking or suspending fiber) restored
        // `current_fiber` to the main fiber before swapping.
        debug_assert!(Arc::ptr_eq(&self.current_fiber(), &main));
    }

    fn acquire_fiber(&self, work: &mut Work) -> Arc<Fiber> {
        if let Some(fiber) = work.idle_fibers.pop() {
            return fiber;
        }
        let id = (work.all_fibers.len() + 1) as u32;
        let stack = self
            .allocator
            .allocate(self.stack_size, self.guard_pages)
            .expect("failed to allocate a fiber stack");
        let fiber = Fiber::new_task_fiber(id, stack, self.self_weak.clone());
        trace!(worker = self.id, fiber = id, "created fiber");
        work.all_fibers.push(fiber.clone());
        fiber
    }

    /// Called by a task fiber after its task returned: park in the idle
    /// pool and hand the thread back to the main fiber.
    fn park_fiber_and_return_to_main(&self, fiber: &Fiber) {
        let mut work = self.work.lock();
        let this = self.current_fiber();
        debug_assert!(std::ptr::eq(Arc::as_ptr(&this), fiber));
        fiber.set_state(FiberState::Idle);
        work.idle_fibers.push(this);
        let main = self.main_fiber().clone();
        self.set_current_fiber(main.clone());
        drop(work);
        unsafe { context::switch(fiber.ctx_ptr(), main.ctx_ptr()) };
    }

    // ------------------------------------------------------------------
    // Blocking (the fundamental wait)
    // ------------------------------------------------------------------

    /// Block the current fiber until `pred` holds, releasing `lock` across
    /// each suspension. Returns false only when `deadline` passes with the
    /// predicate still false.
    pub(crate) fn wait<T>(
        &self,
        lock: &mut Lock<'_, T>,
        deadline: Option<Instant>,
        pred: &mut dyn FnMut(&mut T) -> bool,
    ) -> bool {
        let fiber = self.current_fiber();
        if Arc::ptr_eq(&fiber, self.main_fiber()) {
            return self.wait_on_main(lock, deadline, pred);
        }
        while !pred(lock.data_mut()) {
            if expired(deadline) {
                return false;
            }
            let mut work = self.work.lock();
            self.begin_suspend(&mut work, &fiber, deadline);
            lock.unlock();
            self.suspend(work, &fiber);
            lock.relock();
            self.end_suspend(&fiber);
        }
        true
    }

    /// Lock-free wait: suspend until notified. Returns false when resumed by
    /// deadline expiry instead.
    pub(crate) fn park(&self, deadline: Option<Instant>) -> bool {
        let fiber = self.current_fiber();
        if Arc::ptr_eq(&fiber, self.main_fiber()) {
            self.park_on_main(deadline);
        } else {
            let mut work = self.work.lock();
            self.begin_suspend(&mut work, &fiber, deadline);
            self.suspend(work, &fiber);
            self.end_suspend(&fiber);
        }
        !expired(deadline)
    }

    /// Record the suspension state. Caller holds the work mutex (and, for
    /// predicate waits, still the caller lock — state must be recorded
    /// before that lock is released so a notifier never sees Running).
    fn begin_suspend(&self, work: &mut Work, fiber: &Arc<Fiber>, deadline: Option<Instant>) {
        debug_assert_eq!(fiber.state(), FiberState::Running);
        match deadline {
            Some(deadline) => {
                fiber.set_state(FiberState::Waiting);
                work.waiting.add(deadline, fiber.clone());
            }
            None => fiber.set_state(FiberState::Yielded),
        }
        work.num_blocked_fibers += 1;
    }

    /// Hand the thread to the next runnable fiber: the front of the ready
    /// queue, or the main fiber (which executes tasks and parks when none
    /// remain). Consumes the work guard; the mutex is released before the
    /// switch and not held on return.
    fn suspend(&self, mut work: MutexGuard<'_, Work>, from: &Arc<Fiber>) {
        let main = self.main_fiber();
        // A queued main fiber stays queued: its inline wait loop, not a
        // context switch, is what consumes that entry.
        let resumable = work
            .fibers
            .front()
            .is_some_and(|next| !Arc::ptr_eq(next, main));
        let to = if resumable {
            let next = work.fibers.pop_front().expect("front exists");
            self.sync_num(&work);
            debug_assert_eq!(next.state(), FiberState::Queued);
            next.set_state(FiberState::Running);
            next
        } else {
            main.clone()
        };
        debug_assert!(!Arc::ptr_eq(&to, from));
        self.set_current_fiber(to.clone());
        drop(work);
        unsafe { context::switch(from.ctx_ptr(), to.ctx_ptr()) };
    }

    /// Post-resume bookkeeping for the suspended fiber.
    fn end_suspend(&self, fiber: &Arc<Fiber>) {
        let mut work = self.work.lock();
        debug_assert_eq!(fiber.state(), FiberState::Running);
        work.num_blocked_fibers -= 1;
        work.waiting.erase(fiber);
    }

    /// Predicate wait on the main fiber. Only the single-threaded worker's
    /// main fiber (the bound thread's own stack) ever waits; it cannot
    /// switch away from itself, so it drives the run-loop inline until its
    /// own notify or deadline arrives.
    fn wait_on_main<T>(
        &self,
        lock: &mut Lock<'_, T>,
        deadline: Option<Instant>,
        pred: &mut dyn FnMut(&mut T) -> bool,
    ) -> bool {
        let main = self.main_fiber().clone();
        while !pred(lock.data_mut()) {
            if expired(deadline) {
                return false;
            }
            let mut work = self.work.lock();
            self.begin_suspend(&mut work, &main, deadline);
            lock.unlock();
            self.drive_until_woken(&mut work, &main);
            work.num_blocked_fibers -= 1;
            work.waiting.erase(&main);
            drop(work);
            lock.relock();
        }
        true
    }

    fn park_on_main(&self, deadline: Option<Instant>) {
        let main = self.main_fiber().clone();
        let mut work = self.work.lock();
        self.begin_suspend(&mut work, &main, deadline);
        self.drive_until_woken(&mut work, &main);
        work.num_blocked_fibers -= 1;
        work.waiting.erase(&main);
    }

    /// Run the scheduler loop on the (suspended) main fiber until a notify
    /// or timeout moves the main fiber into the ready queue.
    fn drive_until_woken(&self, work: &mut MutexGuard<'_, Work>, main: &Arc<Fiber>) {
        loop {
            self.enqueue_fiber_timeouts(work);
            if let Some(pos) = work.fibers.iter().position(|f| Arc::ptr_eq(f, main)) {
                work.fibers.remove(pos);
                self.sync_num(work);
                debug_assert_eq!(main.state(), FiberState::Queued);
                main.set_state(FiberState::Running);
                return;
            }
            if self.dispatch_one(work) {
                continue;
            }
            self.park_on_added(work);
        }
    }

    // ------------------------------------------------------------------
    // Spinning and flush
    // ------------------------------------------------------------------

    /// Bounded busy-wait before parking: watch for local work and try to
    /// steal some, so bursty enqueues land on a hot thread.
    fn spin_for_work(&self, scheduler: &Scheduler) {
        const SPIN_FOR: Duration = Duration::from_millis(1);
        let start = Instant::now();
        while start.elapsed() < SPIN_FOR {
            for _ in 0..256 {
                if self.num.load(Ordering::Relaxed) > 0 {
                    return;
                }
                for _ in 0..32 {
                    std::hint::spin_loop();
                }
            }
            let rnd = self.steal_rng.lock().gen::<u64>();
            if let Some(task) = scheduler.steal_work(self.id, rnd) {
                trace!(worker = self.id, "stole a task while spinning");
                let mut work = self.work.lock();
                work.tasks.push_back(task);
                self.sync_num(&work);
                return;
            }
            std::thread::yield_now();
        }
    }

    /// Drain a single-threaded worker completely: all tasks, ready fibers,
    /// and blocked fibers (parking at their deadlines as needed). Used by
    /// `Scheduler::unbind`.
    pub(crate) fn flush(&self) {
        debug_assert_eq!(self.mode, Mode::SingleThreaded);
        let mut work = self.work.lock();
        loop {
            self.enqueue_fiber_timeouts(&mut work);
            if self.dispatch_one(&mut work) {
                continue;
            }
            if work.num_ready() == 0 && work.num_blocked_fibers == 0 {
                return;
            }
            self.park_on_added(&mut work);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let work = self.work.get_mut();
        debug_assert_eq!(
            work.num_blocked_fibers, 0,
            "worker dropped with blocked fibers"
        );
        debug_assert!(work.waiting.is_empty(), "worker dropped with timed waiters");
        debug_assert!(work.tasks.is_empty(), "worker dropped with queued tasks");
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// Resident loop of every task fiber. Entered once per fiber on its first
/// resume; between tasks the fiber parks itself in the idle pool and this
/// frame sleeps until the worker binds the next task.
pub(crate) extern "C" fn fiber_entry(arg: usize) -> ! {
    let fiber = unsafe { &*(arg as *const Fiber) };
    // Deliberately not an owning handle: an `Arc<Worker>` parked in this
    // frame for the fiber's lifetime would keep the worker alive through
    // its own fiber registry. The worker outlives every resume of this
    // fiber, which is only ever entered from that worker's thread.
    let worker = unsafe { &*Arc::as_ptr(&fiber.owner()) };
    loop {
        let task = unsafe { fiber.take_task() }.expect("fiber resumed with no task bound");
        // The task is consumed (and its captures dropped) before the fiber
        // transitions back to Idle.
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task.run())) {
            // Unwinding would cross the context switch, which has no unwind
            // tables. Terminate instead.
            error!(
                worker = worker.id,
                fiber = fiber.id(),
                "task panicked: {}; aborting",
                panic_message(payload.as_ref())
            );
            std::process::abort();
        }
        worker.park_fiber_and_return_to_main(fiber);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "opaque panic payload"
    }
}
