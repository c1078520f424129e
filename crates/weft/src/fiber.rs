//! Fiber — a user-space thread of control owned by one worker
//!
//! A fiber is created by a worker, runs task bodies on its own stack, parks
//! in the worker's idle pool between tasks, and is destroyed only when the
//! worker stops. It never migrates: every resume happens on the thread of
//! the worker that created it.

use crate::context::{self, SavedContext};
use crate::lock::Lock;
use crate::stack::FiberStack;
use crate::task::Task;
use crate::worker::{self, Worker};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Scheduling state of a fiber.
///
/// Transitions happen only while the owning worker's work mutex is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FiberState {
    /// Parked in the worker's idle pool, no task bound
    Idle = 0,
    /// In the worker's ready queue, waiting to be resumed
    Queued = 1,
    /// Executing on the worker's thread
    Running = 2,
    /// Suspended in a wait with no deadline; parked on the caller's
    /// lock/predicate, on no worker queue
    Yielded = 3,
    /// Suspended in a wait with a deadline; tracked in the waiting set
    Waiting = 4,
}

impl FiberState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Queued,
            2 => Self::Running,
            3 => Self::Yielded,
            4 => Self::Waiting,
            _ => unreachable!("invalid fiber state {raw}"),
        }
    }
}

/// A stackful fiber. Obtain the running one with [`Fiber::current`].
///
/// Handles are cheap `Arc` clones; synchronisation primitives hold one per
/// suspended waiter so they can [`notify`](Fiber::notify) it later.
pub struct Fiber {
    id: u32,
    /// Guarded by the owner worker's work mutex; atomic so handles on other
    /// threads can be stored and debug-read without one.
    state: AtomicU8,
    ctx: UnsafeCell<SavedContext>,
    /// `None` for main fibers, which adopt the thread's native stack.
    stack: Option<FiberStack>,
    /// Task bound for the next resume. Touched only by the owner worker's
    /// thread.
    task: UnsafeCell<Option<Task>>,
    worker: Weak<Worker>,
}

// The context and task cells are only ever touched from the owner worker's
// thread; `state` changes only under the worker's mutex. Handles on other
// threads are limited to `notify()`, which goes through that mutex.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// The fiber executing on this thread, or `None` when the thread has no
    /// scheduler worker (neither a worker thread nor a bound thread).
    pub fn current() -> Option<Arc<Fiber>> {
        worker::current().and_then(|w| w.try_current_fiber())
    }

    /// Identifier unique within the owning worker. The main fiber is 0.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Move a suspended fiber back to its worker's ready queue and wake the
    /// worker.
    ///
    /// Notifying a fiber that is Running or already Queued is a no-op, so
    /// spurious notifies are harmless. Notifying an Idle fiber is a
    /// programming error.
    pub fn notify(self: &Arc<Self>) {
        self.owner().enqueue_fiber(self);
    }

    /// Suspend until `pred` returns true.
    ///
    /// `lock` must guard the data `pred` reads; it is released while the
    /// fiber is suspended and held again whenever `pred` runs. The worker
    /// executes other tasks and fibers for the duration.
    pub fn wait<T>(&self, lock: &mut Lock<'_, T>, mut pred: impl FnMut(&mut T) -> bool) {
        self.assert_current();
        self.owner().wait(lock, None, &mut pred);
    }

    /// Like [`wait`](Self::wait), giving up at `deadline`.
    ///
    /// Returns false if the deadline passed with `pred` still false; expiry
    /// is not an error.
    pub fn wait_until<T>(
        &self,
        lock: &mut Lock<'_, T>,
        deadline: Instant,
        mut pred: impl FnMut(&mut T) -> bool,
    ) -> bool {
        self.assert_current();
        self.owner().wait(lock, Some(deadline), &mut pred)
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

    /// Suspend until notified, with no lock or predicate.
    ///
    /// The pairing [`notify`](Self::notify) needs external synchronisation
    /// to not race the suspension; prefer the predicate waits.
    pub fn park(&self) {
        self.assert_current();
        self.owner().park(None);
    }

    /// [`park`](Self::park) with a deadline. Returns false on expiry.
    pub fn park_until(&self, deadline: Instant) -> bool {
        self.assert_current();
        self.owner().park(Some(deadline))
    }

    /// [`park`](Self::park) with a relative timeout. Returns false on expiry.
    pub fn park_for(&self, timeout: Duration) -> bool {
        self.park_until(Instant::now() + timeout)
    }

    // ------------------------------------------------------------------
    // Worker-internal surface
    // ------------------------------------------------------------------

    /// Create a task fiber with its context prepared to enter the worker's
    /// fiber loop on first resume.
    pub(crate) fn new_task_fiber(id: u32, stack: FiberStack, owner: Weak<Worker>) -> Arc<Fiber> {
        let fiber = Arc::new(Fiber {
            id,
            state: AtomicU8::new(FiberState::Idle as u8),
            ctx: UnsafeCell::new(SavedContext::default()),
            stack: Some(stack),
            task: UnsafeCell::new(None),
            worker: owner,
        });
        let top = fiber.stack.as_ref().expect("task fiber has a stack").top();
        unsafe {
            context::prepare(
                fiber.ctx.get(),
                top,
                worker::fiber_entry,
                Arc::as_ptr(&fiber) as usize,
            );
        }
        fiber
    }

    /// Adopt the calling thread's native stack as a fiber. Its context is
    /// filled by the first switch away from it.
    pub(crate) fn adopt(id: u32, owner: Weak<Worker>) -> Arc<Fiber> {
        Arc::new(Fiber {
            id,
            state: AtomicU8::new(FiberState::Running as u8),
            ctx: UnsafeCell::new(SavedContext::default()),
            stack: None,
            task: UnsafeCell::new(None),
            worker: owner,
        })
    }

    pub(crate) fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Caller must hold the owning worker's work mutex.
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn ctx_ptr(&self) -> *mut SavedContext {
        self.ctx.get()
    }

    /// Bind the task the fiber runs on its next resume.
    ///
    /// # Safety
    ///
    /// Only the owner worker's thread may touch the slot, and the fiber must
    /// not be running.
    pub(crate) unsafe fn bind_task(&self, task: Task) {
        let slot = &mut *self.task.get();
        debug_assert!(slot.is_none(), "fiber already has a task bound");
        *slot = Some(task);
    }

    /// Take the bound task. Same contract as [`bind_task`](Self::bind_task),
    /// except it is called by the fiber itself while running.
    pub(crate) unsafe fn take_task(&self) -> Option<Task> {
        (*self.task.get()).take()
    }

    pub(crate) fn owner(&self) -> Arc<Worker> {
        self.worker
            .upgrade()
            .expect("fiber outlived its scheduler worker")
    }

    fn assert_current(&self) {
        debug_assert!(
            Fiber::current().is_some_and(|f| std::ptr::eq(Arc::as_ptr(&f), self)),
            "fiber wait called from a fiber that is not running"
        );
    }

    #[cfg(test)]
    pub(crate) fn detached_for_tests() -> Arc<Fiber> {
        Arc::new(Fiber {
            id: u32::MAX,
            state: AtomicU8::new(FiberState::Waiting as u8),
            ctx: UnsafeCell::new(SavedContext::default()),
            stack: None,
            task: UnsafeCell::new(None),
            worker: Weak::new(),
        })
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
