//! weft — a user-space task scheduler built on stackful fibers
//!
//! Tasks are cheap, fine-grained, and allowed to block: a blocking wait
//! suspends the calling *fiber*, and the worker thread underneath moves on
//! to other runnable work. Workers balance load by stealing queued tasks
//! from each other; fibers are pinned to the worker that first ran them and
//! never migrate.
//!
//! ```no_run
//! use weft::{schedule, Config, Scheduler};
//! use weft::sync::{Event, EventMode, WaitGroup};
//!
//! let scheduler = Scheduler::new(Config::all_cores());
//! scheduler.bind();
//!
//! let wg = WaitGroup::new(1);
//! let ready = Event::new(EventMode::Auto);
//! {
//!     let (wg, ready) = (wg.clone(), ready.clone());
//!     schedule(move || {
//!         ready.wait(); // suspends the fiber, not the thread
//!         wg.done();
//!     });
//! }
//! ready.signal();
//! wg.wait();
//!
//! Scheduler::unbind();
//! ```

mod config;
mod context;
mod fiber;
mod lock;
mod scheduler;
mod stack;
mod task;
mod thread;
mod waiting;
mod worker;

pub mod sync;

pub use config::{Config, ConfigError, DEFAULT_FIBER_STACK_SIZE, MAX_WORKER_THREADS};
pub use fiber::Fiber;
pub use lock::Lock;
pub use scheduler::Scheduler;
#[cfg(not(unix))]
pub use stack::HeapStackAllocator;
#[cfg(unix)]
pub use stack::MmapStackAllocator;
pub use stack::{FiberStack, StackAllocator, StackError};
pub use task::Task;
pub use thread::num_logical_cpus;

/// Schedule `f` on the scheduler bound to the current thread.
///
/// Panics if no scheduler is bound here (see [`Scheduler::bind`]; worker
/// threads are bound implicitly, so tasks may schedule freely).
pub fn schedule<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let scheduler = Scheduler::get().expect("schedule() called on a thread with no scheduler bound");
    scheduler.enqueue(Task::new(f));
}
