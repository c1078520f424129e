//! Synchronisation primitives built on the fiber wait/notify core
//!
//! Everything here reduces to `Fiber::wait(lock, pred)` on a private lock
//! plus `Fiber::notify()` calls, and falls back to OS blocking when used
//! from a thread with no scheduler bound.

mod blocking_call;
mod condvar;
mod event;
mod wait_group;

pub use blocking_call::blocking_call;
pub use condvar::ConditionVariable;
pub use event::{Event, EventMode};
pub use wait_group::WaitGroup;
