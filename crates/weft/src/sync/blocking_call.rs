//! Run a blocking function without stalling a worker

use crate::sync::WaitGroup;
use parking_lot::Mutex;

/// Run `f` on a dedicated OS thread and block the *calling fiber* (not the
/// worker thread) until it returns.
///
/// Use this to wrap syscalls or FFI that genuinely block; the worker keeps
/// executing other tasks while `f` runs. Called from a thread with no
/// scheduler bound it degrades to a plain blocking call on a helper thread.
pub fn blocking_call<T, F>(f: F) -> T
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    let wg = WaitGroup::new(1);
    let result = Mutex::new(None);
    std::thread::scope(|scope| {
        let wg_done = wg.clone();
        let result = &result;
        scope.spawn(move || {
            *result.lock() = Some(f());
            wg_done.done();
        });
        wg.wait();
    });
    result.into_inner().expect("blocking call produced no result")
}
