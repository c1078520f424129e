//! Event — block until a signal is raised

use crate::lock::Lock;
use crate::sync::ConditionVariable;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reset behaviour of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    /// The signal is consumed by the first wait it releases; one `signal()`
    /// unblocks exactly one (possibly future) `wait()`.
    Auto,
    /// The signal stays raised until [`Event::clear`]; waits pass freely
    /// while it is.
    Manual,
}

struct State {
    signalled: bool,
    /// Events to propagate our signal to (see [`Event::any`]).
    deps: Vec<Arc<Shared>>,
}

struct Shared {
    mutex: Mutex<State>,
    cv: ConditionVariable,
    mode: EventMode,
}

impl Shared {
    fn signal(self: &Arc<Self>) {
        let mut state = self.mutex.lock();
        if state.signalled {
            return;
        }
        state.signalled = true;
        match self.mode {
            EventMode::Auto => self.cv.notify_one(),
            EventMode::Manual => self.cv.notify_all(),
        }
        for dep in &state.deps {
            dep.signal();
        }
    }
}

/// A cheaply cloneable signal. Clones share the same state; the state is
/// released when the last handle drops.
#[derive(Clone)]
pub struct Event {
    shared: Arc<Shared>,
}

impl Event {
    pub fn new(mode: EventMode) -> Self {
        Self::with_state(mode, false)
    }

    /// An event starting out already signalled when `signalled` is true.
    pub fn with_state(mode: EventMode, signalled: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                mutex: Mutex::new(State {
                    signalled,
                    deps: Vec::new(),
                }),
                cv: ConditionVariable::new(),
                mode,
            }),
        }
    }

    /// Raise the signal, unblocking waiters per the [`EventMode`].
    pub fn signal(&self) {
        self.shared.signal();
    }

    /// Lower the signal.
    pub fn clear(&self) {
        self.shared.mutex.lock().signalled = false;
    }

    /// Block until signalled. In Auto mode the signal is consumed on wake.
    pub fn wait(&self) {
        let mut lock = Lock::new(&self.shared.mutex);
        self.shared.cv.wait(&mut lock, |state| state.signalled);
        if self.shared.mode == EventMode::Auto {
            lock.signalled = false;
        }
    }

    /// [`wait`](Self::wait) with a deadline; false if it passed unsignalled.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut lock = Lock::new(&self.shared.mutex);
        if !self
            .shared
            .cv
            .wait_until(&mut lock, deadline, |state| state.signalled)
        {
            return false;
        }
        if self.shared.mode == EventMode::Auto {
            lock.signalled = false;
        }
        true
    }

    /// [`wait`](Self::wait) with a relative timeout; false on expiry.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    /// Non-blocking wait: true if signalled (consuming the signal in Auto
    /// mode).
    pub fn test(&self) -> bool {
        let mut state = self.shared.mutex.lock();
        if !state.signalled {
            return false;
        }
        if self.shared.mode == EventMode::Auto {
            state.signalled = false;
        }
        true
    }

    /// Whether the event is currently signalled, without consuming it. The
    /// state may change as soon as the lock is released.
    pub fn is_signalled(&self) -> bool {
        self.shared.mutex.lock().signalled
    }

    /// An event signalled whenever any of `events` is signalled (or already
    /// was).
    pub fn any<'a>(mode: EventMode, events: impl IntoIterator<Item = &'a Event>) -> Event {
        let any = Event::new(mode);
        for event in events {
            let mut state = event.shared.mutex.lock();
            if state.signalled {
                any.shared.signal();
            }
            state.deps.push(any.shared.clone());
        }
        any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_manual_event_stays_signalled() {
        let event = Event::new(EventMode::Manual);
        assert!(!event.is_signalled());
        event.signal();
        assert!(event.test());
        assert!(event.test());
        event.wait();
        event.clear();
        assert!(!event.is_signalled());
    }

    #[test]
    fn test_auto_event_consumes_the_signal() {
        let event = Event::new(EventMode::Auto);
        event.signal();
        assert!(event.test());
        assert!(!event.test());
    }

    #[test]
    fn test_initially_signalled() {
        let event = Event::with_state(EventMode::Manual, true);
        event.wait();
    }

    #[test]
    fn test_wait_for_timeout() {
        let event = Event::new(EventMode::Manual);
        let start = Instant::now();
        assert!(!event.wait_for(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_signal_crosses_threads() {
        let event = Event::new(EventMode::Manual);
        let signaller = {
            let event = event.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                event.signal();
            })
        };
        assert!(event.wait_for(Duration::from_secs(5)));
        signaller.join().expect("signaller panicked");
    }

    #[test]
    fn test_any_fires_on_member_signal() {
        let a = Event::new(EventMode::Manual);
        let b = Event::new(EventMode::Manual);
        let any = Event::any(EventMode::Manual, [&a, &b]);
        assert!(!any.is_signalled());
        b.signal();
        assert!(any.is_signalled());
    }

    #[test]
    fn test_any_already_signalled_member() {
        let a = Event::with_state(EventMode::Manual, true);
        let any = Event::any(EventMode::Manual, [&a]);
        assert!(any.is_signalled());
    }
}
