//! OS thread adapter
//!
//! Spawns named worker threads with optional CPU pinning. Affinity is a
//! Linux-only operation; elsewhere it is a no-op. Fibers never migrate
//! between threads, so nothing beyond the default thread state needs to be
//! inherited.

use std::io;
use std::thread::JoinHandle;
use tracing::warn;

/// Number of logical CPUs available to the process.
pub fn num_logical_cpus() -> usize {
    num_cpus::get()
}

pub(crate) fn spawn_worker<F>(id: usize, pin_to: Option<usize>, f: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("weft-worker-{id}"))
        .spawn(move || {
            if let Some(cpu) = pin_to {
                pin_current_thread(cpu);
            }
            f()
        })
}

#[cfg(target_os = "linux")]
fn pin_current_thread(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu % libc::CPU_SETSIZE as usize, &mut set);
        let rc = libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
        if rc != 0 {
            warn!(cpu, rc, "failed to pin worker thread");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_current_thread(_cpu: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_logical_cpus_nonzero() {
        assert!(num_logical_cpus() >= 1);
    }

    #[test]
    fn test_spawned_worker_is_named() {
        let handle = spawn_worker(7, None, || {
            assert_eq!(std::thread::current().name(), Some("weft-worker-7"));
        })
        .expect("spawn failed");
        handle.join().expect("worker panicked");
    }

    #[test]
    fn test_pinned_worker_runs() {
        let handle = spawn_worker(0, Some(0), || {}).expect("spawn failed");
        handle.join().expect("worker panicked");
    }
}
