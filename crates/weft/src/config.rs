//! Scheduler configuration

#[cfg(not(unix))]
use crate::stack::HeapStackAllocator;
#[cfg(unix)]
use crate::stack::MmapStackAllocator;
use crate::stack::StackAllocator;
use std::fmt;
use std::sync::Arc;

/// Hard cap on the number of multi-threaded workers a scheduler may own.
pub const MAX_WORKER_THREADS: usize = 256;

/// Default size of a fiber stack, excluding the guard page.
pub const DEFAULT_FIBER_STACK_SIZE: usize = 1024 * 1024;

/// Anything smaller cannot hold a task frame plus the switch machinery.
const MIN_FIBER_STACK_SIZE: usize = 16 * 1024;

/// Errors produced by [`Config::validate`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Requested fiber stack size is too small to be usable
    #[error("fiber stack size {0} is below the minimum of {MIN_FIBER_STACK_SIZE} bytes")]
    StackTooSmall(usize),
}

/// Configuration for a [`Scheduler`](crate::Scheduler).
///
/// The defaults give a single-threaded scheduler (tasks run only while the
/// bound thread waits or unbinds) with 1 MiB guard-paged fiber stacks.
#[derive(Clone)]
pub struct Config {
    /// Number of dedicated worker threads. Zero means single-threaded mode.
    pub worker_threads: usize,

    /// Size of each fiber stack in bytes (rounded up to the page size).
    pub fiber_stack_size: usize,

    /// Place an inaccessible guard page below each fiber stack so that an
    /// overflow faults instead of corrupting a neighbouring allocation.
    pub guard_pages: bool,

    /// Pin worker thread `i` to logical CPU `i % num_logical_cpus()`.
    /// Ignored on platforms without thread affinity.
    pub pin_workers: bool,

    /// Source of fiber stacks.
    pub stack_allocator: Arc<dyn StackAllocator>,
}

impl Default for Config {
    fn default() -> Self {
        #[cfg(unix)]
        let stack_allocator: Arc<dyn StackAllocator> = Arc::new(MmapStackAllocator);
        #[cfg(not(unix))]
        let stack_allocator: Arc<dyn StackAllocator> = Arc::new(HeapStackAllocator);
        Self {
            worker_threads: 0,
            fiber_stack_size: DEFAULT_FIBER_STACK_SIZE,
            guard_pages: true,
            pin_workers: false,
            stack_allocator,
        }
    }
}

impl Config {
    /// A multi-threaded configuration with one worker per logical CPU.
    pub fn all_cores() -> Self {
        Self {
            worker_threads: crate::thread::num_logical_cpus(),
            ..Self::default()
        }
    }

    /// Check the configuration for values the scheduler cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fiber_stack_size < MIN_FIBER_STACK_SIZE {
            return Err(ConfigError::StackTooSmall(self.fiber_stack_size));
        }
        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("worker_threads", &self.worker_threads)
            .field("fiber_stack_size", &self.fiber_stack_size)
            .field("guard_pages", &self.guard_pages)
            .field("pin_workers", &self.pin_workers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.worker_threads, 0);
        assert_eq!(cfg.fiber_stack_size, DEFAULT_FIBER_STACK_SIZE);
        assert!(cfg.guard_pages);
    }

    #[test]
    fn test_tiny_stack_rejected() {
        let cfg = Config {
            fiber_stack_size: 4096,
            ..Config::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::StackTooSmall(4096)));
    }

    #[test]
    fn test_all_cores_uses_every_cpu() {
        let cfg = Config::all_cores();
        assert_eq!(cfg.worker_threads, crate::thread::num_logical_cpus());
        assert!(cfg.validate().is_ok());
    }
}
