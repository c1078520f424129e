//! Fiber stack allocation
//!
//! On unix targets stacks are anonymous mappings with an optional
//! `PROT_NONE` guard page at the low end, so an overflow faults immediately
//! instead of silently trampling a neighbouring allocation. Elsewhere they
//! fall back to plain heap allocations with no overflow detection. Stacks
//! grow downward from [`FiberStack::top`].

use std::ptr::NonNull;

/// Errors produced while allocating a fiber stack.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StackError {
    /// The anonymous mapping itself failed
    #[error("mmap of a {size} byte fiber stack failed (errno {errno})")]
    Map { size: usize, errno: i32 },

    /// The guard page could not be protected
    #[error("mprotect of the fiber stack guard page failed (errno {errno})")]
    Protect { errno: i32 },

    /// The fallback heap allocation failed
    #[error("allocation of a {size} byte fiber stack failed")]
    Alloc { size: usize },
}

/// Source of fiber stacks, injected through
/// [`Config::stack_allocator`](crate::Config::stack_allocator).
///
/// Implementations must be callable from any worker thread concurrently.
pub trait StackAllocator: Send + Sync {
    /// Allocate a stack of at least `size` usable bytes, with a guard page
    /// below it when `guard_pages` is set and the platform supports one.
    fn allocate(&self, size: usize, guard_pages: bool) -> Result<FiberStack, StackError>;
}

/// An owned fiber stack: a page-aligned mapping on unix, a heap allocation
/// elsewhere. Released on drop.
pub struct FiberStack {
    base: NonNull<u8>,
    #[cfg(unix)]
    total: usize,
    #[cfg(not(unix))]
    layout: std::alloc::Layout,
}

// The backing memory is plain bytes; the raw pointer is only non-Send by
// default.
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

impl FiberStack {
    /// Highest address of the stack; the initial stack pointer starts here.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.size()) }
    }

    /// Total allocated size including any guard page.
    pub fn size(&self) -> usize {
        #[cfg(unix)]
        {
            self.total
        }
        #[cfg(not(unix))]
        {
            self.layout.size()
        }
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.total);
        }
        #[cfg(not(unix))]
        unsafe {
            std::alloc::dealloc(self.base.as_ptr(), self.layout);
        }
    }
}

/// Default unix [`StackAllocator`]: one `mmap` per stack plus a guard page.
#[cfg(unix)]
pub struct MmapStackAllocator;

#[cfg(unix)]
impl StackAllocator for MmapStackAllocator {
    fn allocate(&self, size: usize, guard_pages: bool) -> Result<FiberStack, StackError> {
        let page = page_size();
        let usable = round_up(size, page);
        let guard = if guard_pages { page } else { 0 };
        let total = usable + guard;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::Map {
                size: total,
                errno: last_errno(),
            });
        }

        if guard_pages {
            // Guard page sits at the low end; the stack grows down into it.
            let rc = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
            if rc != 0 {
                let errno = last_errno();
                unsafe { libc::munmap(base, total) };
                return Err(StackError::Protect { errno });
            }
        }

        Ok(FiberStack {
            base: unsafe { NonNull::new_unchecked(base.cast()) },
            total,
        })
    }
}

/// Portable fallback [`StackAllocator`] backed by the global allocator.
/// Guard pages are not available; an overflow goes undetected.
#[cfg(not(unix))]
pub struct HeapStackAllocator;

#[cfg(not(unix))]
impl StackAllocator for HeapStackAllocator {
    fn allocate(&self, size: usize, _guard_pages: bool) -> Result<FiberStack, StackError> {
        let layout = std::alloc::Layout::from_size_align(size, 16)
            .map_err(|_| StackError::Alloc { size })?;
        let base = unsafe { std::alloc::alloc(layout) };
        match NonNull::new(base) {
            Some(base) => Ok(FiberStack { base, layout }),
            None => Err(StackError::Alloc { size }),
        }
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(unix)]
fn round_up(value: usize, to: usize) -> usize {
    (value + to - 1) & !(to - 1)
}

#[cfg(unix)]
fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_allocate_and_release() {
        let stack = MmapStackAllocator
            .allocate(64 * 1024, true)
            .expect("failed to map stack");
        assert!(stack.size() >= 64 * 1024 + page_size());
        assert_eq!(stack.top() as usize % page_size(), 0);

        // The usable region must be writable right up to the top.
        unsafe {
            let top = stack.top();
            *top.sub(1) = 0xAA;
            *top.sub(64 * 1024) = 0x55;
            assert_eq!(*top.sub(1), 0xAA);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_unguarded_stack_has_no_extra_page() {
        let page = page_size();
        let stack = MmapStackAllocator
            .allocate(page, false)
            .expect("failed to map stack");
        assert_eq!(stack.size(), page);
    }

    #[cfg(unix)]
    #[test]
    fn test_size_rounds_to_page() {
        let page = page_size();
        let stack = MmapStackAllocator
            .allocate(page + 1, false)
            .expect("failed to map stack");
        assert_eq!(stack.size(), page * 2);
    }

    #[cfg(not(unix))]
    #[test]
    fn test_heap_fallback_allocates() {
        let stack = HeapStackAllocator
            .allocate(64 * 1024, true)
            .expect("failed to allocate stack");
        assert_eq!(stack.size(), 64 * 1024);
        unsafe {
            *stack.top().sub(1) = 0xAA;
            assert_eq!(*stack.top().sub(1), 0xAA);
        }
    }
}
