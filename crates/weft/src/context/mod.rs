//! Cooperative context switching between fibers on one thread
//!
//! A [`SavedContext`] holds the callee-saved register state of a suspended
//! fiber. [`switch`] stores the current state into one context and resumes
//! another; [`prepare`] arranges a fresh context so that its first resume
//! enters `entry(arg)` on the supplied stack.
//!
//! Only callee-saved registers and the resume address are preserved. Signal
//! masks, FPU/SIMD control words, TLS and segment bases are deliberately
//! not: a fiber is always resumed on the same OS thread that last ran it,
//! so that state never changes underneath it.

#[cfg(target_arch = "x86_64")]
#[path = "x86_64.rs"]
mod imp;

#[cfg(target_arch = "aarch64")]
#[path = "aarch64.rs"]
mod imp;

pub(crate) use imp::SavedContext;

/// Save the current register state into `from`, restore `to`, and jump.
///
/// # Safety
///
/// Both pointers must reference valid contexts. `to` must either have been
/// filled by a previous save or prepared with [`prepare`], and must belong
/// to a fiber owned by the calling thread's worker.
#[inline]
pub(crate) unsafe fn switch(from: *mut SavedContext, to: *const SavedContext) {
    imp::fiber_swap(from, to);
}

/// Arrange for the first resume of `ctx` to call `entry(arg)` on the stack
/// ending at `stack_top`.
///
/// # Safety
///
/// `stack_top` must be the high end of a mapping large enough for `entry`'s
/// frames. `entry` must never return; there is nothing beneath it.
#[inline]
pub(crate) unsafe fn prepare(
    ctx: *mut SavedContext,
    stack_top: *mut u8,
    entry: extern "C" fn(usize) -> !,
    arg: usize,
) {
    imp::prepare(ctx, stack_top, entry, arg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{FiberStack, StackAllocator};

    fn test_stack() -> FiberStack {
        #[cfg(unix)]
        {
            crate::stack::MmapStackAllocator
                .allocate(64 * 1024, true)
                .expect("failed to map stack")
        }
        #[cfg(not(unix))]
        {
            crate::stack::HeapStackAllocator
                .allocate(64 * 1024, false)
                .expect("failed to allocate stack")
        }
    }

    struct SwitchTest {
        main: SavedContext,
        fiber: SavedContext,
        value: usize,
    }

    extern "C" fn entry(arg: usize) -> ! {
        let test = unsafe { &mut *(arg as *mut SwitchTest) };
        test.value = 42;
        unsafe { switch(&mut test.fiber, &test.main) };
        test.value = 99;
        unsafe { switch(&mut test.fiber, &test.main) };
        unreachable!("fiber resumed after its final switch");
    }

    #[test]
    fn test_switch_round_trips_through_a_new_stack() {
        let stack = test_stack();
        let mut test = Box::new(SwitchTest {
            main: SavedContext::default(),
            fiber: SavedContext::default(),
            value: 0,
        });

        let arg = &mut *test as *mut SwitchTest as usize;
        unsafe { prepare(&mut test.fiber, stack.top(), entry, arg) };
        assert_eq!(test.value, 0);

        unsafe { switch(&mut test.main, &test.fiber) };
        assert_eq!(test.value, 42);

        unsafe { switch(&mut test.main, &test.fiber) };
        assert_eq!(test.value, 99);
    }

    #[test]
    fn test_locals_survive_suspension() {
        extern "C" fn sum_entry(arg: usize) -> ! {
            let test = unsafe { &mut *(arg as *mut SwitchTest) };
            let mut acc = 0usize;
            for step in 1..=4usize {
                acc += step;
                unsafe { switch(&mut test.fiber, &test.main) };
            }
            test.value = acc;
            unsafe { switch(&mut test.fiber, &test.main) };
            unreachable!();
        }

        let stack = test_stack();
        let mut test = Box::new(SwitchTest {
            main: SavedContext::default(),
            fiber: SavedContext::default(),
            value: 0,
        });
        let arg = &mut *test as *mut SwitchTest as usize;
        unsafe { prepare(&mut test.fiber, stack.top(), sum_entry, arg) };

        for _ in 0..5 {
            unsafe { switch(&mut test.main, &test.fiber) };
        }
        assert_eq!(test.value, 1 + 2 + 3 + 4);
    }
}
