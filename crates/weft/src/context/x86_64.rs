//! x86_64 (System V) context switch
//!
//! Saves the callee-saved integer registers plus stack and resume pointers.
//! Caller-saved registers are clobbered by the call itself, and the SSE
//! registers are all caller-saved under this ABI, so neither needs to be
//! stored.

use std::arch::naked_asm;

/// Callee-saved register block. Field order is the asm offset contract;
/// the fields are only ever read from the assembly below.
#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
pub(crate) struct SavedContext {
    rsp: u64, // 0x00
    rip: u64, // 0x08
    rbx: u64, // 0x10
    rbp: u64, // 0x18
    r12: u64, // 0x20
    r13: u64, // 0x28
    r14: u64, // 0x30
    r15: u64, // 0x38
}

/// Save into `from` (rdi), restore from `to` (rsi), and jump.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn fiber_swap(_from: *mut SavedContext, _to: *const SavedContext) {
    naked_asm!(
        // Save callee-saved state; the resume point is the label below, so a
        // resumed context falls straight through to `ret`.
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Restore the target context.
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        "2:",
        "ret",
    );
}

/// First-resume trampoline: the entry function and its argument ride in
/// callee-saved registers installed by [`prepare`].
#[unsafe(naked)]
unsafe extern "C" fn fiber_start() {
    naked_asm!("mov rdi, r13", "jmp r12");
}

pub(crate) unsafe fn prepare(
    ctx: *mut SavedContext,
    stack_top: *mut u8,
    entry: extern "C" fn(usize) -> !,
    arg: usize,
) {
    // The entry function observes a post-call stack pointer: 16-byte
    // aligned minus the return-address slot.
    let sp = ((stack_top as usize) & !0xF) - 8;
    *ctx = SavedContext {
        rsp: sp as u64,
        rip: fiber_start as usize as u64,
        rbx: 0,
        rbp: 0,
        r12: entry as usize as u64,
        r13: arg as u64,
        r14: 0,
        r15: 0,
    };
}
