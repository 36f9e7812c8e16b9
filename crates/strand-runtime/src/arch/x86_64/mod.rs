//! x86_64 context switching implementation
//!
//! Uses inline assembly for the context switch (stable since Rust 1.88).
//! Only the System V callee-saved set plus rsp/rip needs to be preserved
//! across a voluntary switch; the compiler already treats everything else
//! as clobbered at the call site.

use std::arch::naked_asm;

/// Saved register set for a voluntary fiber switch
///
/// Field order is ABI: the assembly below addresses these by byte offset.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Initialize a new fiber's context
///
/// Sets up the register file so that the first switch into `ctx` begins
/// execution in the entry trampoline, which calls `entry_fn(entry_arg)`.
///
/// # Safety
///
/// `ctx` must point to valid `Context` memory and `stack_top` must be the
/// one-past-the-end address of a live stack allocation.
#[inline]
pub unsafe fn init_context(
    ctx: *mut Context,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // Stack must be 16-byte aligned per System V AMD64 ABI; the extra -8
    // leaves rsp in "just after a call" position so the trampoline's own
    // call re-establishes 16-byte alignment at the entry function.
    let sp = stack_top as usize;
    let aligned_sp = (sp & !0xF) - 8;

    let ctx = &mut *ctx;
    ctx.rsp = aligned_sp as u64;
    ctx.rip = fiber_entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64; // entry function
    ctx.r13 = entry_arg as u64; // entry argument
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// Trampoline that calls the entry function with its argument
///
/// The entry function never returns: its tail is a yield in TERM state,
/// after which the fiber is never switched to again. `ud2` traps if that
/// invariant is ever broken.
#[unsafe(naked)]
pub unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Perform a voluntary context switch
///
/// Saves the callee-saved registers to `save` and loads from `load`.
/// Returns (into the saved context) when something later switches back.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_save: *mut Context, _load: *const Context) {
    naked_asm!(
        // Save callee-saved registers to save (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from load (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the loaded RIP
        "jmp rax",
        // Return point for the saved context
        "1:",
        "ret",
    );
}
