//! x86_64 context switching implementation

use core::arch::global_asm;
use core::ffi::c_void;

use super::EntryFn;

/// x86_64 CPU context: the SysV callee-saved set plus the stack pointer.
///
/// Field offsets are baked into the assembly below; keep them in sync.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Context {
    /// Stack pointer
    pub rsp: u64,
    /// Frame pointer
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl Context {
    /// Create an empty context; only meaningful once filled in by a switch
    /// or by [`prepare`].
    pub const fn new() -> Self {
        Self {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

// weft_ctx_switch(save: rdi, load: rsi)
//
// The return address pushed by our caller stays on the old stack; the final
// `ret` of a later switch back into `save` resumes at that call site. A
// fresh context instead carries the address of weft_task_start at the top of
// its forged stack, so the first switch "returns" into the trampoline.
//
// weft_task_start expects r12 = task argument, r13 = entry function. The
// trampoline runs with rsp 16-byte aligned, so the `call` leaves the entry
// function with standard ABI alignment. The entry function never returns.
global_asm!(
    r#"
    .text
    .balign 16
    .global weft_ctx_switch
weft_ctx_switch:
    mov [rdi + 0x00], rsp
    mov [rdi + 0x08], rbp
    mov [rdi + 0x10], rbx
    mov [rdi + 0x18], r12
    mov [rdi + 0x20], r13
    mov [rdi + 0x28], r14
    mov [rdi + 0x30], r15
    mov rsp, [rsi + 0x00]
    mov rbp, [rsi + 0x08]
    mov rbx, [rsi + 0x10]
    mov r12, [rsi + 0x18]
    mov r13, [rsi + 0x20]
    mov r14, [rsi + 0x28]
    mov r15, [rsi + 0x30]
    ret

    .global weft_task_start
weft_task_start:
    mov rdi, r12
    call r13
    ud2
    "#
);

extern "C" {
    fn weft_task_start();
}

/// Forge a context that enters `entry(arg)` on the given stack.
///
/// # Safety
///
/// See [`super::prepare`].
pub(super) unsafe fn prepare(
    ctx: &mut Context,
    stack_base: *mut u8,
    stack_len: usize,
    entry: EntryFn,
    arg: *mut c_void,
) {
    let top = (stack_base as usize + stack_len) & !15;
    let slot = (top - 8) as *mut u64;
    // SAFETY: `slot` lies inside the stack region (len >= 64 per contract);
    // the first switch's `ret` pops it as the resume address.
    unsafe {
        *slot = weft_task_start as usize as u64;
    }
    ctx.rsp = slot as u64;
    ctx.rbp = 0;
    ctx.r12 = arg as u64;
    ctx.r13 = entry as usize as u64;
}
