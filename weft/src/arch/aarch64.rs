//! AArch64 context switching implementation

use core::arch::global_asm;
use core::ffi::c_void;

use super::EntryFn;

/// AArch64 CPU context: sp, the link register, the frame pointer, and the
/// AAPCS64 callee-saved registers x19-x28.
///
/// Field offsets are baked into the assembly below; keep them in sync.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Context {
    /// Stack pointer
    pub sp: u64,
    /// Link register (x30)
    pub lr: u64,
    /// Frame pointer (x29)
    pub fp: u64,
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
}

impl Context {
    /// Create an empty context; only meaningful once filled in by a switch
    /// or by [`prepare`].
    pub const fn new() -> Self {
        Self {
            sp: 0,
            lr: 0,
            fp: 0,
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

// weft_ctx_switch(save: x0, load: x1)
//
// The link register is part of the saved set, so the final `ret` of a later
// switch back into `save` resumes at the original call site. A fresh context
// instead carries weft_task_start in lr; the first switch "returns" into the
// trampoline with x19 = task argument and x20 = entry function. sp stays
// 16-byte aligned throughout, as AArch64 requires.
global_asm!(
    r#"
    .text
    .balign 16
    .global weft_ctx_switch
weft_ctx_switch:
    mov x9, sp
    str x9,       [x0]
    stp x30, x29, [x0, #8]
    stp x19, x20, [x0, #24]
    stp x21, x22, [x0, #40]
    stp x23, x24, [x0, #56]
    stp x25, x26, [x0, #72]
    stp x27, x28, [x0, #88]
    ldr x9,       [x1]
    ldp x30, x29, [x1, #8]
    ldp x19, x20, [x1, #24]
    ldp x21, x22, [x1, #40]
    ldp x23, x24, [x1, #56]
    ldp x25, x26, [x1, #72]
    ldp x27, x28, [x1, #88]
    mov sp, x9
    ret

    .global weft_task_start
weft_task_start:
    mov x0, x19
    blr x20
    brk #0x1
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
    ctx.sp = top as u64;
    ctx.lr = weft_task_start as usize as u64;
    ctx.fp = 0;
    ctx.x19 = arg as u64;
    ctx.x20 = entry as usize as u64;
}
