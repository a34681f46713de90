//! Architecture-specific context switching
//!
//! The scheduler needs exactly one primitive: save the current execution
//! context, install another, and continue on the new context's stack. The
//! swap never touches OS thread primitives; it only moves the callee-saved
//! register set (the caller-saved half is dead across any call boundary, so
//! the compiler has already spilled what matters).
//!
//! This is the portable-substitute flavor: there is no return-on-exit link,
//! so a finished task must explicitly switch back to its shepherd.

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
pub use aarch64::Context;
#[cfg(target_arch = "x86_64")]
pub use x86_64::Context;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("weft supports x86_64 and aarch64 targets only");

use core::ffi::c_void;

/// Entry function installed into a fresh context. Receives the opaque
/// argument registered at [`prepare`] time and must never return (it has no
/// caller frame to return into).
pub type EntryFn = extern "C" fn(*mut c_void) -> !;

extern "C" {
    fn weft_ctx_switch(save: *mut Context, load: *const Context);
}

/// Swap execution contexts: save the current one into `save`, resume `load`.
///
/// Control comes back here (with `Ok`-style normality) when some other
/// context later switches back into `save`.
///
/// # Safety
///
/// `save` must be valid for writes and `load` must hold a context previously
/// captured by this function or built by [`prepare`], whose stack is still
/// live. The caller must guarantee nothing on the current stack is borrowed
/// by the context being resumed.
#[inline]
pub unsafe fn switch(save: *mut Context, load: *const Context) {
    // SAFETY: contract forwarded to the caller.
    unsafe { weft_ctx_switch(save, load) }
}

/// Build a context so that the first [`switch`] into it enters `entry(arg)`
/// on the given stack.
///
/// # Safety
///
/// `[stack_base, stack_base + stack_len)` must be a writable region of at
/// least 64 bytes owned by the future task and unused until the context is
/// dropped. `arg` must remain valid for as long as `entry` may observe it.
pub unsafe fn prepare(
    ctx: &mut Context,
    stack_base: *mut u8,
    stack_len: usize,
    entry: EntryFn,
    arg: *mut c_void,
) {
    // SAFETY: contract forwarded to the caller.
    unsafe {
        #[cfg(target_arch = "x86_64")]
        x86_64::prepare(ctx, stack_base, stack_len, entry, arg);
        #[cfg(target_arch = "aarch64")]
        aarch64::prepare(ctx, stack_base, stack_len, entry, arg);
    }
}
