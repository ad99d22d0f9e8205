//! Machine context save/restore.
//!
//! The scheduler only talks to [`ExecutionContext`]; [`UContext`] is the
//! implementation on top of the glibc `ucontext` family.

use std::io;

use super::stack::Stack;

/// A saved hardware execution context.
pub trait ExecutionContext: Sized {
    /// Context for the thread's native stack. Its contents are filled in the
    /// first time the thread switches away.
    fn capture() -> io::Result<Self>;

    /// A fresh context that starts running `entry` on `stack` when switched to.
    fn prepare(stack: &Stack, entry: extern "C" fn()) -> io::Result<Self>;

    /// Save the running context into `from` and resume `to`.
    ///
    /// # Safety
    /// Both pointers must be valid for the whole switch, and `to` must hold a
    /// context that was prepared or previously saved and not yet resumed.
    unsafe fn switch(from: *mut Self, to: *const Self) -> io::Result<()>;
}

mod ffi {
    use libc::{c_int, ucontext_t};

    extern "C" {
        pub fn getcontext(ucp: *mut ucontext_t) -> c_int;
        pub fn makecontext(ucp: *mut ucontext_t, func: extern "C" fn(), argc: c_int, ...);
        pub fn swapcontext(oucp: *mut ucontext_t, ucp: *const ucontext_t) -> c_int;
    }
}

/// `ucontext_t` boxed so its address stays put while the owner moves.
pub struct UContext {
    raw: Box<libc::ucontext_t>,
}

impl UContext {
    fn zeroed() -> Self {
        // SAFETY: ucontext_t is a plain C struct, all-zero is a valid bit pattern.
        UContext {
            raw: Box::new(unsafe { std::mem::zeroed() }),
        }
    }
}

impl ExecutionContext for UContext {
    fn capture() -> io::Result<Self> {
        let mut ctx = Self::zeroed();
        if unsafe { ffi::getcontext(&mut *ctx.raw) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ctx)
    }

    fn prepare(stack: &Stack, entry: extern "C" fn()) -> io::Result<Self> {
        let mut ctx = Self::capture()?;
        ctx.raw.uc_link = std::ptr::null_mut();
        ctx.raw.uc_stack.ss_sp = stack.bottom().cast();
        ctx.raw.uc_stack.ss_size = stack.size();
        ctx.raw.uc_stack.ss_flags = 0;
        unsafe { ffi::makecontext(&mut *ctx.raw, entry, 0) };
        Ok(ctx)
    }

    unsafe fn switch(from: *mut Self, to: *const Self) -> io::Result<()> {
        let from_raw: *mut libc::ucontext_t = &mut *(*from).raw;
        let to_raw: *const libc::ucontext_t = &*(*to).raw;
        if ffi::swapcontext(from_raw, to_raw) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// The context type the runtime is built with.
pub type Context = UContext;
