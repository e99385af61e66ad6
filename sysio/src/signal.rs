use std::mem;
use std::ptr::null_mut;

use libc::{c_int, sigaction, SA_RESTART, SIG_DFL};

use crate::errno::{errno_result, Result};

/// Registers `handler` for the signal `num`.
///
/// # Safety
///
/// The handler runs asynchronously, interrupting whatever the thread was
/// doing, so it must only perform async-signal-safe operations (for this
/// daemon: store to an atomic and write(2) to an eventfd, nothing else).
pub unsafe fn register_signal_handler(num: c_int, handler: extern "C" fn(c_int)) -> Result<()> {
    let mut act: sigaction = mem::zeroed();
    act.sa_flags = SA_RESTART;
    act.sa_sigaction = handler as *const () as usize;

    let ret = sigaction(num, &act, null_mut());
    if ret < 0 {
        return errno_result();
    }
    Ok(())
}

/// Restores the default disposition for the signal `num`.
pub fn clear_signal_handler(num: c_int) -> Result<()> {
    // SAFETY: the sigaction struct is owned and fully initialized, and
    // restoring SIG_DFL has no preconditions.
    let ret = unsafe {
        let mut act: sigaction = mem::zeroed();
        act.sa_flags = SA_RESTART;
        act.sa_sigaction = SIG_DFL;
        sigaction(num, &act, null_mut())
    };
    if ret < 0 {
        return errno_result();
    }
    Ok(())
}
