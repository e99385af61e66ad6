use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{c_void, eventfd, EFD_CLOEXEC};

use crate::descriptor::SafeDescriptor;
use crate::errno::{errno_result, Result};

/// A wrapper around an `eventfd(2)` used to signal between threads.
///
/// `signal` adds to the counter and wakes any waiter; `wait` blocks until
/// the counter is non-zero and resets it. Multiple signals before a wait
/// coalesce, which is exactly what the pipeline's wakeup and kill
/// notifications want.
#[derive(Debug)]
pub struct Event(SafeDescriptor);

impl Event {
    pub fn new() -> Result<Event> {
        // SAFETY: eventfd returns a new descriptor or -1; the return value
        // is checked before ownership is taken.
        let ret = unsafe { eventfd(0, EFD_CLOEXEC) };
        if ret < 0 {
            return errno_result();
        }
        // SAFETY: the descriptor was just created and is owned by no one else.
        Ok(Event(unsafe { SafeDescriptor::from_raw_descriptor(ret) }))
    }

    /// Increments the counter, waking a blocked `wait`.
    pub fn signal(&self) -> Result<()> {
        let v: u64 = 1;
        // SAFETY: the buffer is a valid u64 of the size eventfd requires and
        // the descriptor is owned by self.
        let ret = unsafe {
            libc::write(
                self.0.as_raw_fd(),
                &v as *const u64 as *const c_void,
                mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Blocks until the event has been signaled, then resets it.
    ///
    /// Returns the counter value consumed, i.e. the number of coalesced
    /// signals.
    pub fn wait(&self) -> Result<u64> {
        let mut v: u64 = 0;
        // SAFETY: the buffer is a valid mutable u64 of the size eventfd
        // writes and the descriptor is owned by self.
        let ret = unsafe {
            libc::read(
                self.0.as_raw_fd(),
                &mut v as *mut u64 as *mut c_void,
                mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(v)
    }

    pub fn try_clone(&self) -> Result<Event> {
        self.0.try_clone().map(Event)
    }
}

impl AsRawFd for Event {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_then_wait() {
        let evt = Event::new().unwrap();
        evt.signal().unwrap();
        assert_eq!(evt.wait().unwrap(), 1);
    }

    #[test]
    fn signals_coalesce() {
        let evt = Event::new().unwrap();
        evt.signal().unwrap();
        evt.signal().unwrap();
        evt.signal().unwrap();
        assert_eq!(evt.wait().unwrap(), 3);
    }

    #[test]
    fn clone_shares_counter() {
        let evt = Event::new().unwrap();
        let clone = evt.try_clone().unwrap();
        clone.signal().unwrap();
        assert_eq!(evt.wait().unwrap(), 1);
    }
}
