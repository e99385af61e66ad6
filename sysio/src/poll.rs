use std::fs::File;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::os::unix::io::FromRawFd;
use std::ptr::null_mut;

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EINTR, EPOLLHUP, EPOLLIN, EPOLLRDHUP,
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL,
};
use smallvec::SmallVec;

use crate::descriptor::AsRawDescriptor;
use crate::errno::{errno_result, Error, Result};

const WAIT_CONTEXT_MAX_EVENTS: usize = 16;

/// A token identifying one watched descriptor in `wait` results.
///
/// Tokens are carried through the kernel as the u64 in `epoll_event.data`,
/// so implementations must encode to and from a raw u64. Enums typically
/// pack the variant discriminant into the low bits and any payload above it.
pub trait EventToken {
    fn as_raw_token(&self) -> u64;
    fn from_raw_token(data: u64) -> Self;
}

impl EventToken for u64 {
    fn as_raw_token(&self) -> u64 {
        *self
    }

    fn from_raw_token(data: u64) -> Self {
        data
    }
}

impl EventToken for () {
    fn as_raw_token(&self) -> u64 {
        0
    }

    fn from_raw_token(_data: u64) -> Self {}
}

/// One readiness event returned by [`WaitContext::wait`].
#[derive(Copy, Clone, Debug)]
pub struct TriggeredEvent<T: EventToken> {
    pub token: T,
    pub is_readable: bool,
    pub is_hungup: bool,
}

/// Waits for readiness on a dynamic set of descriptors, each tagged with a
/// token.
///
/// Events are level-triggered: an unhandled readable descriptor will be
/// reported again by the next `wait`, so callers must consume (or delete)
/// what they are told about or the wait loop degenerates into a busy loop.
pub struct WaitContext<T: EventToken> {
    epoll: File,
    tokens: PhantomData<[T]>,
}

impl<T: EventToken> WaitContext<T> {
    pub fn new() -> Result<WaitContext<T>> {
        // SAFETY: epoll_create1 returns a new descriptor or -1; the return
        // value is checked before ownership is taken.
        let fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if fd < 0 {
            return errno_result();
        }
        Ok(WaitContext {
            // SAFETY: the descriptor was just created and is unowned.
            epoll: unsafe { File::from_raw_fd(fd) },
            tokens: PhantomData,
        })
    }

    /// Creates a context pre-populated with `triggers`.
    pub fn build_with(triggers: &[(&dyn AsRawDescriptor, T)]) -> Result<WaitContext<T>> {
        let ctx = WaitContext::new()?;
        for (descriptor, token) in triggers {
            ctx.add(*descriptor, T::from_raw_token(token.as_raw_token()))?;
        }
        Ok(ctx)
    }

    /// Starts watching `descriptor` for readability, tagged with `token`.
    pub fn add(&self, descriptor: &dyn AsRawDescriptor, token: T) -> Result<()> {
        let mut evt = epoll_event {
            events: (EPOLLIN | EPOLLRDHUP) as u32,
            u64: token.as_raw_token(),
        };
        // SAFETY: the epoll descriptor and the descriptor to watch are both
        // valid and the epoll_event is a local initialized struct; the
        // return value is checked.
        let ret = unsafe {
            epoll_ctl(
                self.epoll.as_raw_descriptor(),
                EPOLL_CTL_ADD,
                descriptor.as_raw_descriptor(),
                &mut evt,
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Stops watching `descriptor`.
    pub fn delete(&self, descriptor: &dyn AsRawDescriptor) -> Result<()> {
        // SAFETY: both descriptors are valid and the event argument may be
        // null for EPOLL_CTL_DEL; the return value is checked.
        let ret = unsafe {
            epoll_ctl(
                self.epoll.as_raw_descriptor(),
                EPOLL_CTL_DEL,
                descriptor.as_raw_descriptor(),
                null_mut(),
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Blocks until at least one watched descriptor is ready.
    pub fn wait(&self) -> Result<SmallVec<[TriggeredEvent<T>; WAIT_CONTEXT_MAX_EVENTS]>> {
        let mut epoll_events: [MaybeUninit<epoll_event>; WAIT_CONTEXT_MAX_EVENTS] =
            // SAFETY: an array of MaybeUninit does not require initialization.
            unsafe { MaybeUninit::uninit().assume_init() };

        let ret = loop {
            // SAFETY: the epoll descriptor is valid and the events pointer
            // refers to a properly sized local array the kernel fills in; a
            // MaybeUninit<epoll_event> has the same layout as epoll_event.
            let ret = unsafe {
                epoll_wait(
                    self.epoll.as_raw_descriptor(),
                    epoll_events.as_mut_ptr() as *mut epoll_event,
                    WAIT_CONTEXT_MAX_EVENTS as i32,
                    -1,
                )
            };
            if ret >= 0 {
                break ret as usize;
            }
            let err = Error::last();
            if err.errno() != EINTR {
                return Err(err);
            }
        };

        Ok(epoll_events[..ret]
            .iter()
            .map(|e| {
                // SAFETY: epoll_wait initialized the first `ret` entries.
                let e = unsafe { e.assume_init() };
                TriggeredEvent {
                    token: T::from_raw_token(e.u64),
                    is_readable: e.events & EPOLLIN as u32 != 0,
                    is_hungup: e.events & (EPOLLHUP | EPOLLRDHUP) as u32 != 0,
                }
            })
            .collect())
    }
}
