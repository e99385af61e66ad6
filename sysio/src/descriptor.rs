use std::fs::File;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use crate::errno::{errno_result, Result};

pub type RawDescriptor = RawFd;

/// Anything that can hand out the raw number of the descriptor it wraps.
///
/// Unlike `AsRawFd` this is object-safe over everything the daemon watches,
/// so watch sets and send paths can take `&dyn AsRawDescriptor`.
pub trait AsRawDescriptor {
    fn as_raw_descriptor(&self) -> RawDescriptor;
}

impl<T: AsRawFd> AsRawDescriptor for T {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.as_raw_fd()
    }
}

/// A borrowed descriptor number, for handing a plain fd to APIs that take
/// `&dyn AsRawDescriptor` without owning anything.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Descriptor(pub RawDescriptor);

impl AsRawFd for Descriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// An owned file descriptor, closed on drop.
#[derive(Debug, PartialEq, Eq)]
pub struct SafeDescriptor {
    descriptor: RawDescriptor,
}

impl SafeDescriptor {
    /// Wraps `descriptor`, taking ownership of it.
    ///
    /// # Safety
    ///
    /// The caller must own `descriptor` and transfer that ownership here;
    /// nothing else may close it afterwards.
    pub unsafe fn from_raw_descriptor(descriptor: RawDescriptor) -> SafeDescriptor {
        SafeDescriptor { descriptor }
    }

    /// Duplicates the underlying descriptor. The clone refers to the same
    /// open file description and has `FD_CLOEXEC` set.
    pub fn try_clone(&self) -> Result<SafeDescriptor> {
        // SAFETY: fcntl doesn't touch memory and the return value is checked.
        let descriptor = unsafe { libc::fcntl(self.descriptor, libc::F_DUPFD_CLOEXEC, 0) };
        if descriptor < 0 {
            return errno_result();
        }
        Ok(SafeDescriptor { descriptor })
    }

    /// Releases ownership of the descriptor without closing it.
    pub fn into_raw_descriptor(self) -> RawDescriptor {
        let descriptor = self.descriptor;
        mem::forget(self);
        descriptor
    }
}

impl Drop for SafeDescriptor {
    fn drop(&mut self) {
        // SAFETY: this struct owns the descriptor.
        let _ = unsafe { libc::close(self.descriptor) };
    }
}

impl AsRawFd for SafeDescriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.descriptor
    }
}

impl From<File> for SafeDescriptor {
    fn from(f: File) -> SafeDescriptor {
        SafeDescriptor {
            descriptor: f.into_raw_fd(),
        }
    }
}

impl From<SafeDescriptor> for File {
    fn from(s: SafeDescriptor) -> File {
        // SAFETY: ownership moves from the SafeDescriptor to the File.
        unsafe { File::from_raw_fd(s.into_raw_descriptor()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_outlives_original() {
        let file = File::open("/dev/null").unwrap();
        let desc = SafeDescriptor::from(file);
        let clone = desc.try_clone().unwrap();
        drop(desc);
        // The clone must still be a valid descriptor.
        // SAFETY: fcntl only reads the descriptor table.
        assert!(unsafe { libc::fcntl(clone.as_raw_fd(), libc::F_GETFD) } >= 0);
    }
}
