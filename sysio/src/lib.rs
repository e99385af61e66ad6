//! Thin, safe wrappers over the Unix primitives the broker daemon is built
//! on: eventfd, epoll, seqpacket sockets with fd passing, signal handlers,
//! and logger setup.
//!
//! Everything here is Linux-only and deliberately small; each module wraps
//! one kernel interface and exposes the minimal surface the daemon needs.

mod descriptor;
mod errno;
mod event;
mod net;
mod poll;
mod signal;
pub mod sync;
pub mod syslog;
mod worker;

pub use descriptor::{AsRawDescriptor, Descriptor, RawDescriptor, SafeDescriptor};
pub use errno::{errno_result, Error, Result};
pub use event::Event;
pub use net::{ScmSocket, UnixSeqpacket, UnixSeqpacketListener};
pub use poll::{EventToken, TriggeredEvent, WaitContext};
pub use signal::{clear_signal_handler, register_signal_handler};
pub use worker::WorkerThread;
