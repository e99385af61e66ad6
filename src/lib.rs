//! A user-space access broker for a TPM 2.0 device.
//!
//! A TPM is a single-threaded resource with per-client state (locality,
//! cancellation), so concurrent local clients cannot share it directly.
//! This daemon gives every client its own session — an unpredictable 64-bit
//! id plus a pair of data-path sockets — and funnels all command traffic
//! through a three-stage pipeline:
//!
//! ```text
//! clients --> CommandSource --> Broker --> ResponseSink --> clients
//!                (epoll)        (TPM)        (writes)
//! ```
//!
//! Session management (create, cancel, set-locality) happens out-of-band on
//! a seqpacket control socket; data-path descriptors travel back to clients
//! via `SCM_RIGHTS`.

pub mod barrier;
pub mod broker;
pub mod config;
pub mod control;
pub mod daemon;
pub mod message;
pub mod registry;
pub mod sink;
pub mod source;
pub mod tpm;
pub mod transport;
