use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sysio::sync::{Condvar, Mutex};

use super::{Error, Result, TpmTransport, TransportCancel};
use crate::tpm;

/// Loopback driver: every command comes back as its own response after an
/// optional fixed delay.
///
/// Exists for bring-up and tests; the delay makes a command "slow" so that
/// cancellation has something to interrupt. A cancel during the delay wakes
/// the wait early and substitutes a cancellation response.
pub struct EchoTransport {
    pending: Option<Vec<u8>>,
    delay: Duration,
    cancel: Arc<EchoCancel>,
}

impl EchoTransport {
    pub fn new(delay: Duration) -> EchoTransport {
        EchoTransport {
            pending: None,
            delay,
            cancel: Arc::new(EchoCancel {
                cancelled: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }
}

impl TpmTransport for EchoTransport {
    fn send(&mut self, command: &[u8]) -> Result<()> {
        // A cancel that raced with the end of the previous command must not
        // leak into this one.
        *self.cancel.cancelled.lock() = false;
        self.pending = Some(command.to_vec());
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let response = self
            .pending
            .take()
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "receive without a command in flight",
                ))
            })?;

        let deadline = Instant::now() + self.delay;
        let mut cancelled = self.cancel.cancelled.lock();
        loop {
            if *cancelled {
                *cancelled = false;
                return Ok(tpm::cancelled_response());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(response);
            }
            let (guard, _) = self.cancel.cond.wait_timeout(cancelled, deadline - now);
            cancelled = guard;
        }
    }

    fn set_locality(&mut self, _locality: u8) -> Result<()> {
        Ok(())
    }

    fn cancel_handle(&self) -> Box<dyn TransportCancel> {
        Box::new(EchoCancelHandle {
            shared: self.cancel.clone(),
        })
    }
}

struct EchoCancel {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

struct EchoCancelHandle {
    shared: Arc<EchoCancel>,
}

impl TransportCancel for EchoCancelHandle {
    fn cancel(&self) -> Result<()> {
        *self.shared.cancelled.lock() = true;
        self.shared.cond.notify_all();
        Ok(())
    }
}
