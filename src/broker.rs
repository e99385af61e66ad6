//! The pipeline stage that owns the TPM.
//!
//! The broker consumes tagged commands from its input queue, drives them
//! through the transport one at a time, and emits tagged responses. It is
//! the serialization point of the whole daemon: whatever the session count,
//! at most one command is ever outstanding against the TPM.

use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;

use log::{debug, error, warn};
use sysio::sync::Mutex;

use crate::message::{BufferKind, PipelineMsg, TaggedBuffer};
use crate::registry::{PendingCommand, Session, SessionRegistry};
use crate::tpm;
use crate::transport::{self, TpmTransport, TransportCancel};

/// What a cancel request found.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The command was interrupted on the TPM or dropped from the queue.
    Cancelled,
    /// The session had no command anywhere in the pipeline.
    NothingToCancel,
}

struct Shared {
    /// Session id of the command currently on the TPM, if any. The broker
    /// thread and cancel callers arbitrate through this single slot.
    active: Mutex<Option<u64>>,
    cancel: Box<dyn TransportCancel>,
}

/// Cross-thread control surface of the broker, used by the control plane
/// and by shutdown.
#[derive(Clone)]
pub struct BrokerHandle {
    shared: Arc<Shared>,
}

impl BrokerHandle {
    /// Cancels `session`'s in-flight command, wherever it currently is.
    pub fn cancel(&self, session: &Session) -> CancelOutcome {
        {
            let active = self.shared.active.lock();
            if *active == Some(session.id()) {
                // On the TPM right now; interrupt it through the transport.
                // The response (cancelled or natural, whichever the device
                // produces) flows back through the pipeline as usual.
                if let Err(e) = self.shared.cancel.cancel() {
                    warn!("transport cancel for session {:#x}: {}", session.id(), e);
                }
                return CancelOutcome::Cancelled;
            }
        }

        let mut state = session.state();
        match state.pending {
            PendingCommand::Queued { .. } => {
                // Not dispatched yet; the broker drops it on dequeue and
                // synthesizes the cancellation response instead.
                state.pending = PendingCommand::Queued { cancel: true };
                CancelOutcome::Cancelled
            }
            PendingCommand::Executing => {
                // Raced with dispatch between the two locks; the command is
                // reaching the TPM, so interrupt the transport after all.
                drop(state);
                if let Err(e) = self.shared.cancel.cancel() {
                    warn!("transport cancel for session {:#x}: {}", session.id(), e);
                }
                CancelOutcome::Cancelled
            }
            PendingCommand::None => CancelOutcome::NothingToCancel,
        }
    }

    /// Interrupts whatever command is on the TPM, regardless of session.
    /// Shutdown uses this to unwedge a broker blocked in `receive`.
    pub fn cancel_active(&self) {
        if self.shared.active.lock().is_some() {
            if let Err(e) = self.shared.cancel.cancel() {
                warn!("transport cancel during shutdown: {}", e);
            }
        }
    }
}

pub struct Broker {
    transport: Box<dyn TpmTransport>,
    registry: Arc<SessionRegistry>,
    input: Receiver<PipelineMsg>,
    output: SyncSender<PipelineMsg>,
    shared: Arc<Shared>,
    /// Locality last applied to the transport; used to skip redundant
    /// `set_locality` calls.
    applied_locality: Option<u8>,
}

impl Broker {
    pub fn new(
        transport: Box<dyn TpmTransport>,
        registry: Arc<SessionRegistry>,
        input: Receiver<PipelineMsg>,
        output: SyncSender<PipelineMsg>,
    ) -> (Broker, BrokerHandle) {
        let shared = Arc::new(Shared {
            active: Mutex::new(None),
            cancel: transport.cancel_handle(),
        });
        let handle = BrokerHandle {
            shared: shared.clone(),
        };
        (
            Broker {
                transport,
                registry,
                input,
                output,
                shared,
                applied_locality: None,
            },
            handle,
        )
    }

    /// Runs until the input queue closes (and drains) or the transport
    /// faults. A fault is fatal to the daemon; the caller escalates it.
    pub fn run(mut self) -> transport::Result<()> {
        while let Ok(msg) = self.input.recv() {
            match msg {
                PipelineMsg::Buffer(cmd) => {
                    debug_assert_eq!(cmd.kind, BufferKind::Command);
                    self.dispatch(cmd)?;
                }
                PipelineMsg::Close(session) => {
                    // Forwarded in FIFO order so the sink flushes this
                    // session's remaining responses before closing it.
                    if self.output.send(PipelineMsg::Close(session)).is_err() {
                        break;
                    }
                }
            }
        }
        debug!("broker input closed, exiting");
        Ok(())
    }

    fn dispatch(&mut self, cmd: TaggedBuffer) -> transport::Result<()> {
        let session = match self.registry.lookup_by_id(cmd.session_id) {
            Ok(session) => session,
            // The session died while the command sat in the queue.
            Err(_) => return Ok(()),
        };

        let locality = {
            let mut state = session.state();
            if let PendingCommand::Queued { cancel: true } = state.pending {
                state.pending = PendingCommand::None;
                drop(state);
                debug!(
                    "dropping cancelled command for session {:#x}",
                    cmd.session_id
                );
                let _ = self.output.send(PipelineMsg::Buffer(TaggedBuffer::response(
                    cmd.session_id,
                    tpm::cancelled_response(),
                )));
                return Ok(());
            }
            state.pending = PendingCommand::Executing;
            state.locality
        };

        *self.shared.active.lock() = Some(cmd.session_id);
        let result = self.execute(&cmd.bytes, locality);
        *self.shared.active.lock() = None;
        session.state().pending = PendingCommand::None;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                // The transport itself is broken; nothing further can be
                // brokered. Escalate so the daemon exits non-zero.
                error!("transport fault, shutting down: {}", e);
                return Err(e);
            }
        };

        let _ = self.output.send(PipelineMsg::Buffer(TaggedBuffer::response(
            cmd.session_id,
            response,
        )));
        Ok(())
    }

    fn execute(&mut self, command: &[u8], locality: u8) -> transport::Result<Vec<u8>> {
        if self.applied_locality != Some(locality) {
            self.transport.set_locality(locality)?;
            self.applied_locality = Some(locality);
        }
        self.transport.send(command)?;
        self.transport.receive()
    }
}
