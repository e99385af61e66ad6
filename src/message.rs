use std::sync::Arc;

use crate::registry::Session;

/// Whether a buffer travels toward the TPM or back toward a client.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferKind {
    Command,
    Response,
}

/// A command or response buffer tagged with the session it belongs to.
///
/// Ownership transfers from stage to stage; a buffer is never shared or
/// aliased across the pipeline.
#[derive(Debug)]
pub struct TaggedBuffer {
    pub session_id: u64,
    pub bytes: Vec<u8>,
    pub kind: BufferKind,
}

impl TaggedBuffer {
    pub fn command(session_id: u64, bytes: Vec<u8>) -> TaggedBuffer {
        TaggedBuffer {
            session_id,
            bytes,
            kind: BufferKind::Command,
        }
    }

    pub fn response(session_id: u64, bytes: Vec<u8>) -> TaggedBuffer {
        TaggedBuffer {
            session_id,
            bytes,
            kind: BufferKind::Response,
        }
    }
}

/// One message on an inter-stage queue.
pub enum PipelineMsg {
    Buffer(TaggedBuffer),
    /// The session was removed from the registry by an upstream stage. The
    /// marker rides the same FIFO as data, so by the time the sink sees it
    /// every response queued ahead of it has been written; dropping the
    /// carried handle then closes both endpoints.
    Close(Arc<Session>),
}
