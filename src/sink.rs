//! The pipeline stage that delivers responses.
//!
//! Responses are written whole to the owning session's response endpoint.
//! A close marker arriving on the queue means the session is already out of
//! the registry; any responses that raced past the removal are flushed to
//! the endpoint first, then the carried handle is dropped, closing both
//! data-path sockets.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use log::{debug, warn};
use sysio::Event;

use crate::message::{BufferKind, PipelineMsg};
use crate::registry::SessionRegistry;

pub struct ResponseSink {
    registry: Arc<SessionRegistry>,
    input: Receiver<PipelineMsg>,
    /// Poked after this stage removes a session so the command source
    /// drops its stale watch.
    wakeup: Event,
}

impl ResponseSink {
    pub fn new(
        registry: Arc<SessionRegistry>,
        input: Receiver<PipelineMsg>,
        wakeup: Event,
    ) -> ResponseSink {
        ResponseSink {
            registry,
            input,
            wakeup,
        }
    }

    /// Runs until the input queue closes and drains.
    pub fn run(self) {
        // Responses whose session was already removed from the registry,
        // held until the close marker arrives to flush them.
        let mut orphans: HashMap<u64, Vec<Vec<u8>>> = HashMap::new();
        // Sessions this stage failed to write to; later responses for them
        // are dropped instead of orphaned.
        let mut failed: HashSet<u64> = HashSet::new();

        while let Ok(msg) = self.input.recv() {
            match msg {
                PipelineMsg::Buffer(rsp) => {
                    debug_assert_eq!(rsp.kind, BufferKind::Response);
                    if failed.contains(&rsp.session_id) {
                        continue;
                    }
                    match self.registry.lookup_by_id(rsp.session_id) {
                        Ok(session) => {
                            let mut stream = session.response_stream();
                            if let Err(e) = stream.write_all(&rsp.bytes) {
                                warn!(
                                    "response write to session {:#x} failed, closing: {}",
                                    rsp.session_id, e
                                );
                                failed.insert(rsp.session_id);
                                let _ = self.registry.remove(rsp.session_id);
                                let _ = self.wakeup.signal();
                            }
                        }
                        Err(_) => {
                            // Removed upstream; the close marker is on its
                            // way behind us.
                            orphans.entry(rsp.session_id).or_default().push(rsp.bytes);
                        }
                    }
                }
                PipelineMsg::Close(session) => {
                    let id = session.id();
                    if let Some(responses) = orphans.remove(&id) {
                        let mut stream = session.response_stream();
                        for bytes in responses {
                            if stream.write_all(&bytes).is_err() {
                                break;
                            }
                        }
                    }
                    failed.remove(&id);
                    debug!("closed session {:#x}", id);
                    // Dropping the last handle closes both endpoints.
                }
            }
        }
        debug!("response sink exiting");
    }
}
