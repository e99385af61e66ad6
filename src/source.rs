//! The pipeline stage that reads client commands.
//!
//! One thread watches every session's command endpoint plus a wakeup event.
//! The wakeup is signaled whenever the session set changes; the thread then
//! rebuilds its watch set from a registry snapshot. Command endpoints are
//! nonblocking and frames are accumulated across partial reads, so one
//! uncooperative client can never wedge the watcher.

use std::collections::HashMap;
use std::io::{self, Read};
use std::mem;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use log::{debug, error, warn};
use sysio::{Descriptor, Event, EventToken, RawDescriptor, WaitContext};

use crate::message::{PipelineMsg, TaggedBuffer};
use crate::registry::{PendingCommand, Session, SessionRegistry};
use crate::tpm;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Token {
    Kill,
    Wakeup,
    Command { fd: RawDescriptor },
}

impl EventToken for Token {
    fn as_raw_token(&self) -> u64 {
        match self {
            Token::Kill => 0,
            Token::Wakeup => 1,
            Token::Command { fd } => 2 | ((*fd as u64) << 2),
        }
    }

    fn from_raw_token(data: u64) -> Self {
        match data & 0b11 {
            0 => Token::Kill,
            1 => Token::Wakeup,
            _ => Token::Command {
                fd: (data >> 2) as RawDescriptor,
            },
        }
    }
}

/// Accumulates one frame across partial reads.
struct FrameReader {
    buf: Vec<u8>,
    /// Bytes wanted before the next decision point: first the header, then
    /// the total size the header claims.
    need: usize,
}

impl FrameReader {
    fn new() -> FrameReader {
        FrameReader {
            buf: Vec::new(),
            need: tpm::HEADER_SIZE,
        }
    }
}

enum ReadOutcome {
    /// A complete frame.
    Frame(Vec<u8>),
    /// No more data for now; resume on the next readiness event.
    WouldBlock,
    /// Peer closed its end.
    Closed,
    /// The header claimed an impossible total size.
    BadLength(usize),
    Error(io::Error),
}

struct Watched {
    session: Arc<Session>,
    reader: FrameReader,
}

pub struct CommandSource {
    registry: Arc<SessionRegistry>,
    wakeup: Event,
    output: SyncSender<PipelineMsg>,
    max_command_size: usize,
}

impl CommandSource {
    pub fn new(
        registry: Arc<SessionRegistry>,
        wakeup: Event,
        output: SyncSender<PipelineMsg>,
        max_command_size: usize,
    ) -> CommandSource {
        CommandSource {
            registry,
            wakeup,
            output,
            max_command_size,
        }
    }

    /// Runs until `kill_evt` is signaled. Dropping `self` on return closes
    /// the output channel, which lets the downstream stages drain and exit.
    pub fn run(self, kill_evt: Event) {
        let wait_ctx: WaitContext<Token> = match WaitContext::build_with(&[
            (&kill_evt, Token::Kill),
            (&self.wakeup, Token::Wakeup),
        ]) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!("command source failed to build wait context: {}", e);
                return;
            }
        };

        let mut watched: HashMap<RawDescriptor, Watched> = HashMap::new();
        'poll: loop {
            let events = match wait_ctx.wait() {
                Ok(events) => events,
                Err(e) => {
                    error!("command source wait failed: {}", e);
                    break;
                }
            };
            for event in events.iter() {
                match event.token {
                    Token::Kill => break 'poll,
                    Token::Wakeup => {
                        let _ = self.wakeup.wait();
                        self.resync(&wait_ctx, &mut watched);
                    }
                    Token::Command { fd } => {
                        self.service_endpoint(fd, event.is_hungup, &wait_ctx, &mut watched);
                    }
                }
            }
        }
        debug!("command source exiting");
    }

    /// Reconciles the watch set with a registry snapshot.
    fn resync(&self, wait_ctx: &WaitContext<Token>, watched: &mut HashMap<RawDescriptor, Watched>) {
        let snapshot = self.registry.iter_endpoints();

        for (id, fd) in &snapshot {
            if watched.contains_key(fd) {
                continue;
            }
            let session = match self.registry.lookup_by_id(*id) {
                Ok(session) => session,
                // Removed again between snapshot and lookup.
                Err(_) => continue,
            };
            if let Err(e) = wait_ctx.add(&Descriptor(*fd), Token::Command { fd: *fd }) {
                warn!("failed to watch session {:#x}: {}", id, e);
                if let Ok(session) = self.registry.remove(*id) {
                    let _ = self.output.send(PipelineMsg::Close(session));
                }
                continue;
            }
            debug!("watching session {:#x} on fd {}", id, fd);
            watched.insert(
                *fd,
                Watched {
                    session,
                    reader: FrameReader::new(),
                },
            );
        }

        // Sessions another stage removed (response write failure, shutdown)
        // leave stale watches behind; drop them and let the sink finish the
        // close.
        let stale: Vec<RawDescriptor> = watched
            .keys()
            .filter(|fd| !snapshot.iter().any(|(_, live)| live == *fd))
            .copied()
            .collect();
        for fd in stale {
            if let Some(entry) = watched.remove(&fd) {
                let _ = wait_ctx.delete(&Descriptor(fd));
                let _ = self.output.send(PipelineMsg::Close(entry.session));
            }
        }
    }

    fn service_endpoint(
        &self,
        fd: RawDescriptor,
        hungup: bool,
        wait_ctx: &WaitContext<Token>,
        watched: &mut HashMap<RawDescriptor, Watched>,
    ) {
        let entry = match watched.get_mut(&fd) {
            Some(entry) => entry,
            // A stale event from a descriptor deleted earlier this batch.
            None => return,
        };

        match read_frame(entry, self.max_command_size) {
            ReadOutcome::Frame(bytes) => {
                let id = entry.session.id();
                entry.session.state().pending = PendingCommand::Queued { cancel: false };
                // A full queue blocks here; epoll is level-triggered, so
                // frames buffered on other endpoints are picked up as soon
                // as the broker drains.
                if self.output.send(PipelineMsg::Buffer(TaggedBuffer::command(id, bytes))).is_err()
                {
                    debug!("broker queue closed, dropping command");
                }
            }
            ReadOutcome::WouldBlock => {
                if hungup {
                    // Peer shut down its write side and the buffer is
                    // drained; nothing more will ever arrive.
                    self.close_session(fd, wait_ctx, watched);
                }
            }
            ReadOutcome::Closed => {
                self.close_session(fd, wait_ctx, watched);
            }
            ReadOutcome::BadLength(claimed) => {
                warn!(
                    "session {:#x} sent a frame of claimed size {} (max {}), closing",
                    entry.session.id(),
                    claimed,
                    self.max_command_size
                );
                self.close_session(fd, wait_ctx, watched);
            }
            ReadOutcome::Error(e) => {
                warn!(
                    "read error on session {:#x}, closing: {}",
                    entry.session.id(),
                    e
                );
                self.close_session(fd, wait_ctx, watched);
            }
        }
    }

    /// Removes the session from the registry and sends the close marker
    /// down the pipeline; the sink closes the endpoints after flushing.
    fn close_session(
        &self,
        fd: RawDescriptor,
        wait_ctx: &WaitContext<Token>,
        watched: &mut HashMap<RawDescriptor, Watched>,
    ) {
        if let Some(entry) = watched.remove(&fd) {
            let _ = wait_ctx.delete(&Descriptor(fd));
            let id = entry.session.id();
            debug!("closing session {:#x}", id);
            if let Ok(session) = self.registry.remove(id) {
                let _ = self.output.send(PipelineMsg::Close(session));
            }
        }
    }
}

/// Makes progress on the frame being read from `entry`'s endpoint.
///
/// Reads until a complete frame is assembled or the endpoint has no more
/// data. Partial state persists in the `FrameReader` between calls.
fn read_frame(entry: &mut Watched, max_command_size: usize) -> ReadOutcome {
    let reader = &mut entry.reader;
    loop {
        if reader.buf.len() == reader.need {
            if reader.need == tpm::HEADER_SIZE {
                let total = tpm::frame_size(&reader.buf).expect("header is complete");
                if total < tpm::HEADER_SIZE || total > max_command_size {
                    *reader = FrameReader::new();
                    return ReadOutcome::BadLength(total);
                }
                if total > tpm::HEADER_SIZE {
                    reader.need = total;
                    continue;
                }
                // Header-only frame.
            }
            let frame = mem::take(&mut reader.buf);
            *reader = FrameReader::new();
            return ReadOutcome::Frame(frame);
        }

        let want = reader.need - reader.buf.len();
        let mut chunk = vec![0u8; want];
        match (&mut entry.session.command_stream()).read(&mut chunk) {
            Ok(0) => return ReadOutcome::Closed,
            Ok(len) => reader.buf.extend_from_slice(&chunk[..len]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return ReadOutcome::Error(e),
        }
    }
}
