use std::collections::HashMap;
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, MutexGuard};

use remain::sorted;
use sysio::sync::Mutex;
use sysio::RawDescriptor;
use thiserror::Error;

#[sorted]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("session id {0:#x} already registered")]
    DuplicateId(u64),
    #[error("no session reads from the given endpoint")]
    UnknownEndpoint,
    #[error("no session with id {0:#x}")]
    UnknownId(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where a session's single tracked command currently is, if anywhere.
///
/// Cancel arbitration keys off this: a queued command can still be dropped
/// before it reaches the TPM, an executing one can only be interrupted
/// through the transport.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PendingCommand {
    None,
    /// Accepted by the command source, waiting in the broker's input queue.
    Queued { cancel: bool },
    /// Handed to the TPM transport.
    Executing,
}

/// The session fields the control plane may touch, guarded by the
/// per-session lock.
#[derive(Debug)]
pub struct SessionState {
    pub locality: u8,
    pub pending: PendingCommand,
}

/// One client's binding to the broker: a durable unpredictable id, the
/// server ends of the two data-path sockets, and the mutable control-plane
/// fields.
///
/// The id never changes once the session is in the registry. The endpoint
/// streams are used exclusively by the pipeline threads; the control plane
/// only ever reads or writes `SessionState`, under [`Session::state`].
#[derive(Debug)]
pub struct Session {
    id: u64,
    command_stream: UnixStream,
    response_stream: UnixStream,
    state: Mutex<SessionState>,
}

impl Session {
    /// Creates a session and the client halves of its data-path sockets.
    ///
    /// Returns `(session, client_command, client_response)`; the client
    /// halves are handed to the requesting process over the control plane.
    /// The server command half is nonblocking so the command source's
    /// readiness loop can never be wedged by a slow client.
    pub fn new(id: u64) -> io::Result<(Session, UnixStream, UnixStream)> {
        let (client_command, command_stream) = UnixStream::pair()?;
        let (response_stream, client_response) = UnixStream::pair()?;
        command_stream.set_nonblocking(true)?;
        Ok((
            Session {
                id,
                command_stream,
                response_stream,
                state: Mutex::new(SessionState {
                    locality: 0,
                    pending: PendingCommand::None,
                }),
            },
            client_command,
            client_response,
        ))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn command_stream(&self) -> &UnixStream {
        &self.command_stream
    }

    pub fn response_stream(&self) -> &UnixStream {
        &self.response_stream
    }

    /// Locks and returns the mutable session state.
    pub fn state(&self) -> MutexGuard<SessionState> {
        self.state.lock()
    }
}

/// Thread-safe map of live sessions.
///
/// The internal lock protects the mapping only; per-session mutable state
/// has its own lock and endpoint I/O is synchronized by pipeline structure,
/// not by the registry.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry::default()
    }

    /// Adds `session`, rejecting a duplicate id.
    pub fn insert(&self, session: Session) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&session.id) {
            return Err(Error::DuplicateId(session.id));
        }
        let session = Arc::new(session);
        sessions.insert(session.id, session.clone());
        Ok(session)
    }

    pub fn lookup_by_id(&self, id: u64) -> Result<Arc<Session>> {
        self.sessions
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownId(id))
    }

    /// Resolves the session whose command endpoint is `fd`. Used by the
    /// command source to map a readiness event back to its session.
    pub fn lookup_by_command_fd(&self, fd: RawDescriptor) -> Result<Arc<Session>> {
        self.sessions
            .lock()
            .values()
            .find(|s| s.command_stream.as_raw_fd() == fd)
            .cloned()
            .ok_or(Error::UnknownEndpoint)
    }

    /// Atomically removes the session; the caller becomes responsible for
    /// the endpoints' fate.
    pub fn remove(&self, id: u64) -> Result<Arc<Session>> {
        self.sessions
            .lock()
            .remove(&id)
            .ok_or(Error::UnknownId(id))
    }

    /// Point-in-time snapshot of `(id, command endpoint fd)` pairs, used to
    /// rebuild the command source's watch set after a wakeup.
    pub fn iter_endpoints(&self) -> Vec<(u64, RawDescriptor)> {
        self.sessions
            .lock()
            .values()
            .map(|s| (s.id, s.command_stream.as_raw_fd()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every session at once. Shutdown only.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().drain().map(|(_, s)| s).collect()
    }
}
