//! The out-of-band session management surface.
//!
//! Clients connect to a seqpacket socket and exchange one JSON message per
//! packet. `CreateConnection` replies carry the two data-path descriptors
//! via `SCM_RIGHTS`. Handlers run on their own threads and wait on the
//! init barrier before touching anything, so the socket can start accepting
//! the moment the daemon launches.

use std::io::ErrorKind;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use log::{debug, error, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sysio::{Event, EventToken, ScmSocket, UnixSeqpacket, UnixSeqpacketListener, WaitContext};

use crate::barrier::{InitBarrier, PipelineHandles};
use crate::broker::CancelOutcome;
use crate::registry::Session;

/// Highest locality a TPM interface defines.
pub const MAX_LOCALITY: u8 = 4;

/// rc carried by successful `Ok` replies.
pub const RC_SUCCESS: u32 = 0;

/// How many times a fresh id is drawn before giving up on a collision
/// streak that, with 64-bit ids, should never happen.
const ID_RETRIES: usize = 8;

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    CreateConnection,
    Cancel { session_id: u64 },
    SetLocality { session_id: u64, locality: u8 },
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidLocality,
    InvalidRequest,
    NothingToCancel,
    ResourceExhausted,
    UnknownSession,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum ControlReply {
    /// The command and response descriptors ride the same packet as an
    /// `SCM_RIGHTS` control message, in that order.
    Connection { session_id: u64 },
    Ok { rc: u32 },
    Error { code: ErrorCode },
}

/// Resolves where the control socket lives: an explicit override, the
/// system location, or the invoking user's runtime directory.
pub fn socket_path(
    explicit: Option<PathBuf>,
    system: bool,
) -> std::result::Result<PathBuf, String> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    if system {
        return Ok(PathBuf::from("/run/tpm2-brokerd/control.sock"));
    }
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => Ok(Path::new(&dir).join("tpm2-brokerd.sock")),
        None => Err("XDG_RUNTIME_DIR is unset; pass --system or --socket-path".to_owned()),
    }
}

pub struct ControlPlane {
    listener: UnixSeqpacketListener,
    barrier: Arc<InitBarrier>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Token {
    Kill,
    Pending,
}

impl EventToken for Token {
    fn as_raw_token(&self) -> u64 {
        match self {
            Token::Kill => 0,
            Token::Pending => 1,
        }
    }

    fn from_raw_token(data: u64) -> Self {
        match data {
            0 => Token::Kill,
            _ => Token::Pending,
        }
    }
}

impl ControlPlane {
    /// Binds the control socket, replacing a stale one left by a previous
    /// run.
    pub fn bind(path: &Path, barrier: Arc<InitBarrier>) -> std::io::Result<ControlPlane> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!("removed stale control socket {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixSeqpacketListener::bind(path)?;
        Ok(ControlPlane { listener, barrier })
    }

    /// Accepts clients until `kill_evt` is signaled, one handler thread per
    /// connection.
    pub fn run(self, kill_evt: Event) {
        let wait_ctx: WaitContext<Token> = match WaitContext::build_with(&[
            (&kill_evt, Token::Kill),
            (&self.listener, Token::Pending),
        ]) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!("control plane failed to build wait context: {}", e);
                return;
            }
        };

        'accept: loop {
            let events = match wait_ctx.wait() {
                Ok(events) => events,
                Err(e) => {
                    error!("control plane wait failed: {}", e);
                    break;
                }
            };
            for event in events.iter() {
                match event.token {
                    Token::Kill => break 'accept,
                    Token::Pending => {
                        let conn = match self.listener.accept() {
                            Ok(conn) => conn,
                            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                            Err(e) => {
                                warn!("control accept failed: {}", e);
                                continue;
                            }
                        };
                        let barrier = self.barrier.clone();
                        let spawned = thread::Builder::new()
                            .name("control_client".to_owned())
                            .spawn(move || serve_client(conn, barrier));
                        if let Err(e) = spawned {
                            warn!("failed to spawn control handler: {}", e);
                        }
                    }
                }
            }
        }
        debug!("control plane exiting");
    }
}

/// Serves one client connection until it disconnects.
fn serve_client(conn: UnixSeqpacket, barrier: Arc<InitBarrier>) {
    loop {
        let packet = match conn.recv_as_vec() {
            Ok(packet) if packet.is_empty() => return,
            Ok(packet) => packet,
            Err(e) => {
                warn!("control recv failed: {}", e);
                return;
            }
        };

        let (reply, streams) = match serde_json::from_slice::<ControlRequest>(&packet) {
            Ok(request) => {
                // Initialization must have finished before the registry or
                // broker are touched.
                let handles = barrier.wait();
                handle_request(request, &handles)
            }
            Err(e) => {
                warn!("malformed control request: {}", e);
                (
                    ControlReply::Error {
                        code: ErrorCode::InvalidRequest,
                    },
                    Vec::new(),
                )
            }
        };

        let json = match serde_json::to_vec(&reply) {
            Ok(json) => json,
            Err(e) => {
                error!("failed to serialize control reply: {}", e);
                return;
            }
        };
        let fds: Vec<_> = streams.iter().map(|s| s.as_raw_fd()).collect();
        if let Err(e) = conn.send_with_fds(&json, &fds) {
            warn!("control reply send failed: {}", e);
            return;
        }
        // The client received kernel-duplicated descriptors; our copies in
        // `streams` drop here.
    }
}

fn handle_request(
    request: ControlRequest,
    handles: &PipelineHandles,
) -> (ControlReply, Vec<std::os::unix::net::UnixStream>) {
    match request {
        ControlRequest::CreateConnection => create_connection(handles),
        ControlRequest::Cancel { session_id } => {
            let reply = match handles.registry.lookup_by_id(session_id) {
                Ok(session) => match handles.broker.cancel(&session) {
                    CancelOutcome::Cancelled => ControlReply::Ok { rc: RC_SUCCESS },
                    CancelOutcome::NothingToCancel => ControlReply::Error {
                        code: ErrorCode::NothingToCancel,
                    },
                },
                Err(_) => ControlReply::Error {
                    code: ErrorCode::UnknownSession,
                },
            };
            (reply, Vec::new())
        }
        ControlRequest::SetLocality {
            session_id,
            locality,
        } => {
            let reply = if locality > MAX_LOCALITY {
                ControlReply::Error {
                    code: ErrorCode::InvalidLocality,
                }
            } else {
                match handles.registry.lookup_by_id(session_id) {
                    Ok(session) => {
                        // Takes effect on the next command dispatched for
                        // this session, never on one already in flight.
                        session.state().locality = locality;
                        ControlReply::Ok { rc: RC_SUCCESS }
                    }
                    Err(_) => ControlReply::Error {
                        code: ErrorCode::UnknownSession,
                    },
                }
            };
            (reply, Vec::new())
        }
    }
}

fn create_connection(
    handles: &PipelineHandles,
) -> (ControlReply, Vec<std::os::unix::net::UnixStream>) {
    for _ in 0..ID_RETRIES {
        let id = handles.rng.lock().next_u64();
        let (session, client_command, client_response) = match Session::new(id) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("failed to allocate session sockets: {}", e);
                return (
                    ControlReply::Error {
                        code: ErrorCode::ResourceExhausted,
                    },
                    Vec::new(),
                );
            }
        };
        if handles.registry.insert(session).is_err() {
            // Freshly drawn id collided with a live session; draw again.
            continue;
        }
        if let Err(e) = handles.wakeup.signal() {
            error!("failed to wake the command source: {}", e);
        }
        debug!("created session {:#x}", id);
        return (
            ControlReply::Connection { session_id: id },
            vec![client_command, client_response],
        );
    }
    (
        ControlReply::Error {
            code: ErrorCode::ResourceExhausted,
        },
        Vec::new(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_trip_through_json() {
        let requests = [
            ControlRequest::CreateConnection,
            ControlRequest::Cancel { session_id: 42 },
            ControlRequest::SetLocality {
                session_id: 42,
                locality: 3,
            },
        ];
        for request in requests {
            let json = serde_json::to_vec(&request).unwrap();
            let back: ControlRequest = serde_json::from_slice(&json).unwrap();
            assert_eq!(back, request);
        }
    }

    #[test]
    fn replies_round_trip_through_json() {
        let replies = [
            ControlReply::Connection { session_id: 1 },
            ControlReply::Ok { rc: RC_SUCCESS },
            ControlReply::Error {
                code: ErrorCode::NothingToCancel,
            },
        ];
        for reply in replies {
            let json = serde_json::to_vec(&reply).unwrap();
            let back: ControlReply = serde_json::from_slice(&json).unwrap();
            assert_eq!(back, reply);
        }
    }

    #[test]
    fn explicit_socket_path_wins() {
        let path = socket_path(Some(PathBuf::from("/tmp/x.sock")), true).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/x.sock"));
    }

    #[test]
    fn system_placement_uses_run() {
        let path = socket_path(None, true).unwrap();
        assert_eq!(path, PathBuf::from("/run/tpm2-brokerd/control.sock"));
    }
}
