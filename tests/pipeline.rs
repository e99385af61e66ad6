//! End-to-end tests: a full daemon with the echo transport, driven through
//! the control socket exactly as a client process would.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use sysio::{ScmSocket, UnixSeqpacket};
use tpm2_brokerd::config::Config;
use tpm2_brokerd::control::{ControlReply, ControlRequest, ErrorCode, RC_SUCCESS};
use tpm2_brokerd::daemon::Daemon;
use tpm2_brokerd::tpm;

// The 12-byte GetRandom command from the TPM2 spec examples.
const GET_RANDOM: [u8; 12] = [
    0x80, 0x01, 0x00, 0x00, 0x00, 0x0c, 0x00, 0x00, 0x01, 0x44, 0x00, 0x00,
];

fn echo_config(dir: &Path, options: &[(&str, &str)]) -> Config {
    Config {
        socket_path: dir.join("control.sock"),
        entropy_source: "/dev/urandom".into(),
        transport: "echo".to_owned(),
        transport_options: options
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        max_command_size: tpm::DEFAULT_MAX_COMMAND_SIZE,
        handle_signals: false,
    }
}

fn command_frame(payload: &[u8]) -> Vec<u8> {
    let total = tpm::HEADER_SIZE + payload.len();
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&tpm::TAG_NO_SESSIONS.to_be_bytes());
    buf.extend_from_slice(&(total as u32).to_be_bytes());
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(payload);
    buf
}

struct BrokerClient {
    conn: UnixSeqpacket,
}

struct ClientSession {
    id: u64,
    command: UnixStream,
    response: UnixStream,
}

impl BrokerClient {
    fn connect(path: &Path) -> BrokerClient {
        BrokerClient {
            conn: UnixSeqpacket::connect(path).expect("connect to control socket"),
        }
    }

    fn request(&self, request: &ControlRequest) -> (ControlReply, Vec<i32>) {
        let json = serde_json::to_vec(request).unwrap();
        self.conn.send(&json).unwrap();
        let mut buf = [0u8; 1024];
        let mut fds = [0i32; 8];
        let (len, fd_count) = self.conn.recv_with_fds(&mut buf, &mut fds).unwrap();
        assert!(len > 0, "control connection closed unexpectedly");
        let reply = serde_json::from_slice(&buf[..len]).unwrap();
        (reply, fds[..fd_count].to_vec())
    }

    fn create_session(&self) -> ClientSession {
        let (reply, fds) = self.request(&ControlRequest::CreateConnection);
        let session_id = match reply {
            ControlReply::Connection { session_id } => session_id,
            other => panic!("unexpected create reply: {:?}", other),
        };
        assert_eq!(fds.len(), 2, "expected command and response descriptors");
        // SAFETY: the reply transferred ownership of both descriptors.
        let (command, response) =
            unsafe { (UnixStream::from_raw_fd(fds[0]), UnixStream::from_raw_fd(fds[1])) };
        response
            .set_read_timeout(Some(Duration::from_secs(30)))
            .unwrap();
        ClientSession {
            id: session_id,
            command,
            response,
        }
    }

    fn cancel(&self, session_id: u64) -> ControlReply {
        self.request(&ControlRequest::Cancel { session_id }).0
    }

    fn set_locality(&self, session_id: u64, locality: u8) -> ControlReply {
        self.request(&ControlRequest::SetLocality {
            session_id,
            locality,
        })
        .0
    }
}

impl ClientSession {
    fn send(&mut self, frame: &[u8]) {
        self.command.write_all(frame).unwrap();
    }

    fn read_response(&mut self) -> Vec<u8> {
        let mut header = [0u8; tpm::HEADER_SIZE];
        self.response.read_exact(&mut header).unwrap();
        let total = tpm::frame_size(&header).unwrap();
        let mut frame = header.to_vec();
        frame.resize(total, 0);
        self.response.read_exact(&mut frame[tpm::HEADER_SIZE..]).unwrap();
        frame
    }

    /// Asserts no further bytes arrive within a grace period.
    fn assert_quiet(&mut self) {
        self.response
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut byte = [0u8; 1];
        match self.response.read(&mut byte) {
            Ok(0) => {}
            Ok(_) => panic!("unexpected extra response bytes"),
            Err(e) => assert!(
                matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
                "unexpected read error: {}",
                e
            ),
        }
    }
}

fn wait_for_empty_registry(daemon: &Daemon) {
    let registry = daemon.registry();
    let deadline = Instant::now() + Duration::from_secs(10);
    while !registry.is_empty() {
        assert!(Instant::now() < deadline, "registry never drained");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn single_session_echo_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(echo_config(dir.path(), &[])).unwrap();
    let client = BrokerClient::connect(&dir.path().join("control.sock"));

    let mut session = client.create_session();
    session.send(&GET_RANDOM);
    assert_eq!(session.read_response(), GET_RANDOM);

    drop(session);
    wait_for_empty_registry(&daemon);

    let shutdown = daemon.shutdown_handle().unwrap();
    shutdown.signal().unwrap();
    daemon.run_to_completion().unwrap();
}

#[test]
fn create_connection_races_initialization() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(echo_config(dir.path(), &[])).unwrap();
    // No settling delay on purpose: the handler must block on the barrier
    // if initialization is still running.
    let client = BrokerClient::connect(&dir.path().join("control.sock"));
    let mut session = client.create_session();
    session.send(&GET_RANDOM);
    assert_eq!(session.read_response(), GET_RANDOM);

    daemon.shutdown_handle().unwrap().signal().unwrap();
    daemon.run_to_completion().unwrap();
}

#[test]
fn sessions_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(echo_config(dir.path(), &[])).unwrap();
    let client = BrokerClient::connect(&dir.path().join("control.sock"));

    let mut slow = client.create_session();
    let mut fast = client.create_session();
    assert_ne!(slow.id, fast.id);

    let frame_y = command_frame(b"from-fast");
    fast.send(&frame_y);
    assert_eq!(fast.read_response(), frame_y);

    // The slow session only now submits; its traffic must appear on its own
    // endpoint and nowhere else.
    let frame_x = command_frame(b"from-slow");
    slow.send(&frame_x);
    assert_eq!(slow.read_response(), frame_x);

    fast.assert_quiet();
    slow.assert_quiet();

    daemon.shutdown_handle().unwrap().signal().unwrap();
    daemon.run_to_completion().unwrap();
}

#[test]
fn per_session_responses_stay_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(echo_config(dir.path(), &[])).unwrap();
    let client = BrokerClient::connect(&dir.path().join("control.sock"));

    let mut session = client.create_session();
    for i in 0..20u8 {
        session.send(&command_frame(&[i; 3]));
    }
    for i in 0..20u8 {
        assert_eq!(session.read_response(), command_frame(&[i; 3]));
    }

    daemon.shutdown_handle().unwrap().signal().unwrap();
    daemon.run_to_completion().unwrap();
}

#[test]
fn set_locality_validates_its_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(echo_config(dir.path(), &[])).unwrap();
    let client = BrokerClient::connect(&dir.path().join("control.sock"));

    let mut session = client.create_session();
    assert_eq!(
        client.set_locality(session.id, 3),
        ControlReply::Ok { rc: RC_SUCCESS }
    );
    assert_eq!(
        client.set_locality(session.id, 5),
        ControlReply::Error {
            code: ErrorCode::InvalidLocality
        }
    );
    assert_eq!(
        client.set_locality(session.id ^ 1, 0),
        ControlReply::Error {
            code: ErrorCode::UnknownSession
        }
    );

    // The session still works after a locality change.
    session.send(&GET_RANDOM);
    assert_eq!(session.read_response(), GET_RANDOM);

    daemon.shutdown_handle().unwrap().signal().unwrap();
    daemon.run_to_completion().unwrap();
}

#[test]
fn cancel_interrupts_an_executing_command() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(echo_config(dir.path(), &[("delay_ms", "1000")])).unwrap();
    let client = BrokerClient::connect(&dir.path().join("control.sock"));

    let mut session = client.create_session();
    let started = Instant::now();
    session.send(&GET_RANDOM);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(client.cancel(session.id), ControlReply::Ok { rc: RC_SUCCESS });

    let response = session.read_response();
    assert_eq!(response, tpm::cancelled_response());
    assert!(
        started.elapsed() < Duration::from_millis(900),
        "cancel did not interrupt the delay"
    );
    session.assert_quiet();

    daemon.shutdown_handle().unwrap().signal().unwrap();
    daemon.run_to_completion().unwrap();
}

#[test]
fn cancel_drops_a_queued_command() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(echo_config(dir.path(), &[("delay_ms", "500")])).unwrap();
    let client = BrokerClient::connect(&dir.path().join("control.sock"));

    let mut busy = client.create_session();
    let mut queued = client.create_session();

    // `busy` occupies the TPM; `queued`'s command sits in the broker queue.
    let busy_frame = command_frame(b"busy");
    busy.send(&busy_frame);
    thread::sleep(Duration::from_millis(100));
    queued.send(&command_frame(b"queued"));
    thread::sleep(Duration::from_millis(100));

    assert_eq!(client.cancel(queued.id), ControlReply::Ok { rc: RC_SUCCESS });

    // An echo transport returns the command itself, so a cancellation
    // response proves the queued command never reached it.
    assert_eq!(queued.read_response(), tpm::cancelled_response());
    assert_eq!(busy.read_response(), busy_frame);

    daemon.shutdown_handle().unwrap().signal().unwrap();
    daemon.run_to_completion().unwrap();
}

#[test]
fn cancel_with_nothing_outstanding_reports_it() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(echo_config(dir.path(), &[])).unwrap();
    let client = BrokerClient::connect(&dir.path().join("control.sock"));

    let mut session = client.create_session();
    assert_eq!(
        client.cancel(session.id),
        ControlReply::Error {
            code: ErrorCode::NothingToCancel
        }
    );
    assert_eq!(
        client.cancel(session.id ^ 1),
        ControlReply::Error {
            code: ErrorCode::UnknownSession
        }
    );

    // The session remains usable afterwards.
    session.send(&GET_RANDOM);
    assert_eq!(session.read_response(), GET_RANDOM);

    daemon.shutdown_handle().unwrap().signal().unwrap();
    daemon.run_to_completion().unwrap();
}

#[test]
fn oversized_frame_closes_only_that_session() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(echo_config(dir.path(), &[])).unwrap();
    let client = BrokerClient::connect(&dir.path().join("control.sock"));

    let mut offender = client.create_session();
    let mut bystander = client.create_session();

    let mut bad = command_frame(&[]);
    let claimed = (tpm::DEFAULT_MAX_COMMAND_SIZE + 1) as u32;
    bad[2..6].copy_from_slice(&claimed.to_be_bytes());
    offender.send(&bad);

    // The offender's endpoints close without a response.
    let mut buf = Vec::new();
    offender
        .response
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    assert_eq!(offender.response.read_to_end(&mut buf).unwrap(), 0);

    // The other session is untouched.
    bystander.send(&GET_RANDOM);
    assert_eq!(bystander.read_response(), GET_RANDOM);

    daemon.shutdown_handle().unwrap().signal().unwrap();
    daemon.run_to_completion().unwrap();
}

#[test]
fn max_sized_command_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(echo_config(dir.path(), &[])).unwrap();
    let client = BrokerClient::connect(&dir.path().join("control.sock"));

    let mut session = client.create_session();
    let frame = command_frame(&vec![0xa5; tpm::DEFAULT_MAX_COMMAND_SIZE - tpm::HEADER_SIZE]);
    session.send(&frame);
    assert_eq!(session.read_response(), frame);

    daemon.shutdown_handle().unwrap().signal().unwrap();
    daemon.run_to_completion().unwrap();
}

#[test]
fn many_parallel_sessions_drain_cleanly() {
    const SESSIONS: usize = 64;
    const FRAMES: usize = 100;

    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(echo_config(dir.path(), &[])).unwrap();
    let socket = dir.path().join("control.sock");

    let workers: Vec<_> = (0..SESSIONS)
        .map(|n| {
            let socket = socket.clone();
            thread::spawn(move || {
                let client = BrokerClient::connect(&socket);
                let mut session = client.create_session();
                for i in 0..FRAMES {
                    let payload = [(n as u8), (i as u8), 0x5a];
                    let frame = command_frame(&payload);
                    session.send(&frame);
                    assert_eq!(session.read_response(), frame, "session {} frame {}", n, i);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    wait_for_empty_registry(&daemon);

    daemon.shutdown_handle().unwrap().signal().unwrap();
    daemon.run_to_completion().unwrap();
}
