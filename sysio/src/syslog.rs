//! Logger setup for the daemon: env_logger writing either to stdout or to
//! the system logger at `/dev/log`.
//!
//! The syslog path formats each record as an RFC 3164 line and sends it as
//! one datagram; the kernel-side socket does the rest.

use std::io::{self, ErrorKind, Write};
use std::mem;
use std::os::unix::net::UnixDatagram;
use std::str::FromStr;

use remain::sorted;
use thiserror::Error;

const SYSLOG_PATH: &str = "/dev/log";

// LOG_DAEMON from syslog(3).
const FACILITY_DAEMON: u8 = 3 << 3;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to connect to {SYSLOG_PATH}: {0}")]
    Connect(io::Error),
    #[error("logger already initialized: {0}")]
    SetLogger(log::SetLoggerError),
    #[error("unknown logger {0:?}, expected stdout or syslog")]
    UnknownLogger(String),
}

/// Which sink log records go to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoggerKind {
    Stdout,
    Syslog,
}

impl FromStr for LoggerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<LoggerKind, Error> {
        match s {
            "stdout" => Ok(LoggerKind::Stdout),
            "syslog" => Ok(LoggerKind::Syslog),
            other => Err(Error::UnknownLogger(other.to_owned())),
        }
    }
}

struct SyslogSocket {
    socket: UnixDatagram,
}

impl Write for SyslogSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        const SEND_RETRY: usize = 2;

        for _ in 0..SEND_RETRY {
            match self.socket.send(buf) {
                Ok(len) => return Ok(len),
                Err(e) => match e.kind() {
                    ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected => {
                        if self.socket.connect(SYSLOG_PATH).is_err() {
                            break;
                        }
                    }
                    _ => break,
                },
            }
        }
        // Logging must never take the daemon down; a lost record is the
        // lesser failure.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn priority(level: log::Level) -> u8 {
    match level {
        log::Level::Error => 3,
        log::Level::Warn => 4,
        log::Level::Info => 6,
        log::Level::Debug | log::Level::Trace => 7,
    }
}

fn local_time() -> libc::tm {
    // SAFETY: tm is plain data, and both calls only write through the valid
    // pointers they are given.
    unsafe {
        let mut now: libc::time_t = 0;
        libc::time(&mut now);
        let mut tm: libc::tm = mem::zeroed();
        libc::localtime_r(&now, &mut tm);
        tm
    }
}

/// Initializes the process-global logger.
///
/// `filter` is an env_logger filter string ("info", "debug", a module
/// filter list, ...); `proc_name` is the tag syslog records carry.
pub fn init(kind: LoggerKind, filter: &str, proc_name: &str) -> Result<(), Error> {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(filter);

    match kind {
        LoggerKind::Stdout => {
            builder.target(env_logger::Target::Stdout);
        }
        LoggerKind::Syslog => {
            const MONTHS: [&str; 12] = [
                "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
            ];

            let socket = UnixDatagram::unbound().map_err(Error::Connect)?;
            socket.connect(SYSLOG_PATH).map_err(Error::Connect)?;
            builder.target(env_logger::Target::Pipe(Box::new(SyslogSocket { socket })));

            let tag = proc_name.to_owned();
            builder.format(move |buf, record| {
                let tm = local_time();
                let prifac = priority(record.level()) | FACILITY_DAEMON;
                write!(
                    buf,
                    "<{}>{} {:2} {:02}:{:02}:{:02} {}[{}]: ",
                    prifac,
                    MONTHS[tm.tm_mon as usize],
                    tm.tm_mday,
                    tm.tm_hour,
                    tm.tm_min,
                    tm.tm_sec,
                    tag,
                    std::process::id(),
                )?;
                writeln!(buf, "{}", record.args())
            });
            // env_logger batches writes to Pipe targets unless test mode is
            // set; syslog needs exactly one datagram per record.
            builder.is_test(true);
        }
    }

    builder.try_init().map_err(Error::SetLogger)
}
