//! Pluggable drivers that move opaque command buffers to a TPM and bring
//! its responses back.
//!
//! The broker thread owns the transport exclusively; the only cross-thread
//! surface is the [`TransportCancel`] handle, which interrupts whatever
//! command is currently on the device.

mod device;
mod echo;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use remain::sorted;
use thiserror::Error;

pub use device::{DeviceTransport, DEFAULT_TPM_DEVICE};
pub use echo::EchoTransport;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("transport does not support cancellation")]
    CancelUnsupported,
    #[error("invalid transport option {0:?}")]
    InvalidOption(String),
    #[error("transport I/O fault: {0}")]
    Io(io::Error),
    #[error("failed to open TPM device {path}: {err}")]
    OpenDevice { path: PathBuf, err: io::Error },
    #[error("unknown transport driver {0:?}")]
    UnknownDriver(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A driver for one TPM.
///
/// `send` ships a complete command buffer; `receive` blocks until the
/// response for the last sent command is available. The daemon never
/// overlaps commands: a second `send` only happens after the previous
/// `receive` returned. TPM-level failures are carried inside response
/// buffers and are not errors here; an `Err` means the transport itself is
/// broken and the daemon cannot continue.
pub trait TpmTransport: Send {
    fn send(&mut self, command: &[u8]) -> Result<()>;
    fn receive(&mut self) -> Result<Vec<u8>>;

    /// Applies `locality` to subsequent commands.
    fn set_locality(&mut self, locality: u8) -> Result<()>;

    /// Returns a handle other threads may use to interrupt the command
    /// currently on the device.
    fn cancel_handle(&self) -> Box<dyn TransportCancel>;
}

/// Cross-thread cancel control for a transport.
pub trait TransportCancel: Send + Sync {
    fn cancel(&self) -> Result<()>;
}

/// Splits raw `key=value` driver options.
pub fn parse_options(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|opt| {
            opt.split_once('=')
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .ok_or_else(|| Error::InvalidOption(opt.clone()))
        })
        .collect()
}

/// Builds the driver named by `driver`.
///
/// Construction touches the device, so a misconfigured transport fails
/// here, before any client traffic is accepted.
pub fn new_transport(
    driver: &str,
    options: &[(String, String)],
    max_command_size: usize,
) -> Result<Box<dyn TpmTransport>> {
    match driver {
        "device" => {
            let mut path = PathBuf::from(DEFAULT_TPM_DEVICE);
            let mut cancel_path = None;
            for (key, value) in options {
                match key.as_str() {
                    "path" => path = PathBuf::from(value),
                    "cancel" => cancel_path = Some(PathBuf::from(value)),
                    _ => return Err(Error::InvalidOption(format!("{}={}", key, value))),
                }
            }
            Ok(Box::new(DeviceTransport::new(
                &path,
                cancel_path,
                max_command_size,
            )?))
        }
        "echo" => {
            let mut delay = Duration::ZERO;
            for (key, value) in options {
                match key.as_str() {
                    "delay_ms" => {
                        let ms: u64 = value
                            .parse()
                            .map_err(|_| Error::InvalidOption(format!("{}={}", key, value)))?;
                        delay = Duration::from_millis(ms);
                    }
                    _ => return Err(Error::InvalidOption(format!("{}={}", key, value))),
                }
            }
            Ok(Box::new(EchoTransport::new(delay)))
        }
        other => Err(Error::UnknownDriver(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_split_on_first_equals() {
        let parsed =
            parse_options(&["path=/dev/tpm1".to_owned(), "cancel=/sys/x=y".to_owned()]).unwrap();
        assert_eq!(parsed[0], ("path".to_owned(), "/dev/tpm1".to_owned()));
        assert_eq!(parsed[1], ("cancel".to_owned(), "/sys/x=y".to_owned()));
    }

    #[test]
    fn bare_option_is_rejected() {
        assert!(matches!(
            parse_options(&["nodelay".to_owned()]),
            Err(Error::InvalidOption(_))
        ));
    }

    #[test]
    fn unknown_driver_is_rejected() {
        assert!(matches!(
            new_transport("simulator", &[], 4096),
            Err(Error::UnknownDriver(_))
        ));
    }
}
