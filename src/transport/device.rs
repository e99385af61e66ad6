use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use log::debug;

use super::{Error, Result, TpmTransport, TransportCancel};

pub const DEFAULT_TPM_DEVICE: &str = "/dev/tpm0";

/// Driver for a kernel TPM character device.
///
/// One write submits a command, the next read yields the full response.
/// Cancellation goes through the driver's sysfs `cancel` attribute when the
/// operator supplies its path; the kernel interface offers no locality
/// control, so `set_locality` is accepted and ignored.
pub struct DeviceTransport {
    file: File,
    cancel_path: Option<PathBuf>,
    max_response_size: usize,
}

impl DeviceTransport {
    pub fn new(
        path: &Path,
        cancel_path: Option<PathBuf>,
        max_response_size: usize,
    ) -> Result<DeviceTransport> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| Error::OpenDevice {
                path: path.to_owned(),
                err,
            })?;
        Ok(DeviceTransport {
            file,
            cancel_path,
            max_response_size,
        })
    }
}

impl TpmTransport for DeviceTransport {
    fn send(&mut self, command: &[u8]) -> Result<()> {
        self.file.write_all(command).map_err(Error::Io)
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.max_response_size];
        loop {
            match self.file.read(&mut buf) {
                Ok(0) => {
                    return Err(Error::Io(ErrorKind::UnexpectedEof.into()));
                }
                Ok(len) => {
                    buf.truncate(len);
                    return Ok(buf);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn set_locality(&mut self, locality: u8) -> Result<()> {
        // The character device always issues commands at locality 0.
        debug!("tpm device ignores locality change to {}", locality);
        Ok(())
    }

    fn cancel_handle(&self) -> Box<dyn TransportCancel> {
        Box::new(DeviceCancel {
            path: self.cancel_path.clone(),
        })
    }
}

struct DeviceCancel {
    path: Option<PathBuf>,
}

impl TransportCancel for DeviceCancel {
    fn cancel(&self) -> Result<()> {
        match &self.path {
            Some(path) => fs::write(path, b"1").map_err(Error::Io),
            None => Err(Error::CancelUnsupported),
        }
    }
}
