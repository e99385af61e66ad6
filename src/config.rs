use std::path::PathBuf;

use anyhow::{anyhow, Result};
use argh::FromArgs;

use crate::control;
use crate::tpm;
use crate::transport;

/// TPM2 access broker daemon: multiplexes local clients onto one TPM.
#[derive(FromArgs, Debug)]
pub struct Args {
    /// logger backend, stdout or syslog (default: stdout)
    #[argh(option, default = "String::from(\"stdout\")")]
    pub logger: String,

    /// log level filter (default: info)
    #[argh(option, default = "String::from(\"info\")")]
    pub log_level: String,

    /// place the control socket in the system location instead of the
    /// user's runtime directory
    #[argh(switch)]
    pub system: bool,

    /// control socket path, overriding the placement selector
    #[argh(option)]
    pub socket_path: Option<PathBuf>,

    /// entropy source seeding session-id generation (default: /dev/urandom)
    #[argh(option, default = "PathBuf::from(\"/dev/urandom\")")]
    pub entropy_source: PathBuf,

    /// TPM transport driver, device or echo (default: device)
    #[argh(option, default = "String::from(\"device\")")]
    pub transport: String,

    /// driver-specific key=value option, repeatable
    #[argh(option)]
    pub transport_option: Vec<String>,

    /// maximum accepted TPM command size in bytes (default: 4096)
    #[argh(option, default = "tpm::DEFAULT_MAX_COMMAND_SIZE")]
    pub max_command_size: usize,
}

/// Validated daemon configuration.
pub struct Config {
    pub socket_path: PathBuf,
    pub entropy_source: PathBuf,
    pub transport: String,
    pub transport_options: Vec<(String, String)>,
    pub max_command_size: usize,
    /// Install SIGINT/SIGTERM handlers. Tests drive shutdown directly and
    /// leave this off.
    pub handle_signals: bool,
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Config> {
        let socket_path =
            control::socket_path(args.socket_path.clone(), args.system).map_err(|e| anyhow!(e))?;
        let transport_options = transport::parse_options(&args.transport_option)?;
        if args.max_command_size < tpm::HEADER_SIZE {
            return Err(anyhow!(
                "--max-command-size must be at least the {} byte header",
                tpm::HEADER_SIZE
            ));
        }
        Ok(Config {
            socket_path,
            entropy_source: args.entropy_source.clone(),
            transport: args.transport.clone(),
            transport_options,
            max_command_size: args.max_command_size,
            handle_signals: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::from_args(&["tpm2-brokerd"], args).expect("args parse")
    }

    #[test]
    fn defaults_are_sane() {
        let args = parse(&[]);
        assert_eq!(args.logger, "stdout");
        assert_eq!(args.transport, "device");
        assert_eq!(args.max_command_size, tpm::DEFAULT_MAX_COMMAND_SIZE);
        assert_eq!(args.entropy_source, PathBuf::from("/dev/urandom"));
    }

    #[test]
    fn transport_options_collect() {
        let args = parse(&[
            "--transport",
            "echo",
            "--transport-option",
            "delay_ms=50",
            "--socket-path",
            "/tmp/t.sock",
        ]);
        let cfg = Config::from_args(&args).unwrap();
        assert_eq!(cfg.transport, "echo");
        assert_eq!(
            cfg.transport_options,
            vec![("delay_ms".to_owned(), "50".to_owned())]
        );
    }

    #[test]
    fn tiny_max_command_size_is_rejected() {
        let args = parse(&["--max-command-size", "4", "--socket-path", "/tmp/t.sock"]);
        assert!(Config::from_args(&args).is_err());
    }
}
