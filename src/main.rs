use anyhow::{anyhow, Result};
use log::info;
use sysio::syslog::{self, LoggerKind};

use tpm2_brokerd::config::{Args, Config};
use tpm2_brokerd::daemon;

fn main() -> Result<()> {
    let args: Args = argh::from_env();

    let logger: LoggerKind = args.logger.parse()?;
    syslog::init(logger, &args.log_level, "tpm2-brokerd")
        .map_err(|e| anyhow!("failed to initialize logger: {}", e))?;

    let cfg = Config::from_args(&args)?;
    info!("tpm2-brokerd starting");
    daemon::run(cfg)
}
