//! playerd: a headless test driver for the ALSA output backend.
//!
//! Plays a test tone through the full output path: device probe and
//! negotiation, the realtime output worker, software or hardware volume.
//! Controlled over stdin (`on`, `stop`, `off`, `vol <0-100>`, `quit`).

mod cli;
mod config;
mod runtime;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,alsa_output=info")),
        )
        .init();

    if args.list_devices {
        alsa_output::device::list_devices()?;
        return Ok(());
    }
    if args.list_mixers {
        alsa_output::mixer::list_mixers(&args.device)?;
        return Ok(());
    }

    runtime::run(args.player_config()?)
}
