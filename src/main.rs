//! `chunk-recover` CLI entry point.

use chunk_recover_core::control::{recover, RecoverConfig};
use chunk_recover_core::error::RecoverError;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

/// Recover a chunk tree that was lost or corrupted, given the surrounding
/// metadata still present on disk.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Params {
    /// path to one member device of the filesystem to recover
    #[clap(required = true)]
    device: PathBuf,

    /// skip the destructive-write confirmation prompt
    #[clap(short = 'y', long = "yes")]
    assume_yes: bool,

    /// verbose logging
    #[clap(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Params::parse();

    if args.verbose && std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    let cfg = RecoverConfig {
        device: args.device,
        assume_yes: args.assume_yes,
        check_device_extents: true,
    };

    match recover(&cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RecoverError::Aborted) => {
            log::info!("aborted by operator");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("chunk-recover: {e}");
            ExitCode::FAILURE
        }
    }
}
