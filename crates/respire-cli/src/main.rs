//! # respire - discrete-time respiratory neural network simulator
//!
//! Runs one network description to completion: cells, fibers, synapses with
//! conduction delays, Hebbian learning, and the mechanical lung model. Input
//! arrives as a run script naming a description file, or over a socket from
//! a launcher; output goes to event tables, binary archives, numbered plot
//! files, or a live viewer stream.

use clap::Parser;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod error;
mod run;
mod sockets;

use error::CliResult;

/// Discrete-time simulator for respiratory neural networks coupled to a
/// mechanical lung model
#[derive(Parser, Debug)]
#[command(
    name = "respire",
    version,
    about = "Discrete-time respiratory neural network simulator",
    long_about = "Runs one network description to completion and writes \
                  per-step voltages, spike events, and pooled analog \
                  signals to files or a connected viewer."
)]
pub struct Cli {
    /// Run script path; its directory becomes the input directory
    #[arg(long, value_name = "PATH")]
    pub script: Option<PathBuf>,

    /// Directory output files are written into
    #[arg(long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Launcher command port; enables the control channel
    #[arg(long, value_name = "N")]
    pub port: Option<u16>,

    /// Launcher and viewer host
    #[arg(long, value_name = "NAME", default_value = "localhost")]
    pub host: String,

    /// Write plot blocks as numbered files
    #[arg(long)]
    pub file: bool,

    /// Stream plot blocks to a connected viewer
    #[arg(long)]
    pub socket: bool,

    /// Write the bdt/edt event table
    #[arg(long)]
    pub bdt: bool,

    /// Write the binary spike archive
    #[arg(long)]
    pub smr: bool,

    /// Write the binary waveform archive
    #[arg(long)]
    pub wave: bool,

    /// Dump convergence/divergence CSVs before starting
    #[arg(long)]
    pub condi: bool,

    /// Verbose internal logging
    #[arg(long)]
    pub debug: bool,

    /// Quiet model: zero the noise and fold fiber probabilities into
    /// strengths
    #[arg(long)]
    pub nonoise: bool,
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    if let Err(err) = run::run(cli) {
        error!("run failed: {}", err);
        std::process::exit(1);
    }
    Ok(())
}
