//! Command-line interface: argument parsing and logging setup.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

/// Record from the microphone and play audio through one shared session.
#[derive(Parser, Debug)]
#[command(name = "audio_session")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Run against the simulated backend instead of ALSA
    #[arg(long, global = true)]
    pub simulated: bool,

    /// Where recordings are written (overrides config.toml)
    #[arg(long, global = true)]
    pub recordings_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Record until Ctrl+C or for a fixed time
    Record {
        #[arg(short, long)]
        seconds: Option<f64>,
    },
    /// Play a file path, file:// or http(s):// URL
    Play {
        source: String,
        #[arg(short, long, default_value_t = 1.0)]
        rate: f32,
    },
    /// Record while playing a clip
    Duplex {
        source: String,
    },
    /// Show sound cards and the active route
    Devices,
    /// List finished recordings, newest first
    List,
    /// Delete a recording
    Delete {
        path: PathBuf,
    },
}

impl Args {
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Info,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

/// Dependencies stay at `warn`; `RUST_LOG` overrides everything.
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(LevelFilter::Warn);
    builder.filter_module("audio_session", args.log_level());
    builder.parse_default_env();
    builder.format_timestamp_millis().init();
}
