//! Command line argument parsing

use crate::config::Config;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Timer-driven virtual HID keyboard
#[derive(Parser, Debug)]
#[command(name = "virtual-keyboard", version)]
#[command(about = "Emulated keyboard that presses and releases one key on a fixed cadence")]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the device and run the press/release cycle
    Run(RunArgs),
    /// Print the report descriptor
    Describe,
    /// Write the default configuration file
    InitConfig {
        /// Config file to write instead of the default location
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Config file to load instead of the default location
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Use the in-memory transport instead of a real HID device
    #[arg(long)]
    pub dry_run: bool,

    /// Write a JSON run summary to this path
    #[arg(long)]
    pub summary: Option<PathBuf>,

    /// Delay before the first press (ms)
    #[arg(long)]
    pub initial_delay_ms: Option<u64>,

    /// Interval between presses (ms)
    #[arg(long)]
    pub period_ms: Option<u64>,

    /// How long the key is held (ms)
    #[arg(long)]
    pub release_delay_ms: Option<u64>,

    /// Number of press/release cycles
    #[arg(long)]
    pub cycles: Option<u32>,
}

impl RunArgs {
    /// Apply command line overrides on top of a loaded config
    pub fn apply(&self, config: &mut Config) {
        let cadence = &mut config.cadence;
        if let Some(ms) = self.initial_delay_ms {
            cadence.initial_delay_ms = ms;
        }
        if let Some(ms) = self.period_ms {
            cadence.period_ms = ms;
        }
        if let Some(ms) = self.release_delay_ms {
            cadence.release_delay_ms = ms;
        }
        if let Some(cycles) = self.cycles {
            cadence.cycle_limit = cycles;
        }
    }
}

/// Default log filter for a `-v` count
pub fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}
