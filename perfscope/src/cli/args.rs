//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "perfscope",
    about = "Measure per-method latency of a running program without recompiling it",
    after_help = "\
EXAMPLES:
    perfscope --list-modes                       Show the built-in profile modes
    perfscope --mode Pawns --duration 5          Profile pawn ticks for five seconds
    perfscope --mode Frame --export hist.csv     Save every key's history as CSV
    perfscope --mode Pawns --stats World.Tick    Print statistics for one key on exit"
)]
pub struct Args {
    /// Profile mode to activate
    #[arg(short, long, default_value = "Frame")]
    pub mode: String,

    /// Stop after N seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Log refresh interval in milliseconds (overrides the config file)
    #[arg(long, value_name = "MS")]
    pub interval: Option<u64>,

    /// Samples kept per key (overrides the config file)
    #[arg(long)]
    pub capacity: Option<usize>,

    /// Number of pawns in the simulated world
    #[arg(long, default_value = "24")]
    pub pawns: usize,

    /// Export every key's history as a headerless CSV table
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Write a JSON session report
    #[arg(long, value_name = "FILE")]
    pub json: Option<PathBuf>,

    /// Print history statistics for this key on exit
    #[arg(long, value_name = "KEY")]
    pub stats: Option<String>,

    /// Also rewrite the calls inside this method (Declaring.Member)
    #[arg(long, value_name = "TARGET")]
    pub rewrite: Option<String>,

    /// Turn the kill switch on (skips music updates in KillMusic mode)
    #[arg(long)]
    pub kill: bool,

    /// Engine config file (JSON)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// List the available modes and exit
    #[arg(long)]
    pub list_modes: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}
