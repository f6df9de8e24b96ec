use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "splitmux",
    version,
    about = "Split media streams into GOP-aligned fragment files"
)]
pub struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "SPLITMUX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Feed a generated test signal through the sink
    Run(RunArgs),

    /// Print the effective configuration
    Config,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct RunArgs {
    /// Fragment location pattern, e.g. `out/video%05d.raw`
    #[arg(short, long)]
    pub location: Option<String>,

    /// Maximum fragment duration in seconds
    #[arg(long)]
    pub max_size_time: Option<f64>,

    /// Maximum fragment size in bytes
    #[arg(long)]
    pub max_size_bytes: Option<u64>,

    /// Maximum fragment timecode distance, `HH:MM:SS:FF`
    #[arg(long)]
    pub max_size_timecode: Option<String>,

    /// Number of files kept before indices wrap
    #[arg(long)]
    pub max_files: Option<u32>,

    /// Index of the first fragment
    #[arg(long)]
    pub start_index: Option<u32>,

    /// Finalize fragments in the background
    #[arg(long)]
    pub async_finalize: bool,

    /// Length of the generated signal in seconds
    #[arg(short, long, default_value_t = 30.0)]
    pub duration: f64,

    /// GOP length in seconds
    #[arg(long, default_value_t = 1.0)]
    pub gop: f64,

    /// Video frame rate
    #[arg(long, default_value_t = 25)]
    pub fps: u32,

    /// Size of each video frame in bytes
    #[arg(long, default_value_t = 4096)]
    pub frame_size: usize,

    /// Also generate an audio stream with 20 ms frames
    #[arg(long)]
    pub audio: bool,
}
