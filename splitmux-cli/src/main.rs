mod cli;
mod config;
mod synth;

use std::process;

use anyhow::Result;
use clap::Parser;
use tracing::{Level, error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::{
    cli::{Args, Commands},
    config::AppConfig,
};

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        error!("Application error: {:#}", e);
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet);

    let mut config = AppConfig::load(args.config.as_deref())?;

    match args.command {
        Commands::Run(run) => {
            config.apply(&run);
            info!(location = ?config.sink.location, "Starting");
            let fragments = synth::run(config.sink, &run)?;
            for fragment in &fragments {
                let location = fragment
                    .location
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".to_string());
                let duration = fragment
                    .duration
                    .map(|d| format!("{:.3}s", d.seconds_f64()))
                    .unwrap_or_else(|| "?".to_string());
                println!("{:>5}  {duration:>10}  {location}", fragment.id);
            }
            println!("{} fragment(s) written", fragments.len());
        }
        Commands::Config => {
            print!("{}", config.show()?);
        }
    }
    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}
