//! Convert Linux `perf sched` recordings to Chrome Trace Event format.
//!
//! Run as: `schedtrace <input-archive> <output-json>`

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use schedtrace::input::{convert, ConvertOptions};

#[derive(Debug, Parser)]
#[command(name = "schedtrace")]
#[command(about = "Convert collected `perf sched` data to Chrome Trace Event format")]
#[command(version)]
struct Command {
    /// perf data input archive (tar or tar.gz)
    input: PathBuf,
    /// JSON output file
    output: PathBuf,
    /// Number of seconds of data to skip
    #[arg(short, long, default_value_t = 0.0)]
    skip: f64,
    /// Number of seconds of data to process (0 processes everything)
    #[arg(short, long, default_value_t = 0.0)]
    duration: f64,
    /// Threshold (in ms) for tasks to appear in the waiting track
    #[arg(short, long, default_value_t = 3.0)]
    wait: f64,
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let opts = Command::parse();
    init_tracing(opts.verbose);

    let events = convert(
        &opts.input,
        &ConvertOptions {
            skip: opts.skip,
            duration: opts.duration,
            wait: opts.wait,
        },
    )?;

    let file = File::create(&opts.output)
        .with_context(|| format!("creating {}", opts.output.display()))?;
    serde_json::to_writer(BufWriter::new(file), &events).context("writing output document")?;
    Ok(())
}
