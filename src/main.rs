use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};

use flare::inspect;

#[derive(Debug, Parser)]
#[command(name = "flare", about = "Inspect flare recording files")]
struct Command {
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Print the chunk headers of a recording
    #[clap(name = "info")]
    Info(InfoOpts),
    /// Check the structural invariants of a finished recording
    #[clap(name = "validate")]
    Validate(ValidateOpts),
}

#[derive(Debug, Args)]
struct InfoOpts {
    file: PathBuf,
}

#[derive(Debug, Args)]
struct ValidateOpts {
    file: PathBuf,
}

fn info(opts: InfoOpts) -> Result<()> {
    let chunks = inspect::read_chunks(&opts.file)?;
    println!(
        "{}: {} chunk(s), {} bytes",
        opts.file.display(),
        chunks.len(),
        chunks.iter().map(|c| c.chunk_size).sum::<u64>()
    );
    for (i, chunk) in chunks.iter().enumerate() {
        println!(
            "chunk {i}: offset={} size={} v{}.{} cpool@{} start={}ns duration={}ns ticks/s={}",
            chunk.offset,
            chunk.chunk_size,
            chunk.major,
            chunk.minor,
            chunk.cpool_offset,
            chunk.start_time_ns,
            chunk.duration_ns,
            chunk.ticks_per_sec,
        );
    }
    Ok(())
}

fn validate(opts: ValidateOpts) -> Result<()> {
    let problems = inspect::validate(&opts.file)?;
    if problems.is_empty() {
        println!("{}: ok", opts.file.display());
        Ok(())
    } else {
        for problem in &problems {
            eprintln!("{}: {problem}", opts.file.display());
        }
        bail!("{} problem(s) found", problems.len());
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let opts = Command::parse();

    match opts.subcmd {
        SubCommand::Info(opts) => info(opts),
        SubCommand::Validate(opts) => validate(opts),
    }
}
