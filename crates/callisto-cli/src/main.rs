mod commands;
mod summary;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "callisto", about = "Astronomical frame sequence manager")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover sequences in a directory and write their index files
    Scan(commands::scan::ScanArgs),
    /// Show a sequence's index, registration and statistics summary
    Info(commands::info::InfoArgs),
    /// Compute and cache per-frame statistics for a sequence
    Stats(commands::stats::StatsArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &cli.command {
        Commands::Scan(args) => commands::scan::run(args),
        Commands::Info(args) => commands::info::run(args),
        Commands::Stats(args) => commands::stats::run(args),
    }
}
