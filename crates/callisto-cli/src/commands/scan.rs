use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use callisto_core::scan::{scan_directory, ScanOptions};
use clap::Args;

use crate::summary::print_sequence_summary;

#[derive(Args)]
pub struct ScanArgs {
    /// Directory to scan
    pub dir: PathBuf,

    /// Extension of one-file-per-frame images
    #[arg(long, default_value = callisto_core::consts::DEFAULT_IMAGE_EXT)]
    pub ext: String,

    /// Only list candidates, do not write sequence index files
    #[arg(long)]
    pub dry_run: bool,

    /// Open CFA containers as their raw mosaic instead of demosaicing
    #[arg(long)]
    pub raw_cfa: bool,

    /// Load scan options from a TOML file (command-line flags win)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

pub fn run(args: &ScanArgs) -> Result<()> {
    let mut opts = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            toml::from_str::<ScanOptions>(&text)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        }
        None => ScanOptions::default(),
    };
    opts.image_ext = args.ext.clone();
    if args.dry_run {
        opts.write_seqfiles = false;
    }
    if args.raw_cfa {
        opts.demosaic = false;
    }

    let cancel = AtomicBool::new(false);
    let sequences = scan_directory(&args.dir, &opts, None, &cancel)
        .with_context(|| format!("Failed to scan {}", args.dir.display()))?;

    if sequences.is_empty() {
        println!("No sequences found in {}", args.dir.display());
        return Ok(());
    }

    for seq in &sequences {
        print_sequence_summary(seq);
    }
    println!(
        "{} sequence(s) found{}",
        sequences.len(),
        if args.dry_run { " (dry run)" } else { "" }
    );
    Ok(())
}
