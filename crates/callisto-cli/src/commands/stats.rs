use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::Result;
use callisto_core::sequence::{LoadOptions, Sequence};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Args)]
pub struct StatsArgs {
    /// Sequence index file (.seq)
    pub file: PathBuf,

    /// Layer to compute statistics for
    #[arg(long, default_value = "0")]
    pub layer: usize,

    /// Open a CFA container as its raw mosaic
    #[arg(long)]
    pub raw_cfa: bool,
}

pub fn run(args: &StatsArgs) -> Result<()> {
    let opts = LoadOptions {
        demosaic: !args.raw_cfa,
        ..LoadOptions::default()
    };
    let mut seq = Sequence::load(&args.file, &opts)?;

    let pb = ProgressBar::new(seq.selected_count() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40}] {pos}/{len}")?
            .progress_chars("=> "),
    );
    pb.set_message("Computing statistics");

    let cancel = AtomicBool::new(false);
    let mut on_progress = |done: usize, _todo: usize| pb.set_position(done as u64);
    let computed = seq.compute_statistics_batch(args.layer, &cancel, Some(&mut on_progress))?;
    pb.finish_and_clear();

    seq.flush()?;

    if computed == 0 {
        println!("All statistics were already cached");
    } else {
        println!("Computed statistics for {computed} frame(s)");
    }

    for index in 0..seq.frame_count() {
        if let Some(s) = seq.cached_statistics(args.layer, index) {
            println!(
                "frame {index:>4}  mean {:.5}  median {:.5}  sigma {:.5}  noise {:.5}",
                s.mean, s.median, s.sigma, s.bg_noise
            );
        }
    }
    Ok(())
}
