use std::path::PathBuf;

use anyhow::Result;
use callisto_core::sequence::{LoadOptions, Sequence};
use clap::Args;

use crate::summary::print_sequence_summary;

#[derive(Args)]
pub struct InfoArgs {
    /// Sequence index file (.seq)
    pub file: PathBuf,

    /// Open a CFA container as its raw mosaic
    #[arg(long)]
    pub raw_cfa: bool,
}

pub fn run(args: &InfoArgs) -> Result<()> {
    let opts = LoadOptions {
        demosaic: !args.raw_cfa,
        ..LoadOptions::default()
    };
    let seq = Sequence::load(&args.file, &opts)?;

    print_sequence_summary(&seq);

    for layer in 0..seq.layer_count() {
        if let Some(records) = seq.registration(layer) {
            let measured = records.iter().filter(|r| r.is_set()).count();
            println!("Layer {layer}:     {measured}/{} frames registered", records.len());
        }
        let cached = (0..seq.frame_count())
            .filter(|&i| seq.cached_statistics(layer, i).is_some())
            .count();
        if cached > 0 {
            println!("             {cached} frames with cached statistics");
        }
    }

    println!("Reference:   frame {}", seq.reference_index());
    Ok(())
}
