//! Directory scan: classify entries into containers and numbered image
//! groups, and synthesize sequences from the candidates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::consts::{DEFAULT_IMAGE_EXT, FILM_EXTENSIONS, SEQFILE_EXT, SER_EXTENSION};
use crate::error::Result;
use crate::frame::FrameEntry;
use crate::sequence::{FilmOpener, Sequence};
use crate::source::{FilmSource, FrameSource, RegularSource, SerContainer};

/// Scan configuration. Serializable so front-ends can keep it in their
/// config files.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Extension of one-file-per-frame images to look for.
    pub image_ext: String,
    /// Persist a sidecar for every synthesized sequence.
    pub write_seqfiles: bool,
    /// Open CFA containers demosaiced.
    pub demosaic: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            image_ext: DEFAULT_IMAGE_EXT.to_string(),
            write_seqfiles: true,
            demosaic: true,
        }
    }
}

/// A group of numbered image files sharing a basename.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumberedCandidate {
    pub basename: String,
    pub begin: i32,
    pub end: i32,
    pub fixed_len: usize,
    pub filenums: Vec<i32>,
}

/// Split a file stem into `(basename, index, padding width)`.
///
/// The padding width is the digit count when the index is written with a
/// leading zero, 1 otherwise (an unpadded index of any magnitude prints
/// back identically through a width-1 format).
pub fn split_numbered_name(stem: &str) -> Option<(&str, i32, usize)> {
    let digits_start = stem
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|p| p + 1)
        .unwrap_or(0);
    let digits = &stem[digits_start..];
    if digits.is_empty() || digits.len() > 9 {
        return None;
    }
    let index: i32 = digits.parse().ok()?;
    let fixed_len = if digits.starts_with('0') && digits.len() > 1 {
        digits.len()
    } else {
        1
    };
    Some((&stem[..digits_start], index, fixed_len))
}

/// Scan a directory for sequences.
///
/// Entries are classified by extension into SER containers, film
/// containers and numbered images with the configured extension. Numbered
/// images sharing a basename form one candidate, which becomes a sequence
/// only when it spans more than one frame. A file that cannot be decoded
/// (or disagrees with the group's dimensions) is skipped with a warning
/// and the scan continues. The cancel flag is polled between entries.
pub fn scan_directory(
    dir: &Path,
    opts: &ScanOptions,
    film_opener: Option<FilmOpener>,
    cancel: &AtomicBool,
) -> Result<Vec<Sequence>> {
    let mut names: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect();
    names.sort();

    let mut sequences = Vec::new();
    let mut numbered: BTreeMap<String, NumberedCandidate> = BTreeMap::new();

    for path in &names {
        if cancel.load(Ordering::Relaxed) {
            info!("Directory scan cancelled");
            return Ok(sequences);
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        let ext = ext.to_ascii_lowercase();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        if ext == SER_EXTENSION {
            match container_sequence(dir, path, stem, opts.demosaic) {
                Ok(seq) => sequences.push(seq),
                Err(err) => warn!(path = %path.display(), %err, "Skipping unreadable SER file"),
            }
        } else if FILM_EXTENSIONS.contains(&ext.as_str()) {
            let Some(opener) = film_opener else {
                debug!(path = %path.display(), "No film decoder registered, skipping");
                continue;
            };
            match film_sequence(dir, path, stem, opener) {
                Ok(seq) => sequences.push(seq),
                Err(err) => warn!(path = %path.display(), %err, "Skipping unreadable film file"),
            }
        } else if ext.eq_ignore_ascii_case(&opts.image_ext) {
            let Some((basename, index, fixed_len)) = split_numbered_name(stem) else {
                debug!(path = %path.display(), "Image without trailing number, not a candidate");
                continue;
            };
            let candidate = numbered
                .entry(basename.to_string())
                .or_insert_with(|| NumberedCandidate {
                    basename: basename.to_string(),
                    begin: index,
                    end: index,
                    fixed_len,
                    filenums: Vec::new(),
                });
            candidate.begin = candidate.begin.min(index);
            candidate.end = candidate.end.max(index);
            candidate.fixed_len = candidate.fixed_len.max(fixed_len);
            candidate.filenums.push(index);
        }
    }

    for (_, mut candidate) in numbered {
        if cancel.load(Ordering::Relaxed) {
            info!("Directory scan cancelled");
            return Ok(sequences);
        }
        candidate.filenums.sort_unstable();
        if candidate.filenums.len() < 2 {
            debug!(
                basename = %candidate.basename,
                "Single numbered image, not a sequence"
            );
            continue;
        }
        match numbered_sequence(dir, &candidate, &opts.image_ext) {
            Ok(Some(seq)) => sequences.push(seq),
            Ok(None) => {}
            Err(err) => warn!(
                basename = %candidate.basename,
                %err,
                "Skipping numbered candidate"
            ),
        }
    }

    for seq in &mut sequences {
        if opts.write_seqfiles {
            seq.flush()?;
        }
    }

    info!(dir = %dir.display(), found = sequences.len(), "Directory scan complete");
    Ok(sequences)
}

fn container_sequence(dir: &Path, path: &Path, stem: &str, demosaic: bool) -> Result<Sequence> {
    let container = SerContainer::open(path, demosaic)?;
    let entries: Vec<FrameEntry> = (0..container.frame_count())
        .map(|i| {
            let mut entry = FrameEntry::new(i as i32);
            entry.timestamp_us = container.timestamp(i);
            entry
        })
        .collect();
    let seqfile = dir.join(format!("{stem}.{SEQFILE_EXT}"));
    Sequence::from_source(
        stem,
        0,
        1,
        entries,
        FrameSource::Container(container),
        Some(seqfile),
    )
}

fn film_sequence(dir: &Path, path: &Path, stem: &str, opener: FilmOpener) -> Result<Sequence> {
    let source = FilmSource::open(path, opener(path)?)?;
    let entries: Vec<FrameEntry> = (0..source.frame_count())
        .map(|i| FrameEntry::new(i as i32))
        .collect();
    let seqfile = dir.join(format!("{stem}.{SEQFILE_EXT}"));
    Sequence::from_source(stem, 0, 1, entries, FrameSource::Film(source), Some(seqfile))
}

/// Synthesize a sequence from a numbered-image candidate, dropping frames
/// that cannot be read or whose dimensions disagree with the group.
fn numbered_sequence(
    dir: &Path,
    candidate: &NumberedCandidate,
    image_ext: &str,
) -> Result<Option<Sequence>> {
    let mut reference_dims: Option<(u32, u32)> = None;
    let mut usable: Vec<i32> = Vec::with_capacity(candidate.filenums.len());

    for &filenum in &candidate.filenums {
        let path = dir.join(format!(
            "{}{:0width$}.{}",
            candidate.basename,
            filenum,
            image_ext,
            width = candidate.fixed_len
        ));
        match image::image_dimensions(&path) {
            Ok(dims) => match reference_dims {
                None => {
                    reference_dims = Some(dims);
                    usable.push(filenum);
                }
                Some(expected) if dims == expected => usable.push(filenum),
                Some(expected) => warn!(
                    path = %path.display(),
                    ?dims,
                    ?expected,
                    "Frame dimensions disagree with the group, rejecting frame"
                ),
            },
            Err(err) => {
                warn!(path = %path.display(), %err, "Unreadable frame, rejecting");
            }
        }
    }

    if usable.len() < 2 {
        debug!(
            basename = %candidate.basename,
            "Fewer than two usable frames, not a sequence"
        );
        return Ok(None);
    }

    let begin = usable[0];
    let entries: Vec<FrameEntry> = usable.iter().map(|&n| FrameEntry::new(n)).collect();
    let source = RegularSource::open(
        dir,
        &candidate.basename,
        image_ext,
        candidate.fixed_len,
        usable,
    )?;
    let seqfile = dir.join(format!("{}.{}", candidate.basename, SEQFILE_EXT));
    Sequence::from_source(
        candidate.basename.clone(),
        begin,
        candidate.fixed_len,
        entries,
        FrameSource::Regular(source),
        Some(seqfile),
    )
    .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_options_round_trip() {
        let opts = ScanOptions::default();
        let json = serde_json::to_string(&opts).unwrap();
        let back: ScanOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.image_ext, opts.image_ext);
        assert_eq!(back.write_seqfiles, opts.write_seqfiles);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let partial: ScanOptions = serde_json::from_str(r#"{"image_ext":"png"}"#).unwrap();
        assert_eq!(partial.image_ext, "png");
        assert!(partial.write_seqfiles);
        assert!(partial.demosaic);
    }
}
