//! The persisted sequence sidecar: a line-oriented, versioned text index
//! caching the frame list and the per-layer registration/statistics data so
//! reopening a sequence skips recomputation.
//!
//! One tag per line:
//! - `S 'name' begin count selected fixed ref version` — header
//! - `L n` — layer count
//! - `T S|A` — backing container kind (SER / film), absent for file-per-frame
//! - `U f` — upscale factor for later-stage resampling (version 3)
//! - `I filenum incl [timestamp_us]` — one per frame, in order
//! - `R<layer> sx sy fwhm roundness quality` — one per frame, in order
//! - `R* ...` — same, raw-CFA-domain data (`*` keeps it distinct from a
//!   literal layer 0)
//! - `M<layer>-<frame> <14 statistics fields>` / `M*-<frame>` (version 3)
//!
//! Version 1 registration rows carry no roundness; it defaults to
//! `ROUNDNESS_UNSET` on read. A file newer than `SEQFILE_VERSION` is read
//! field-by-field with a warning; a line that does not parse aborts the
//! whole read so no partially populated sequence ever escapes.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::RegRecord;
use crate::consts::{ROUNDNESS_UNSET, SEQFILE_VERSION};
use crate::error::{CallistoError, Result};
use crate::frame::FrameEntry;
use crate::stats::StatsRecord;

/// Backing container kind recorded in the sidecar.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ContainerKind {
    /// One image file per frame; no `T` line is written.
    #[default]
    None,
    /// Single SER-like container (`T S`).
    Ser,
    /// Film/video container (`T A`).
    Film,
}

/// Everything a sidecar holds, in file terms: registration and statistics
/// arrays keyed by their on-disk tag (numeric layer or `*` for the raw CFA
/// domain). Which side is primary is decided by the loader from the live
/// demosaic setting, not recorded here.
#[derive(Debug, Default)]
pub struct SeqIndex {
    pub name: String,
    pub begin: i32,
    pub count: usize,
    pub fixed_len: usize,
    pub reference: Option<usize>,
    pub version: u32,
    pub layer_count: usize,
    pub upscale: f32,
    pub container: ContainerKind,
    pub entries: Vec<FrameEntry>,
    pub reg_layers: Vec<Option<Vec<RegRecord>>>,
    pub reg_cfa: Option<Vec<RegRecord>>,
    pub stats_layers: Vec<Option<Vec<Option<Arc<StatsRecord>>>>>,
    pub stats_cfa: Option<Vec<Option<Arc<StatsRecord>>>>,
}

impl SeqIndex {
    /// Live selected count, always derived from the inclusion flags.
    pub fn selected_count(&self) -> usize {
        self.entries.iter().filter(|e| e.included).count()
    }
}

fn fail(line: usize, reason: impl Into<String>) -> CallistoError {
    CallistoError::SeqFormat {
        line,
        reason: reason.into(),
    }
}

fn parse_num<T: FromStr>(token: Option<&str>, line: usize, what: &str) -> Result<T> {
    token
        .ok_or_else(|| fail(line, format!("missing {what}")))?
        .parse::<T>()
        .map_err(|_| fail(line, format!("invalid {what}")))
}

/// Read a sidecar file into a `SeqIndex`.
pub fn read_seqfile(path: &Path) -> Result<SeqIndex> {
    let file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CallistoError::NotFound(path.to_path_buf())
        } else {
            CallistoError::Io(e)
        }
    })?;
    let reader = BufReader::new(file);

    let mut index: Option<SeqIndex> = None;
    let mut newer_warned = false;

    for (lineno, line) in reader.lines().enumerate() {
        let lineno = lineno + 1;
        let line = line?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let tag = trimmed.as_bytes()[0];
        if tag != b'S' && index.is_none() {
            return Err(fail(lineno, "header line must come first"));
        }

        match tag {
            b'S' => {
                if index.is_some() {
                    return Err(fail(lineno, "duplicate header line"));
                }
                let parsed = parse_header_line(trimmed, lineno)?;
                if parsed.version > SEQFILE_VERSION && !newer_warned {
                    warn!(
                        version = parsed.version,
                        supported = SEQFILE_VERSION,
                        "Sequence file is newer than this reader; unknown fields will be ignored"
                    );
                    newer_warned = true;
                }
                index = Some(parsed);
            }
            b'L' => {
                let index = index.as_mut().expect("header checked above");
                let mut tokens = trimmed[1..].split_whitespace();
                let layers: usize = parse_num(tokens.next(), lineno, "layer count")?;
                if layers == 0 {
                    return Err(fail(lineno, "layer count must be positive"));
                }
                index.layer_count = layers;
                index.reg_layers = (0..layers).map(|_| None).collect();
                index.stats_layers = (0..layers).map(|_| None).collect();
            }
            b'U' => {
                let index = index.as_mut().expect("header checked above");
                let mut tokens = trimmed[1..].split_whitespace();
                index.upscale = parse_num(tokens.next(), lineno, "upscale factor")?;
            }
            b'T' => {
                let index = index.as_mut().expect("header checked above");
                let kind = trimmed[1..].trim();
                index.container = match kind {
                    "S" => ContainerKind::Ser,
                    "A" => ContainerKind::Film,
                    _ => return Err(fail(lineno, format!("unknown container kind '{kind}'"))),
                };
            }
            b'I' => {
                let index = index.as_mut().expect("header checked above");
                let mut tokens = trimmed[1..].split_whitespace();
                let filenum: i32 = parse_num(tokens.next(), lineno, "file number")?;
                let incl: u8 = parse_num(tokens.next(), lineno, "inclusion flag")?;
                let timestamp_us = match tokens.next() {
                    Some(tok) => Some(
                        tok.parse::<u64>()
                            .map_err(|_| fail(lineno, "invalid timestamp"))?,
                    ),
                    None => None,
                };
                if index.entries.len() == index.count {
                    return Err(fail(lineno, "more frame entries than the header count"));
                }
                index.entries.push(FrameEntry {
                    filenum,
                    included: incl != 0,
                    timestamp_us,
                });
            }
            b'R' => {
                let index = index.as_mut().expect("header checked above");
                parse_reg_line(index, trimmed, lineno)?;
            }
            b'M' => {
                let index = index.as_mut().expect("header checked above");
                parse_stats_line(index, trimmed, lineno)?;
            }
            _ => {
                let index = index.as_ref().expect("header checked above");
                if index.version > SEQFILE_VERSION {
                    debug!(line = lineno, "Skipping unknown line tag from newer format");
                } else {
                    return Err(fail(
                        lineno,
                        format!("unknown line tag '{}'", trimmed.chars().next().unwrap()),
                    ));
                }
            }
        }
    }

    let index = index.ok_or_else(|| fail(0, "missing header line"))?;

    if index.entries.len() != index.count {
        return Err(fail(
            0,
            format!(
                "header announces {} frames, file lists {}",
                index.count,
                index.entries.len()
            ),
        ));
    }
    if let Some(reference) = index.reference {
        if reference >= index.count {
            return Err(fail(0, format!("reference frame {reference} out of range")));
        }
    }
    for (layer, slot) in index.reg_layers.iter().enumerate() {
        if let Some(records) = slot {
            if records.len() != index.count {
                return Err(fail(
                    0,
                    format!(
                        "layer {layer} has {} registration rows, expected {}",
                        records.len(),
                        index.count
                    ),
                ));
            }
        }
    }
    if let Some(records) = &index.reg_cfa {
        if records.len() != index.count {
            return Err(fail(
                0,
                format!(
                    "CFA domain has {} registration rows, expected {}",
                    records.len(),
                    index.count
                ),
            ));
        }
    }

    Ok(index)
}

fn parse_header_line(line: &str, lineno: usize) -> Result<SeqIndex> {
    let rest = line[1..].trim_start();
    let Some(stripped) = rest.strip_prefix('\'') else {
        return Err(fail(lineno, "sequence name must be quoted"));
    };
    let Some(close) = stripped.find('\'') else {
        return Err(fail(lineno, "unterminated sequence name"));
    };
    let name = stripped[..close].to_string();

    let mut tokens = stripped[close + 1..].split_whitespace();
    let begin: i32 = parse_num(tokens.next(), lineno, "begin index")?;
    let count: usize = parse_num(tokens.next(), lineno, "frame count")?;
    let _selected: usize = parse_num(tokens.next(), lineno, "selected count")?;
    let fixed_len: usize = parse_num(tokens.next(), lineno, "padding width")?;
    let reference: i64 = parse_num(tokens.next(), lineno, "reference index")?;
    // The version field was introduced with the format itself but kept
    // optional so the earliest files (no trailing number) still load.
    let version: u32 = match tokens.next() {
        Some(tok) => tok
            .parse::<u32>()
            .map_err(|_| fail(lineno, "invalid version"))?,
        None => 1,
    };
    if version == 0 {
        return Err(fail(lineno, "invalid version"));
    }

    Ok(SeqIndex {
        name,
        begin,
        count,
        fixed_len,
        reference: if reference >= 0 {
            Some(reference as usize)
        } else {
            None
        },
        version,
        layer_count: 1,
        upscale: 1.0,
        container: ContainerKind::None,
        entries: Vec::new(),
        reg_layers: vec![None],
        stats_layers: vec![None],
        reg_cfa: None,
        stats_cfa: None,
    })
}

/// Tag of a registration/statistics row: a numeric layer or the raw CFA
/// domain marker `*`.
enum RowTag {
    Layer(usize),
    Cfa,
}

fn parse_row_tag(token: &str, lineno: usize) -> Result<RowTag> {
    if token == "*" {
        Ok(RowTag::Cfa)
    } else {
        token
            .parse::<usize>()
            .map(RowTag::Layer)
            .map_err(|_| fail(lineno, format!("invalid layer tag '{token}'")))
    }
}

fn parse_reg_line(index: &mut SeqIndex, line: &str, lineno: usize) -> Result<()> {
    let mut tokens = line[1..].split_whitespace();
    let tag_token = tokens
        .next()
        .ok_or_else(|| fail(lineno, "missing registration layer tag"))?;
    let tag = parse_row_tag(tag_token, lineno)?;

    let shift_x: f32 = parse_num(tokens.next(), lineno, "shift x")?;
    let shift_y: f32 = parse_num(tokens.next(), lineno, "shift y")?;
    let fwhm: f32 = parse_num(tokens.next(), lineno, "fwhm")?;
    // Roundness arrived with version 2; older rows default to the sentinel.
    let (roundness, quality) = if index.version >= 2 {
        let roundness: f32 = parse_num(tokens.next(), lineno, "roundness")?;
        let quality: f64 = parse_num(tokens.next(), lineno, "quality")?;
        (roundness, quality)
    } else {
        let quality: f64 = parse_num(tokens.next(), lineno, "quality")?;
        (ROUNDNESS_UNSET, quality)
    };

    let record = RegRecord {
        shift_x,
        shift_y,
        fwhm,
        roundness,
        quality,
        psf: None,
    };

    let count = index.count;
    let rows = match tag {
        RowTag::Cfa => index.reg_cfa.get_or_insert_with(Vec::new),
        RowTag::Layer(layer) => {
            if layer >= index.layer_count {
                return Err(fail(
                    lineno,
                    format!(
                        "registration layer {layer} out of range ({} layers)",
                        index.layer_count
                    ),
                ));
            }
            index.reg_layers[layer].get_or_insert_with(Vec::new)
        }
    };
    if rows.len() == count {
        return Err(fail(lineno, "more registration rows than frames"));
    }
    rows.push(record);
    Ok(())
}

fn parse_stats_line(index: &mut SeqIndex, line: &str, lineno: usize) -> Result<()> {
    let mut tokens = line[1..].split_whitespace();
    let key = tokens
        .next()
        .ok_or_else(|| fail(lineno, "missing statistics key"))?;
    let (tag_token, frame_token) = key
        .split_once('-')
        .ok_or_else(|| fail(lineno, "statistics key must be <layer>-<frame>"))?;
    let tag = parse_row_tag(tag_token, lineno)?;
    let frame: usize = frame_token
        .parse()
        .map_err(|_| fail(lineno, "invalid statistics frame number"))?;
    if frame >= index.count {
        return Err(fail(lineno, format!("statistics frame {frame} out of range")));
    }

    let total: usize = parse_num(tokens.next(), lineno, "pixel total")?;
    let good_pixels: usize = parse_num(tokens.next(), lineno, "good pixel count")?;
    let mean: f64 = parse_num(tokens.next(), lineno, "mean")?;
    let median: f64 = parse_num(tokens.next(), lineno, "median")?;
    let sigma: f64 = parse_num(tokens.next(), lineno, "sigma")?;
    let avg_dev: f64 = parse_num(tokens.next(), lineno, "avgDev")?;
    let mad: f64 = parse_num(tokens.next(), lineno, "MAD")?;
    let sqrt_bwmv: f64 = parse_num(tokens.next(), lineno, "sqrt(BWMV)")?;
    let location: f64 = parse_num(tokens.next(), lineno, "location")?;
    let scale: f64 = parse_num(tokens.next(), lineno, "scale")?;
    let min: f64 = parse_num(tokens.next(), lineno, "min")?;
    let max: f64 = parse_num(tokens.next(), lineno, "max")?;
    let norm_value: f64 = parse_num(tokens.next(), lineno, "normalization value")?;
    let bg_noise: f64 = parse_num(tokens.next(), lineno, "background noise")?;

    let record = Arc::new(StatsRecord {
        total,
        good_pixels,
        mean,
        median,
        sigma,
        avg_dev,
        mad,
        sqrt_bwmv,
        location,
        scale,
        min,
        max,
        norm_value,
        bg_noise,
    });

    let count = index.count;
    let entries = match tag {
        RowTag::Cfa => index
            .stats_cfa
            .get_or_insert_with(|| vec![None; count]),
        RowTag::Layer(layer) => {
            if layer >= index.layer_count {
                return Err(fail(
                    lineno,
                    format!(
                        "statistics layer {layer} out of range ({} layers)",
                        index.layer_count
                    ),
                ));
            }
            index.stats_layers[layer].get_or_insert_with(|| vec![None; count])
        }
    };
    entries[frame] = Some(record);
    Ok(())
}

/// Write a sidecar file. The selected count in the header is always
/// recomputed from the inclusion flags, never taken from a cached value.
pub fn write_seqfile(path: &Path, index: &SeqIndex) -> Result<()> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);

    let reference = index.reference.map(|r| r as i64).unwrap_or(-1);
    writeln!(
        w,
        "S '{}' {} {} {} {} {} {}",
        index.name,
        index.begin,
        index.count,
        index.selected_count(),
        index.fixed_len,
        reference,
        SEQFILE_VERSION
    )?;
    writeln!(w, "L {}", index.layer_count)?;
    match index.container {
        ContainerKind::None => {}
        ContainerKind::Ser => writeln!(w, "T S")?,
        ContainerKind::Film => writeln!(w, "T A")?,
    }
    if index.upscale != 1.0 {
        writeln!(w, "U {}", index.upscale)?;
    }

    for entry in &index.entries {
        match entry.timestamp_us {
            Some(ts) => writeln!(
                w,
                "I {} {} {}",
                entry.filenum,
                u8::from(entry.included),
                ts
            )?,
            None => writeln!(w, "I {} {}", entry.filenum, u8::from(entry.included))?,
        }
    }

    for (layer, slot) in index.reg_layers.iter().enumerate() {
        if let Some(records) = slot {
            for record in records {
                write_reg_row(&mut w, &layer.to_string(), record)?;
            }
        }
    }
    if let Some(records) = &index.reg_cfa {
        for record in records {
            write_reg_row(&mut w, "*", record)?;
        }
    }

    for (layer, slot) in index.stats_layers.iter().enumerate() {
        if let Some(entries) = slot {
            write_stats_rows(&mut w, &layer.to_string(), entries)?;
        }
    }
    if let Some(entries) = &index.stats_cfa {
        write_stats_rows(&mut w, "*", entries)?;
    }

    w.flush()?;
    Ok(())
}

fn write_reg_row(w: &mut impl Write, tag: &str, record: &RegRecord) -> Result<()> {
    writeln!(
        w,
        "R{} {} {} {} {} {}",
        tag, record.shift_x, record.shift_y, record.fwhm, record.roundness, record.quality
    )?;
    Ok(())
}

fn write_stats_rows(
    w: &mut impl Write,
    tag: &str,
    entries: &[Option<Arc<StatsRecord>>],
) -> Result<()> {
    for (frame, entry) in entries.iter().enumerate() {
        let Some(s) = entry else { continue };
        writeln!(
            w,
            "M{}-{} {} {} {} {} {} {} {} {} {} {} {} {} {} {}",
            tag,
            frame,
            s.total,
            s.good_pixels,
            s.mean,
            s.median,
            s.sigma,
            s.avg_dev,
            s.mad,
            s.sqrt_bwmv,
            s.location,
            s.scale,
            s.min,
            s.max,
            s.norm_value,
            s.bg_noise
        )?;
    }
    Ok(())
}
