mod common;

use callisto_core::cache::RegRecord;
use callisto_core::consts::{ROUNDNESS_UNSET, SEQFILE_VERSION};
use callisto_core::error::CallistoError;
use callisto_core::seqfile::{read_seqfile, write_seqfile, ContainerKind};
use callisto_core::sequence::{LoadOptions, Sequence};
use common::write_ser_file;
use tempfile::tempdir;

fn mono_ser_sequence(dir: &std::path::Path, frames: usize) -> Sequence {
    let data: Vec<Vec<u8>> = (0..frames)
        .map(|i| (0..16u8).map(|p| p.wrapping_add(i as u8 * 16)).collect())
        .collect();
    write_ser_file(dir, "cap.ser", 4, 4, 0, &data);
    let container =
        callisto_core::source::SerContainer::open(&dir.join("cap.ser"), false).unwrap();
    let entries = (0..frames)
        .map(|i| callisto_core::frame::FrameEntry::new(i as i32))
        .collect();
    Sequence::from_source(
        "cap",
        0,
        1,
        entries,
        callisto_core::source::FrameSource::Container(container),
        Some(dir.join("cap.seq")),
    )
    .unwrap()
}

// ---------------------------------------------------------------------------
// Round trip
// ---------------------------------------------------------------------------

#[test]
fn round_trip_preserves_index_registration_and_statistics() {
    let dir = tempdir().unwrap();
    let mut seq = mono_ser_sequence(dir.path(), 3);

    seq.set_included(1, false).unwrap();
    seq.set_reference(Some(2)).unwrap();
    seq.upscale = 2.0;

    for (frame, (fwhm, quality)) in [(2.1f32, 0.5f64), (1.4, 0.9), (1.9, 0.7)]
        .into_iter()
        .enumerate()
    {
        seq.set_reg_record(
            0,
            frame,
            RegRecord {
                shift_x: frame as f32 * 0.25,
                shift_y: -(frame as f32) * 0.5,
                fwhm,
                roundness: 0.85,
                quality,
                psf: None,
            },
        )
        .unwrap();
    }
    let stats0 = seq.statistics(0, 0).unwrap();
    let stats2 = seq.statistics(0, 2).unwrap();

    seq.flush().unwrap();
    assert!(!seq.is_dirty());

    let reloaded = Sequence::load(&dir.path().join("cap.seq"), &LoadOptions::default()).unwrap();
    assert_eq!(reloaded.frame_count(), 3);
    assert_eq!(reloaded.selected_count(), 2);
    assert_eq!(reloaded.upscale, 2.0);
    assert_eq!(reloaded.explicit_reference(), Some(2));
    assert_eq!(reloaded.source_kind(), Some(callisto_core::source::SourceKind::Container));
    assert!(!reloaded.entries()[1].included);

    let reg = reloaded.registration(0).unwrap();
    assert!((reg[1].fwhm - 1.4).abs() < 1e-5);
    assert!((reg[1].quality - 0.9).abs() < 1e-5);
    assert!((reg[2].shift_x - 0.5).abs() < 1e-5);
    assert!((reg[2].shift_y + 1.0).abs() < 1e-5);
    assert!((reg[0].roundness - 0.85).abs() < 1e-5);

    let r0 = reloaded.cached_statistics(0, 0).unwrap();
    let r2 = reloaded.cached_statistics(0, 2).unwrap();
    assert!(reloaded.cached_statistics(0, 1).is_none());
    for (orig, back) in [(stats0, r0), (stats2, r2)] {
        assert_eq!(orig.total, back.total);
        assert_eq!(orig.good_pixels, back.good_pixels);
        assert!((orig.mean - back.mean).abs() < 1e-5);
        assert!((orig.median - back.median).abs() < 1e-5);
        assert!((orig.sigma - back.sigma).abs() < 1e-5);
        assert!((orig.mad - back.mad).abs() < 1e-5);
        assert!((orig.sqrt_bwmv - back.sqrt_bwmv).abs() < 1e-5);
        assert!((orig.bg_noise - back.bg_noise).abs() < 1e-5);
        assert!((orig.norm_value - back.norm_value).abs() < 1e-9);
    }
}

#[test]
fn writer_recomputes_selected_count() {
    let dir = tempdir().unwrap();
    let mut seq = mono_ser_sequence(dir.path(), 3);
    seq.set_included(0, false).unwrap();
    seq.set_included(2, false).unwrap();
    seq.flush().unwrap();

    let text = std::fs::read_to_string(dir.path().join("cap.seq")).unwrap();
    let header = text.lines().next().unwrap();
    // S 'cap' begin count selected ...
    let fields: Vec<&str> = header.split_whitespace().collect();
    assert_eq!(fields[3], "3");
    assert_eq!(fields[4], "1");
}

// ---------------------------------------------------------------------------
// Version tolerance
// ---------------------------------------------------------------------------

#[test]
fn version1_rows_default_roundness_to_sentinel() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("old.seq");
    std::fs::write(
        &path,
        "S 'old' 0 2 2 1 -1 1\n\
         L 1\n\
         I 0 1\n\
         I 1 1\n\
         R0 1.5 -2 3.1 0.75\n\
         R0 0.5 1 2.9 0.8\n",
    )
    .unwrap();

    let index = read_seqfile(&path).unwrap();
    assert_eq!(index.version, 1);
    let rows = index.reg_layers[0].as_ref().unwrap();
    assert!((rows[0].shift_x - 1.5).abs() < 1e-6);
    assert!((rows[0].fwhm - 3.1).abs() < 1e-6);
    assert!((rows[0].quality - 0.75).abs() < 1e-6);
    assert_eq!(rows[0].roundness, ROUNDNESS_UNSET);
    assert!((rows[1].roundness - ROUNDNESS_UNSET).abs() < 1e-6);
}

#[test]
fn header_without_version_field_reads_as_version1() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ancient.seq");
    std::fs::write(&path, "S 'ancient' 1 1 1 1 -1\nL 1\nI 1 1\n").unwrap();
    let index = read_seqfile(&path).unwrap();
    assert_eq!(index.version, 1);
    assert_eq!(index.entries.len(), 1);
}

#[test]
fn newer_version_is_read_with_unknown_lines_skipped() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("future.seq");
    let future = SEQFILE_VERSION + 1;
    std::fs::write(
        &path,
        format!(
            "S 'future' 0 1 1 1 -1 {future}\n\
             L 1\n\
             Z some-extension-line\n\
             I 0 1\n\
             R0 0 0 2.5 0.9 0.8\n"
        ),
    )
    .unwrap();

    let index = read_seqfile(&path).unwrap();
    assert_eq!(index.version, future);
    assert_eq!(index.entries.len(), 1);
    let rows = index.reg_layers[0].as_ref().unwrap();
    assert!((rows[0].fwhm - 2.5).abs() < 1e-6);
}

// ---------------------------------------------------------------------------
// Corruption
// ---------------------------------------------------------------------------

#[test]
fn malformed_line_aborts_the_whole_read() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.seq");
    std::fs::write(
        &path,
        "S 'bad' 0 2 2 1 -1 3\n\
         L 1\n\
         I 0 1\n\
         I not-a-number 1\n",
    )
    .unwrap();

    match read_seqfile(&path) {
        Err(CallistoError::SeqFormat { line, .. }) => assert_eq!(line, 4),
        other => panic!("expected SeqFormat error, got {other:?}"),
    }
}

#[test]
fn unknown_tag_in_current_version_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tag.seq");
    std::fs::write(
        &path,
        format!("S 'tag' 0 1 1 1 -1 {SEQFILE_VERSION}\nL 1\nI 0 1\nQ bogus\n"),
    )
    .unwrap();
    assert!(matches!(
        read_seqfile(&path),
        Err(CallistoError::SeqFormat { .. })
    ));
}

#[test]
fn frame_count_mismatch_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("short.seq");
    std::fs::write(&path, "S 'short' 0 3 3 1 -1 3\nL 1\nI 0 1\nI 1 1\n").unwrap();
    assert!(matches!(
        read_seqfile(&path),
        Err(CallistoError::SeqFormat { .. })
    ));
}

#[test]
fn registration_row_count_mismatch_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rows.seq");
    std::fs::write(
        &path,
        "S 'rows' 0 2 2 1 -1 3\n\
         L 1\n\
         I 0 1\n\
         I 1 1\n\
         R0 0 0 1.0 0.9 0.5\n",
    )
    .unwrap();
    assert!(matches!(
        read_seqfile(&path),
        Err(CallistoError::SeqFormat { .. })
    ));
}

#[test]
fn header_must_come_first() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("order.seq");
    std::fs::write(&path, "L 1\nS 'order' 0 1 1 1 -1 3\nI 0 1\n").unwrap();
    assert!(matches!(
        read_seqfile(&path),
        Err(CallistoError::SeqFormat { line: 1, .. })
    ));
}

#[test]
fn failed_load_exposes_no_sequence() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("gone.seq");
    std::fs::write(&path, "S 'gone' 0 1 1 1 -1 3\nL 1\nI zzz 1\n").unwrap();
    assert!(Sequence::load(&path, &LoadOptions::default()).is_err());
}

// ---------------------------------------------------------------------------
// Writer details
// ---------------------------------------------------------------------------

#[test]
fn container_kind_and_upscale_survive_a_raw_codec_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("codec.seq");

    let mut index = callisto_core::seqfile::SeqIndex {
        name: "codec".into(),
        begin: 5,
        count: 2,
        fixed_len: 3,
        reference: Some(1),
        version: SEQFILE_VERSION,
        layer_count: 1,
        upscale: 1.5,
        container: ContainerKind::Film,
        entries: vec![
            callisto_core::frame::FrameEntry::new(5),
            callisto_core::frame::FrameEntry {
                filenum: 6,
                included: false,
                timestamp_us: Some(12345),
            },
        ],
        reg_layers: vec![None],
        reg_cfa: None,
        stats_layers: vec![None],
        stats_cfa: None,
    };
    index.reg_layers[0] = Some(vec![
        RegRecord {
            shift_x: 0.5,
            shift_y: 0.25,
            fwhm: 2.0,
            roundness: 0.9,
            quality: 0.8,
            psf: None,
        },
        RegRecord::default(),
    ]);

    write_seqfile(&path, &index).unwrap();
    let back = read_seqfile(&path).unwrap();

    assert_eq!(back.name, "codec");
    assert_eq!(back.begin, 5);
    assert_eq!(back.count, 2);
    assert_eq!(back.fixed_len, 3);
    assert_eq!(back.reference, Some(1));
    assert_eq!(back.container, ContainerKind::Film);
    assert!((back.upscale - 1.5).abs() < 1e-6);
    assert_eq!(back.entries[1].timestamp_us, Some(12345));
    assert!(!back.entries[1].included);
    let rows = back.reg_layers[0].as_ref().unwrap();
    assert!((rows[0].shift_y - 0.25).abs() < 1e-6);
}
