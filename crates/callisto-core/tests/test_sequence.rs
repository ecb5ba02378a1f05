mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use callisto_core::cache::RegRecord;
use callisto_core::frame::{Frame, FrameEntry, Region};
use callisto_core::psf::PsfMeasurement;
use callisto_core::sequence::Sequence;
use callisto_core::source::{FrameSource, SerContainer};
use common::write_ser_file;
use ndarray::Array2;
use tempfile::tempdir;

fn mono_sequence(dir: &std::path::Path, frames: usize) -> Sequence {
    let data: Vec<Vec<u8>> = (0..frames)
        .map(|i| (0..16u8).map(|p| p.wrapping_add(i as u8 + 1)).collect())
        .collect();
    write_ser_file(dir, "seq.ser", 4, 4, 0, &data);
    let container = SerContainer::open(&dir.join("seq.ser"), false).unwrap();
    let entries = (0..frames).map(|i| FrameEntry::new(i as i32)).collect();
    Sequence::from_source(
        "seq",
        0,
        1,
        entries,
        FrameSource::Container(container),
        Some(dir.join("seq.seq")),
    )
    .unwrap()
}

fn memory_sequence(frames: usize, preserve: bool) -> Sequence {
    let frames: Vec<Arc<Frame>> = (0..frames)
        .map(|i| {
            Arc::new(Frame::new(
                vec![Array2::from_elem((4, 4), 0.1 * (i + 1) as f32)],
                16,
            ))
        })
        .collect();
    Sequence::from_frames("composite", frames, preserve).unwrap()
}

// ---------------------------------------------------------------------------
// check_or_allocate idempotence
// ---------------------------------------------------------------------------

#[test]
fn check_or_allocate_twice_equals_once() {
    let dir = tempdir().unwrap();
    let mut seq = mono_sequence(dir.path(), 3);

    seq.check_or_allocate_reg(0).unwrap();
    seq.set_shift(0, 1, 2.0, 3.0, false).unwrap();

    let before: Vec<(f32, f32)> = seq
        .registration(0)
        .unwrap()
        .iter()
        .map(|r| (r.shift_x, r.shift_y))
        .collect();

    seq.check_or_allocate_reg(0).unwrap();
    let after: Vec<(f32, f32)> = seq
        .registration(0)
        .unwrap()
        .iter()
        .map(|r| (r.shift_x, r.shift_y))
        .collect();

    assert_eq!(before, after);
    assert!((after[1].0 - 2.0).abs() < 1e-6);
}

#[test]
fn allocate_bad_layer_is_rejected() {
    let dir = tempdir().unwrap();
    let mut seq = mono_sequence(dir.path(), 2);
    assert!(seq.check_or_allocate_reg(5).is_err());
}

// ---------------------------------------------------------------------------
// Shift sign normalization
// ---------------------------------------------------------------------------

#[test]
fn top_down_shift_is_negated_to_disk_convention() {
    let dir = tempdir().unwrap();
    let mut seq = mono_sequence(dir.path(), 2);

    seq.set_shift(0, 0, 1.0, 2.0, true).unwrap();
    seq.set_shift(0, 1, 1.0, 2.0, false).unwrap();

    let reg = seq.registration(0).unwrap();
    assert!((reg[0].shift_y + 2.0).abs() < 1e-6);
    assert!((reg[1].shift_y - 2.0).abs() < 1e-6);
    assert!((reg[0].shift_x - 1.0).abs() < 1e-6);
}

// ---------------------------------------------------------------------------
// Reference selection
// ---------------------------------------------------------------------------

#[test]
fn explicit_reference_wins() {
    let dir = tempdir().unwrap();
    let mut seq = mono_sequence(dir.path(), 3);
    seq.set_reference(Some(2)).unwrap();
    assert_eq!(seq.reference_index(), 2);
}

#[test]
fn min_fwhm_wins_when_fwhm_is_measured() {
    let dir = tempdir().unwrap();
    let mut seq = mono_sequence(dir.path(), 3);
    for (frame, fwhm) in [2.1f32, 1.4, 1.9].into_iter().enumerate() {
        seq.set_reg_record(
            0,
            frame,
            RegRecord {
                fwhm,
                ..RegRecord::default()
            },
        )
        .unwrap();
    }
    assert_eq!(seq.reference_index(), 1);
}

#[test]
fn max_quality_wins_without_fwhm() {
    let dir = tempdir().unwrap();
    let mut seq = mono_sequence(dir.path(), 3);
    for (frame, quality) in [0.3f64, 0.8, 0.95].into_iter().enumerate() {
        seq.set_reg_record(
            0,
            frame,
            RegRecord {
                quality,
                ..RegRecord::default()
            },
        )
        .unwrap();
    }
    assert_eq!(seq.reference_index(), 2);
}

#[test]
fn excluded_frames_do_not_compete() {
    let dir = tempdir().unwrap();
    let mut seq = mono_sequence(dir.path(), 3);
    for (frame, fwhm) in [2.1f32, 1.4, 1.9].into_iter().enumerate() {
        seq.set_reg_record(
            0,
            frame,
            RegRecord {
                fwhm,
                ..RegRecord::default()
            },
        )
        .unwrap();
    }
    seq.set_included(1, false).unwrap();
    assert_eq!(seq.reference_index(), 2);
}

#[test]
fn first_included_frame_without_registration_data() {
    let dir = tempdir().unwrap();
    let mut seq = mono_sequence(dir.path(), 3);
    seq.set_included(0, false).unwrap();
    assert_eq!(seq.reference_index(), 1);
}

#[test]
fn frame_zero_when_nothing_is_included() {
    let dir = tempdir().unwrap();
    let mut seq = mono_sequence(dir.path(), 3);
    for i in 0..3 {
        seq.set_included(i, false).unwrap();
    }
    assert_eq!(seq.reference_index(), 0);
}

// ---------------------------------------------------------------------------
// Statistics compute-and-cache
// ---------------------------------------------------------------------------

#[test]
fn statistics_are_computed_once_and_cached() {
    let dir = tempdir().unwrap();
    let mut seq = mono_sequence(dir.path(), 2);

    assert!(seq.cached_statistics(0, 0).is_none());
    let first = seq.statistics(0, 0).unwrap();
    assert!(first.good_pixels > 0);
    assert!(seq.is_dirty());

    let again = seq.statistics(0, 0).unwrap();
    assert!(Arc::ptr_eq(&first, &again));
}

#[test]
fn batch_statistics_cover_included_frames() {
    let dir = tempdir().unwrap();
    let mut seq = mono_sequence(dir.path(), 4);
    seq.set_included(2, false).unwrap();

    let cancel = AtomicBool::new(false);
    let mut seen = Vec::new();
    let done = seq
        .compute_statistics_batch(
            0,
            &cancel,
            Some(&mut |done, todo| seen.push((done, todo))),
        )
        .unwrap();

    assert_eq!(done, 3);
    assert!(seq.cached_statistics(0, 0).is_some());
    assert!(seq.cached_statistics(0, 2).is_none());
    assert!(seq.cached_statistics(0, 3).is_some());
    assert_eq!(seen.last(), Some(&(3, 3)));
}

#[test]
fn cancelled_batch_keeps_what_was_produced() {
    let dir = tempdir().unwrap();
    let mut seq = mono_sequence(dir.path(), 3);
    let cancel = AtomicBool::new(true);
    let done = seq.compute_statistics_batch(0, &cancel, None).unwrap();
    assert_eq!(done, 0);
    assert!(seq.cached_statistics(0, 0).is_none());
}

// ---------------------------------------------------------------------------
// Frame access
// ---------------------------------------------------------------------------

#[test]
fn read_region_equals_crop_through_the_sequence() {
    let dir = tempdir().unwrap();
    let seq = mono_sequence(dir.path(), 2);
    let rect = Region::new(1, 1, 2, 2);
    let window = seq.read_region(0, 1, &rect).unwrap();
    let full = seq.read_frame(1).unwrap();
    assert_eq!(window, full.crop(0, &rect).unwrap());
}

#[test]
fn out_of_range_frame_is_rejected() {
    let dir = tempdir().unwrap();
    let seq = mono_sequence(dir.path(), 2);
    assert!(seq.read_frame(2).is_err());
}

// ---------------------------------------------------------------------------
// Photometry aliasing
// ---------------------------------------------------------------------------

#[test]
fn registration_psf_survives_photometry_eviction() {
    let dir = tempdir().unwrap();
    let mut seq = mono_sequence(dir.path(), 2);

    let shared = Arc::new(PsfMeasurement {
        amplitude: 0.9,
        background: 0.05,
        x: 2.0,
        y: 2.0,
        fwhm_x: 2.4,
        fwhm_y: 2.6,
        roundness: 0.92,
        magnitude: -4.0,
    });

    let slot = seq.add_photometry_set("target");
    seq.set_photometry_measurement(slot, 0, Arc::clone(&shared))
        .unwrap();
    seq.set_reg_psf(0, 0, Arc::clone(&shared)).unwrap();

    // Push the table past capacity so "target" is evicted.
    for i in 0..callisto_core::consts::PHOTOMETRY_SLOTS {
        seq.add_photometry_set(format!("filler{i}"));
    }

    let reg = seq.registration(0).unwrap();
    let kept = reg[0].psf.as_ref().unwrap();
    assert!((kept.fwhm() - 2.5).abs() < 1e-6);
    assert!((reg[0].fwhm - 2.5).abs() < 1e-6);
    assert!((reg[0].roundness - 0.92).abs() < 1e-6);
}

#[test]
fn measure_star_shares_one_measurement_between_caches() {
    use callisto_core::psf::MomentFit;

    // One bright pixel block on a dark background.
    let mut plane = Array2::from_elem((16, 16), 0.02f32);
    for r in 6..9 {
        for c in 7..10 {
            plane[[r, c]] = 0.9;
        }
    }
    let frames = vec![Arc::new(Frame::new(vec![plane], 16))];
    let mut seq = Sequence::from_frames("star", frames, false).unwrap();

    let slot = seq.add_photometry_set("target");
    let m = seq
        .measure_star(0, 0, &Region::new(4, 4, 9, 9), &MomentFit, Some(slot))
        .unwrap();

    let from_reg = seq.registration(0).unwrap()[0].psf.as_ref().unwrap().clone();
    let from_phot = seq.photometry().get(slot).unwrap().get(0).unwrap().clone();
    assert!(Arc::ptr_eq(&from_reg, &m));
    assert!(Arc::ptr_eq(&from_phot, &m));
    assert!(m.fwhm() > 0.0);
    assert!((seq.registration(0).unwrap()[0].fwhm - m.fwhm()).abs() < 1e-6);
}

// ---------------------------------------------------------------------------
// Close / in-memory composites
// ---------------------------------------------------------------------------

#[test]
fn close_flushes_and_unloads() {
    let dir = tempdir().unwrap();
    let mut seq = mono_sequence(dir.path(), 2);
    seq.statistics(0, 0).unwrap();
    seq.close().unwrap();

    assert!(!seq.is_loaded());
    assert_eq!(seq.frame_count(), 0);
    assert!(seq.read_frame(0).is_err());
    assert!(dir.path().join("seq.seq").exists());
}

#[test]
fn memory_composite_reads_share_frames() {
    let seq = memory_sequence(3, false);
    let a = seq.read_frame(1).unwrap();
    let b = seq.read_frame(1).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn preserved_composite_stays_usable_after_close() {
    let mut seq = memory_sequence(3, true);
    seq.statistics(0, 1).unwrap();
    seq.close().unwrap();

    assert!(seq.is_loaded());
    assert_eq!(seq.frame_count(), 3);
    // Caches are gone, frames are not.
    assert!(seq.cached_statistics(0, 1).is_none());
    let frame = seq.read_frame(0).unwrap();
    assert!((frame.plane(0).unwrap()[[0, 0]] - 0.1).abs() < 1e-6);
}

#[test]
fn plain_memory_composite_unloads_on_close() {
    let mut seq = memory_sequence(2, false);
    seq.close().unwrap();
    assert!(!seq.is_loaded());
}
