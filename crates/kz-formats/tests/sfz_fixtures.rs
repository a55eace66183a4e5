//! Integration tests for the SFZ loader against fixture files on disk.

use kz_formats::load_sfz;
use kz_ir::{Instrument, LoopMode, LoopType, Trigger};
use std::path::PathBuf;

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../tests/fixtures/sfz")
}

fn load_fixture(name: &str) -> Instrument {
    let path = fixtures_dir().join(name);
    load_sfz(&path).unwrap_or_else(|e| panic!("Failed to load {}: {}", path.display(), e))
}

#[test]
fn keys_fixture_structure() {
    let inst = load_fixture("keys.sfz");
    assert_eq!(inst.name, "keys");
    assert_eq!(inst.regions.len(), 4);
    // sine_a4.wav and click.wav
    assert_eq!(inst.samples.len(), 2);
    assert_eq!(inst.initial_cc, vec![(7, 100)]);

    for (i, r) in inst.regions.iter().enumerate() {
        assert!(inst.sample_for(r).is_some(), "region {} has no sample", i);
        assert_eq!(r.ampeg.release, 0.2, "region {} release", i);
    }
}

#[test]
fn keys_fixture_ranges_and_inheritance() {
    let inst = load_fixture("keys.sfz");
    let r = &inst.regions;

    assert_eq!((r[0].lokey, r[0].hikey, r[0].pitch_keycenter), (36, 71, 69));
    assert_eq!(r[0].loop_mode, LoopMode::Continuous);
    assert_eq!(r[0].volume, -3.0);
    assert_eq!((r[1].lokey, r[1].hikey), (72, 96));
    assert_eq!(r[1].amp_veltrack, 0.0);

    // Included from release.inc inside the release group.
    assert_eq!(r[2].trigger, Trigger::RELEASE);
    assert_eq!(r[2].volume, -12.0);
    assert_ne!(r[2].sample, r[0].sample);

    assert_eq!((r[3].lokey, r[3].hikey), (108, 108));
    assert_eq!((r[3].sw_lokey, r[3].sw_hikey, r[3].sw_last), (24, 25, 24));
    assert_eq!(r[3].transpose, -12);
    assert_eq!(r[3].trigger, Trigger::ATTACK);
}

#[test]
fn keys_fixture_sample_loop() {
    let inst = load_fixture("keys.sfz");
    let sine = inst.sample_for(&inst.regions[0]).unwrap();
    assert_eq!(sine.sample_rate, 44100);
    assert_eq!(sine.len(), 4410);
    assert_eq!(sine.loop_type, LoopType::Forward);
    assert_eq!((sine.loop_start, sine.loop_end), (1000, 3999));

    let click = inst.sample_for(&inst.regions[2]).unwrap();
    assert_eq!(click.len(), 441);
    assert!(!click.has_loop());
}

#[test]
fn missing_file_is_an_error() {
    assert!(load_sfz(fixtures_dir().join("does_not_exist.sfz")).is_err());
}
