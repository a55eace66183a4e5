//! SFZ text in, audio out: note scenarios through the loader and engine.

mod common;

use common::{fixtures_dir, instrument, Rig};
use kz_audio::{AudioOutput, CaptureOutput};
use kz_master::{Controller, ControllerConfig};

#[test]
fn key_range_selects_what_sounds() {
    let mut rig = Rig::new(instrument("<region> sample=tone.wav lokey=c4 hikey=c5"));
    rig.note_on(40, 100);
    assert_eq!(rig.run(512), 0.0);
    assert_eq!(rig.voices(), 0);

    rig.note_on(64, 100);
    assert!(rig.run(512) > 0.1);
    assert_eq!(rig.voices(), 1);
}

#[test]
fn note_off_releases_and_frees_the_voice() {
    let mut rig = Rig::new(instrument("<region> sample=tone.wav ampeg_release=0.01"));
    rig.note_on(60, 127);
    rig.run(512);
    rig.note_off(60);
    for _ in 0..8 {
        rig.run(512);
    }
    assert_eq!(rig.voices(), 0);
    assert_eq!(rig.engine.active_notes(), 0);
    assert_eq!(rig.run(512), 0.0);
}

#[test]
fn release_rings_for_its_time_then_frees() {
    let mut rig = Rig::new(instrument("<region> sample=tone.wav ampeg_attack=0 ampeg_release=0.1"));
    let rate = rig.engine.sample_rate() as usize;
    rig.note_on(60, 100);
    for _ in 0..rate / 512 {
        rig.run(512);
    }
    rig.run(rate % 512);
    assert_eq!(rig.voices(), 1);

    // One second in: release over 0.1 s.
    rig.note_off(60);
    let early = rig.run(rate / 20);
    assert!(early > 0.0);
    assert_eq!(rig.voices(), 1);
    assert!(rig.run(64) > 0.0);

    rig.run(rate / 10);
    assert_eq!(rig.voices(), 0);
    assert_eq!(rig.engine.active_notes(), 0);
    assert_eq!(rig.run(512), 0.0);
}

#[test]
fn one_shot_ignores_note_off() {
    let mut rig = Rig::new(instrument("<region> sample=tone.wav loop_mode=one_shot ampeg_release=0.01"));
    rig.note_on(60, 127);
    rig.run(512);
    rig.note_off(60);
    for _ in 0..8 {
        rig.run(512);
    }
    assert_eq!(rig.voices(), 1);
    assert!(rig.run(512) > 0.1);
}

#[test]
fn release_trigger_region_plays_on_note_off() {
    let mut rig = Rig::new(instrument("<region> sample=tone.wav trigger=release"));
    rig.note_on(60, 100);
    assert_eq!(rig.run(512), 0.0);
    assert_eq!(rig.voices(), 0);

    rig.note_off(60);
    assert!(rig.run(128) > 0.1);
    assert!(rig.voices() >= 1);
}

#[test]
fn sustain_pedal_holds_released_keys() {
    let mut rig = Rig::new(instrument("<region> sample=tone.wav ampeg_release=0.005"));
    rig.cc(64, 127);
    rig.note_on(60, 100);
    rig.run(512);
    rig.note_off(60);
    for _ in 0..4 {
        rig.run(512);
    }
    assert_eq!(rig.voices(), 1);

    rig.cc(64, 0);
    for _ in 0..4 {
        rig.run(512);
    }
    assert_eq!(rig.voices(), 0);
}

#[test]
fn key_switch_selects_articulation() {
    let sfz = "<group> sw_lokey=24 sw_hikey=25 lokey=48 hikey=72
               <region> sample=tone.wav sw_last=24 volume=-40
               <region> sample=tone.wav sw_last=25";

    // No key switch pressed yet: nothing matches.
    let mut rig = Rig::new(instrument(sfz));
    rig.note_on(60, 100);
    assert_eq!(rig.run(512), 0.0);

    let mut quiet = Rig::new(instrument(sfz));
    quiet.note_on(24, 100);
    quiet.note_off(24);
    quiet.note_on(60, 100);
    let soft = quiet.run(512);

    let mut loud = Rig::new(instrument(sfz));
    loud.note_on(25, 100);
    loud.note_off(25);
    loud.note_on(60, 100);
    let hard = loud.run(512);

    assert!(soft > 0.0);
    assert!(hard > soft * 20.0, "soft {soft} hard {hard}");
}

#[test]
fn initial_controllers_apply_on_load() {
    let mut rig = Rig::new(instrument("<control> set_cc7=0 <region> sample=tone.wav"));
    assert_eq!(rig.controller(7), 0);
    rig.note_on(60, 127);
    assert_eq!(rig.run(512), 0.0);

    rig.cc(7, 127);
    rig.run(512);
    assert!(rig.run(512) > 0.1);
}

#[test]
fn controller_plays_fixture_from_config() {
    let path = fixtures_dir().join("sfz/keys.sfz");
    let yaml = format!("channels:\n  - instrument: {}\n    midi_channel: 1\n", path.display());
    let mut ctrl = Controller::new(ControllerConfig::from_yaml(&yaml).unwrap()).unwrap();
    assert_eq!(ctrl.instrument(0).unwrap().regions.len(), 4);
    assert_eq!(ctrl.instrument_path(0), Some(path.as_path()));

    let mut out = CaptureOutput::new(44100);
    let (mut l, mut r) = (vec![0.0; 256], vec![0.0; 256]);
    ctrl.render_block(&mut l, &mut r);
    out.write(&l, &r).unwrap();
    assert_eq!(out.peak(), 0.0);

    // Note-on, MIDI channel 1, inside the looped sine region.
    ctrl.midi_in(0, &[0x90, 57, 110]).unwrap();
    for _ in 0..8 {
        ctrl.render_block(&mut l, &mut r);
        out.write(&l, &r).unwrap();
    }
    assert_eq!(out.frames(), 9 * 256);
    assert!(out.peak() > 0.05);

    // A different MIDI channel is not heard.
    let mut other = Controller::new(ControllerConfig::from_yaml(&yaml).unwrap()).unwrap();
    other.midi_in(0, &[0x95, 57, 110]).unwrap();
    other.render_block(&mut l, &mut r);
    assert!(l.iter().all(|&s| s == 0.0));
}
