//! Instrument scripts loaded through `script=` and run by the engine.

mod common;

use common::{instrument_with, Rig};
use kz_engine::{EngineConfig, EngineError, Format, PreparedInstrument, ProgramCache};

fn scripted(source: &str) -> Rig {
    Rig::new(instrument_with("<control> script=s.txt <region> sample=tone.wav", &[("s.txt", source)]))
}

#[test]
fn ignore_event_silences_the_key() {
    let mut rig = scripted("on note\n  ignore_event()\nend on\n");
    rig.note_on(60, 100);
    assert_eq!(rig.run(512), 0.0);
    assert_eq!(rig.voices(), 0);
}

#[test]
fn play_note_layers_an_octave() {
    let mut rig = scripted("on note\n  play_note($EVENT_NOTE + 12, $EVENT_VELOCITY)\nend on\n");
    rig.note_on(60, 100);
    let mut plain = Rig::new(common::instrument("<region> sample=tone.wav"));
    plain.note_on(60, 100);
    let single = plain.run(512);
    let layered = rig.run(512);
    assert_eq!(rig.voices(), 2);
    assert!(layered > single * 1.5, "single {single} layered {layered}");
}

#[test]
fn set_controller_reaches_the_channel() {
    let mut rig = scripted("on note\n  set_controller(1, 77)\nend on\n");
    assert_eq!(rig.controller(1), 0);
    rig.note_on(60, 100);
    rig.run(256);
    rig.run(256);
    assert_eq!(rig.controller(1), 77);
}

#[test]
fn wait_delays_a_played_note() {
    let mut rig = scripted("on note\n  ignore_event()\n  wait(50000)\n  play_note(64, 100)\nend on\n");
    rig.note_on(60, 100);
    assert_eq!(rig.run(512), 0.0);
    // 50 ms is about 2205 frames at 44.1 kHz.
    for _ in 0..5 {
        rig.run(512);
    }
    assert_eq!(rig.voices(), 1);
    assert!(rig.run(512) > 0.1);
}

#[test]
fn long_loop_is_spread_over_fragments() {
    let source = "on init\n  declare $i\nend on\n\
                  on note\n  ignore_event()\n  $i := 0\n  while ($i < 3000)\n    $i := $i + 1\n  end while\n  play_note(64, 100)\nend on\n";
    let config = EngineConfig { script_instructions_per_slice: 1000, ..EngineConfig::default() };
    let inst = instrument_with("<control> script=s.txt <region> sample=tone.wav", &[("s.txt", source)]);
    let mut rig = Rig::with_config(inst, config);

    rig.note_on(60, 100);
    rig.run(64);
    assert_eq!(rig.voices(), 0);

    let mut fragments = 1;
    while rig.voices() == 0 && fragments < 500 {
        rig.run(64);
        fragments += 1;
    }
    assert_eq!(rig.voices(), 1);
    assert!(fragments > 3, "loop finished after {fragments} fragments");
}

#[test]
fn compile_error_rejects_the_instrument() {
    let inst = instrument_with(
        "<control> script=s.txt <region> sample=tone.wav",
        &[("s.txt", "on note\n  $x := \nend on\n")],
    );
    let err = PreparedInstrument::new(inst, Format::Sfz, &EngineConfig::default()).err();
    assert!(matches!(err, Some(EngineError::Script(_))), "{err:?}");
}

#[test]
fn channels_share_compiled_programs() {
    let source = "on note\n  play_note($EVENT_NOTE + 7, 90)\nend on\n";
    let a = instrument_with("<control> script=s.txt <region> sample=tone.wav", &[("s.txt", source)]);
    let b = instrument_with("<control> script=s.txt <region> sample=tone.wav lokey=0 hikey=64", &[("s.txt", source)]);
    let config = EngineConfig::default();
    let cache = ProgramCache::new();

    let first = PreparedInstrument::with_cache(a, Format::Sfz, &config, &cache).unwrap();
    let second = PreparedInstrument::with_cache(b, Format::Sfz, &config, &cache).unwrap();
    assert_eq!(cache.len(), 1);

    drop((first, second));
    assert!(cache.is_empty());
}
