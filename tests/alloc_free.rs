//! Allocation-free render path tests.
//!
//! Instruments are loaded and prepared up front; everything after that,
//! note traffic, controller sweeps and script callbacks included, runs
//! inside `assert_no_alloc` and aborts on any heap allocation.
//!
//! Just run `cargo test`, no feature flags needed.

mod common;

use std::sync::Arc;

use assert_no_alloc::{assert_no_alloc, AllocDisabler};
use kz_engine::{Engine, EngineConfig, Format, PreparedInstrument};
use kz_ir::{Event, EventKind, Instrument};

#[cfg(debug_assertions)]
#[global_allocator]
static A: AllocDisabler = AllocDisabler;

fn engine_for(instrument: Arc<Instrument>) -> Engine {
    let mut engine = Engine::new(EngineConfig::default(), Format::Sfz).unwrap();
    let c = engine.add_channel();
    let prepared = PreparedInstrument::new(instrument, Format::Sfz, engine.config()).unwrap();
    engine.load_instrument(c, prepared).unwrap();
    engine
}

/// Play a chord pattern with pedal and modulation for `blocks` blocks of
/// 256 frames, aborting on any heap allocation.
fn assert_render_alloc_free(mut engine: Engine, blocks: usize) {
    let mut left = vec![0.0f32; 256];
    let mut right = vec![0.0f32; 256];

    assert_no_alloc(|| {
        for block in 0..blocks {
            let key = 40 + (block % 48) as u8;
            match block % 8 {
                0 => {
                    for k in [key, key + 4, key + 7] {
                        engine.send(Event::new(EventKind::NoteOn { key: k, velocity: 100, midi_channel: 0 }).at(17));
                    }
                }
                3 => {
                    engine.send(Event::new(EventKind::ControlChange {
                        controller: 64,
                        value: if block % 16 == 3 { 127 } else { 0 },
                        midi_channel: 0,
                    }));
                }
                5 => {
                    let k = 40 + ((block - 5) % 48) as u8;
                    for k in [k, k + 4, k + 7] {
                        engine.send(Event::new(EventKind::NoteOff { key: k, velocity: 64, midi_channel: 0 }).at(200));
                    }
                }
                _ => {
                    let value = (block * 13 % 128) as u8;
                    engine.send(Event::new(EventKind::ControlChange { controller: 1, value, midi_channel: 0 }));
                }
            }
            engine.render(&mut left, &mut right);
        }
    });
}

#[test]
fn fixture_instrument_alloc_free() {
    let inst = kz_formats::load_sfz(common::fixtures_dir().join("sfz/keys.sfz")).unwrap();
    assert_render_alloc_free(engine_for(Arc::new(inst)), 44100 * 5 / 256);
}

#[test]
fn scripted_instrument_alloc_free() {
    let script = "on init\n  declare $n\nend on\n\
                  on note\n  $n := $n + 1\n  play_note($EVENT_NOTE + 12, 80, 0, 50000)\n  wait(10000)\n  change_vol($EVENT_ID, -3000)\nend on\n\
                  on release\n  play_note($EVENT_NOTE, 40, 0, 20000)\nend on\n\
                  on controller\n  if ($CC_NUM = 1)\n    ignore_controller()\n  end if\nend on\n";
    let inst = common::instrument_with(
        "<control> script=s.txt
         <region> sample=tone.wav ampeg_release=0.05 lfo1_freq=5 lfo1_pitch=20
         <region> sample=tone.wav trigger=release volume=-12",
        &[("s.txt", script)],
    );
    assert_render_alloc_free(engine_for(inst), 44100 * 5 / 256);
}
