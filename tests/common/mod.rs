//! Helpers shared by the workspace integration tests: build instruments
//! from SFZ text and drive an engine with MIDI-style events.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kz_engine::{Engine, EngineConfig, Format, PreparedInstrument};
use kz_formats::{planar_to_wav, MemoryFiles, SfzLoader};
use kz_ir::{Event, EventKind, Instrument};

pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

/// Two seconds of a constant 0.5 signal, so levels are easy to compare.
pub fn dc_wav() -> Vec<u8> {
    let data = vec![0.5f32; 88200];
    planar_to_wav(&data, &data, 44100)
}

/// Load `sfz` as `/inst/test.sfz` next to `tone.wav` and any `extra` files.
pub fn instrument_with(sfz: &str, extra: &[(&str, &str)]) -> Arc<Instrument> {
    let mut files = MemoryFiles::new().with("/inst/test.sfz", sfz).with("/inst/tone.wav", dc_wav());
    for (path, text) in extra {
        files.insert(Path::new("/inst").join(path), *text);
    }
    let inst = SfzLoader::new(files).strict(true).load(Path::new("/inst/test.sfz")).unwrap();
    Arc::new(inst)
}

pub fn instrument(sfz: &str) -> Arc<Instrument> {
    instrument_with(sfz, &[])
}

/// One engine with one channel.
pub struct Rig {
    pub engine: Engine,
}

impl Rig {
    pub fn new(instrument: Arc<Instrument>) -> Self {
        Self::with_config(instrument, EngineConfig::default())
    }

    pub fn with_config(instrument: Arc<Instrument>, config: EngineConfig) -> Self {
        let mut engine = Engine::new(config, Format::Sfz).unwrap();
        let c = engine.add_channel();
        let prepared = PreparedInstrument::new(instrument, Format::Sfz, engine.config()).unwrap();
        engine.load_instrument(c, prepared).unwrap();
        Self { engine }
    }

    pub fn note_on(&mut self, key: u8, velocity: u8) {
        assert!(self.engine.send(Event::new(EventKind::NoteOn { key, velocity, midi_channel: 0 })));
    }

    pub fn note_off(&mut self, key: u8) {
        assert!(self.engine.send(Event::new(EventKind::NoteOff { key, velocity: 64, midi_channel: 0 })));
    }

    pub fn cc(&mut self, controller: u8, value: u8) {
        assert!(self.engine.send(Event::new(EventKind::ControlChange { controller, value, midi_channel: 0 })));
    }

    /// Render `frames` frames and return the left channel.
    pub fn render(&mut self, frames: usize) -> Vec<f32> {
        let mut l = vec![0.0; frames];
        let mut r = vec![0.0; frames];
        self.engine.render(&mut l, &mut r);
        l
    }

    /// Render `frames` frames and return the peak level.
    pub fn run(&mut self, frames: usize) -> f32 {
        self.render(frames).iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }

    pub fn voices(&self) -> usize {
        self.engine.active_voices()
    }

    pub fn controller(&self, cc: u8) -> u8 {
        self.engine.channel(0).unwrap().state().controller(cc)
    }
}
