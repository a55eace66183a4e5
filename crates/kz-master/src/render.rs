//! Offline rendering of an event list to audio.

use std::sync::Arc;

use kz_engine::{Engine, EngineConfig, Format, PreparedInstrument};
use kz_ir::{Event, EventKind, Instrument};
use tracing::{debug, info, warn};

use crate::ControllerError;

/// An event at a time in seconds from the start of the render.
#[derive(Clone, Debug, PartialEq)]
pub struct Cue {
    pub at: f64,
    pub kind: EventKind,
}

impl Cue {
    pub fn new(at: f64, kind: EventKind) -> Self {
        Self { at, kind }
    }

    /// Note-on at `at` and the matching note-off `length` seconds later,
    /// on MIDI channel 0.
    pub fn note(at: f64, key: u8, velocity: u8, length: f64) -> [Cue; 2] {
        [
            Cue::new(at, EventKind::NoteOn { key, velocity, midi_channel: 0 }),
            Cue::new(at + length, EventKind::NoteOff { key, velocity: 64, midi_channel: 0 }),
        ]
    }

    pub fn controller(at: f64, controller: u8, value: u8) -> Cue {
        Cue::new(at, EventKind::ControlChange { controller, value, midi_channel: 0 })
    }
}

/// Planar stereo audio produced by [`render`].
#[derive(Clone, Debug, Default)]
pub struct Rendered {
    pub sample_rate: u32,
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

impl Rendered {
    pub fn frames(&self) -> usize {
        self.left.len()
    }

    pub fn peak(&self) -> f32 {
        self.left.iter().chain(&self.right).fold(0.0f32, |m, s| m.max(s.abs()))
    }

    /// Encode as 16-bit stereo WAV.
    pub fn to_wav(&self) -> Vec<u8> {
        kz_formats::planar_to_wav(&self.left, &self.right, self.sample_rate)
    }
}

/// Options for [`render`].
#[derive(Clone, Debug)]
pub struct RenderOptions {
    pub config: EngineConfig,
    pub format: Format,
    /// Seconds rendered after the last cue.
    pub tail: f64,
    /// Random seed, for reproducible output.
    pub seed: u64,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self { config: EngineConfig::default(), format: Format::Sfz, tail: 2.0, seed: 0 }
    }
}

/// Play `cues` through a fresh engine with `instrument` on one channel.
///
/// Cues are delivered at their exact frame within the fragment that
/// contains them.
pub fn render(instrument: Arc<Instrument>, cues: &[Cue], options: &RenderOptions) -> Result<Rendered, ControllerError> {
    let config = &options.config;
    let rate = config.sample_rate;
    let mut engine = Engine::new(config.clone(), options.format)?;
    engine.reseed(options.seed);
    let channel = engine.add_channel();
    let prepared = PreparedInstrument::new(instrument, options.format, config)?;
    engine.load_instrument(channel, prepared)?;

    let mut cues: Vec<(u64, &Cue)> = cues.iter().map(|c| ((c.at.max(0.0) * rate as f64) as u64, c)).collect();
    cues.sort_by_key(|(frame, _)| *frame);
    let last = cues.last().map_or(0, |(frame, _)| *frame);
    let total = last + (options.tail.max(0.0) * rate as f64) as u64;
    info!(cues = cues.len(), frames = total, sample_rate = rate, "rendering");

    let block = config.max_fragment_frames as u64;
    let mut out = Rendered {
        sample_rate: rate,
        left: vec![0.0; total as usize],
        right: vec![0.0; total as usize],
    };
    let mut next = 0;
    let mut start = 0u64;
    while start < total {
        let n = (total - start).min(block);
        while next < cues.len() && cues[next].0 < start + n {
            let (frame, cue) = cues[next];
            let event = Event::new(cue.kind.clone()).on_channel(channel).at((frame - start) as u32);
            if !engine.send(event) {
                warn!(at = cue.at, "event buffer full, cue dropped");
            }
            next += 1;
        }
        let range = start as usize..(start + n) as usize;
        engine.render(&mut out.left[range.clone()], &mut out.right[range]);
        start += n;
    }
    debug!(voices = engine.active_voices(), "render finished");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kz_ir::{Region, Sample, SampleData};

    fn square_instrument() -> Arc<Instrument> {
        let mut inst = Instrument::new("square");
        let mut sample = Sample::new("square");
        let data: Vec<i16> = (0..4410).map(|i| if (i / 50) % 2 == 0 { 16000 } else { -16000 }).collect();
        sample.data = SampleData::Mono16(data);
        let key = inst.samples.insert(sample);
        inst.regions.push(Region { sample: Some(key), ..Region::default() });
        Arc::new(inst)
    }

    #[test]
    fn silence_without_cues() {
        let options = RenderOptions { tail: 0.1, ..RenderOptions::default() };
        let out = render(square_instrument(), &[], &options).unwrap();
        assert_eq!(out.frames(), 4410);
        assert_eq!(out.peak(), 0.0);
    }

    #[test]
    fn note_starts_at_its_cue() {
        let options = RenderOptions { tail: 0.2, ..RenderOptions::default() };
        let cues = Cue::note(0.05, 60, 127, 0.05);
        let out = render(square_instrument(), &cues, &options).unwrap();
        let onset = (0.05 * 44100.0) as usize;
        assert!(out.left[..onset].iter().all(|&s| s == 0.0));
        assert!(out.peak() > 0.05);
        assert_eq!(out.frames(), 4410 + 8820);
    }

    #[test]
    fn same_seed_same_output() {
        let options = RenderOptions { tail: 0.1, seed: 7, ..RenderOptions::default() };
        let cues = Cue::note(0.0, 64, 90, 0.05);
        let a = render(square_instrument(), &cues, &options).unwrap();
        let b = render(square_instrument(), &cues, &options).unwrap();
        assert_eq!(a.left, b.left);
        assert_eq!(a.to_wav(), b.to_wav());
    }
}
