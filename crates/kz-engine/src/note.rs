//! Notes: one sounding musical event owning the voices it started, plus
//! the parameter overrides scripts apply on top of region values.

use arrayvec::ArrayVec;
use kz_ir::SynthParam;

use crate::pool::PoolId;
use crate::scheduler::SchedTime;
use crate::units::UnitOverrides;

/// Voices (layers) one note can own.
pub const MAX_NOTE_VOICES: usize = 16;

/// Polyphonic script variables one note carries.
pub const NOTE_POLY_VARS: usize = 32;

/// Default transition time for volume, pitch and pan overrides, in seconds.
pub const DEFAULT_NOTE_PARAM_TIME: f32 = 0.013;

/// Shape of an override transition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FadeCurve {
    Linear,
    #[default]
    EaseInEaseOut,
}

impl FadeCurve {
    /// Script curve constants: 0 linear, 1 ease-in-ease-out.
    pub fn from_script(value: i64) -> Option<Self> {
        match value {
            0 => Some(FadeCurve::Linear),
            1 => Some(FadeCurve::EaseInEaseOut),
            _ => None,
        }
    }
}

/// A value moving towards a target over a number of modulation steps.
///
/// The ease-in-ease-out curve is half a cosine, advanced as a rotating
/// phasor so each step costs a few multiplications.
#[derive(Clone, Copy, Debug)]
pub struct NoteFade {
    value: f32,
    end: f32,
    steps: u32,
    curve: FadeCurve,
    coeff: f32,
    real: f32,
    imag: f32,
    half_span: f32,
    center: f32,
    /// Transition time used when none is given.
    pub default_time: f32,
}

impl Default for NoteFade {
    fn default() -> Self {
        Self {
            value: 1.0,
            end: 1.0,
            steps: 0,
            curve: FadeCurve::EaseInEaseOut,
            coeff: 0.0,
            real: 1.0,
            imag: 0.0,
            half_span: 0.0,
            center: 1.0,
            default_time: DEFAULT_NOTE_PARAM_TIME,
        }
    }
}

impl NoteFade {
    pub fn new(value: f32, time: f32, curve: FadeCurve) -> Self {
        Self { value, end: value, default_time: time, curve, ..Self::default() }
    }

    /// Jump to `value` immediately.
    pub fn set(&mut self, value: f32) {
        self.value = value;
        self.end = value;
        self.steps = 0;
    }

    pub fn set_curve(&mut self, curve: FadeCurve) {
        self.curve = curve;
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn target(&self) -> f32 {
        self.end
    }

    pub fn is_fading(&self) -> bool {
        self.steps > 0
    }

    /// Move to `end` over `time` seconds at `rate` steps per second.
    pub fn fade_to(&mut self, end: f32, time: f32, rate: f32) {
        let steps = (time * rate) as u32;
        if steps == 0 {
            self.set(end);
            return;
        }
        self.end = end;
        self.steps = steps;
        match self.curve {
            FadeCurve::Linear => self.coeff = (end - self.value) / steps as f32,
            FadeCurve::EaseInEaseOut => {
                self.coeff = core::f32::consts::PI / steps as f32;
                self.half_span = (self.value - end) * 0.5;
                self.center = end + self.half_span;
                self.real = 1.0;
                self.imag = 0.0;
            }
        }
    }

    /// Move to `end` over the default time.
    pub fn fade_to_default(&mut self, end: f32, rate: f32) {
        self.fade_to(end, self.default_time, rate);
    }

    /// Advance one step and return the new value.
    pub fn render(&mut self) -> f32 {
        if self.steps == 0 {
            self.value = self.end;
            return self.value;
        }
        self.steps -= 1;
        match self.curve {
            FadeCurve::Linear => self.value += self.coeff,
            FadeCurve::EaseInEaseOut => {
                self.real -= self.coeff * self.imag;
                self.imag += self.coeff * self.real;
                self.value = self.center + self.real * self.half_span;
            }
        }
        if self.steps == 0 {
            self.value = self.end;
        }
        self.value
    }
}

/// Parameter overrides of a note. Ratios are 1.0 when neutral.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NoteOverrides {
    pub volume: f32,
    pub volume_time: f32,
    pub volume_curve: FadeCurve,
    pub pitch: f32,
    pub pitch_time: f32,
    pub pitch_curve: FadeCurve,
    /// -1 (left) ..= 1 (right).
    pub pan: f32,
    pub pan_time: f32,
    pub pan_curve: FadeCurve,
    /// Number of relative pan changes averaged into `pan`.
    pub pan_sources: u32,
    pub cutoff: f32,
    pub resonance: f32,
    pub units: UnitOverrides,
    /// Playback start in microseconds, negative for the region default.
    pub sample_offset: i64,
}

impl Default for NoteOverrides {
    fn default() -> Self {
        Self {
            volume: 1.0,
            volume_time: DEFAULT_NOTE_PARAM_TIME,
            volume_curve: FadeCurve::default(),
            pitch: 1.0,
            pitch_time: DEFAULT_NOTE_PARAM_TIME,
            pitch_curve: FadeCurve::default(),
            pan: 0.0,
            pan_time: DEFAULT_NOTE_PARAM_TIME,
            pan_curve: FadeCurve::default(),
            pan_sources: 0,
            cutoff: 1.0,
            resonance: 1.0,
            units: UnitOverrides::default(),
            sample_offset: -1,
        }
    }
}

impl NoteOverrides {
    /// Apply a parameter change. Relative changes multiply ratios; relative
    /// pan changes are averaged with earlier ones.
    pub fn apply(&mut self, param: SynthParam, value: f32, relative: bool) {
        fn scale(slot: &mut f32, value: f32, relative: bool) {
            if relative {
                *slot *= value;
            } else {
                *slot = value;
            }
        }
        let curve = || if value >= 0.5 { FadeCurve::EaseInEaseOut } else { FadeCurve::Linear };
        let u = &mut self.units;
        match param {
            SynthParam::Volume => scale(&mut self.volume, value, relative),
            SynthParam::VolumeTime => self.volume_time = value.max(0.0),
            SynthParam::VolumeCurve => self.volume_curve = curve(),
            SynthParam::Pitch => scale(&mut self.pitch, value, relative),
            SynthParam::PitchTime => self.pitch_time = value.max(0.0),
            SynthParam::PitchCurve => self.pitch_curve = curve(),
            SynthParam::Pan => {
                if relative {
                    self.pan_sources += 1;
                    let n = self.pan_sources as f32;
                    self.pan = (self.pan * (n - 1.0) + value) / n;
                } else {
                    self.pan = value;
                    self.pan_sources = 1;
                }
                self.pan = self.pan.clamp(-1.0, 1.0);
            }
            SynthParam::PanTime => self.pan_time = value.max(0.0),
            SynthParam::PanCurve => self.pan_curve = curve(),
            SynthParam::Cutoff => scale(&mut self.cutoff, value, relative),
            SynthParam::Resonance => scale(&mut self.resonance, value, relative),
            SynthParam::Attack => scale(&mut u.attack, value, relative),
            SynthParam::Decay => scale(&mut u.decay, value, relative),
            SynthParam::Sustain => scale(&mut u.sustain, value, relative),
            SynthParam::Release => scale(&mut u.release, value, relative),
            SynthParam::AmpLfoDepth => scale(&mut u.amp_lfo_depth, value, relative),
            SynthParam::AmpLfoFreq => scale(&mut u.amp_lfo_freq, value, relative),
            SynthParam::CutoffLfoDepth => scale(&mut u.cutoff_lfo_depth, value, relative),
            SynthParam::CutoffLfoFreq => scale(&mut u.cutoff_lfo_freq, value, relative),
            SynthParam::PitchLfoDepth => scale(&mut u.pitch_lfo_depth, value, relative),
            SynthParam::PitchLfoFreq => scale(&mut u.pitch_lfo_freq, value, relative),
        }
    }
}

/// One sounding note.
#[derive(Clone, Debug, Default)]
pub struct Note {
    /// Key that started the note; key-switch and release bookkeeping use it.
    pub host_key: u8,
    /// Key the voices play; scripts may change it while the note is new.
    pub key: u8,
    pub velocity: u8,
    pub channel: u16,
    /// Note that spawned this one through `play_note`.
    pub parent: Option<PoolId>,
    pub voices: ArrayVec<PoolId, MAX_NOTE_VOICES>,
    pub overrides: NoteOverrides,
    /// Scheduling time the note was started at.
    pub trigger_time: SchedTime,
    /// Started by a script rather than a key; key releases leave it alone.
    pub by_script: bool,
    /// `$EVENT_PAR_0` ..= `$EVENT_PAR_3`.
    pub user_par: [i64; 4],
    /// Polyphonic variables of the channel script.
    pub poly_vars: [i64; NOTE_POLY_VARS],
    pub released: bool,
    /// Voices have been launched; the note can no longer be retargeted.
    pub launched: bool,
    /// Other keys were held when the note started.
    pub legato: bool,
    /// Fades requested before launch, applied to the launched voices.
    pub fade_in: Option<f32>,
    pub fade_out: Option<(f32, bool)>,
}

impl Note {
    pub fn new(host_key: u8, velocity: u8, channel: u16, trigger_time: SchedTime) -> Self {
        Self { host_key, key: host_key, velocity, channel, trigger_time, ..Self::default() }
    }

    /// True during the scheduling instant the note was created in.
    pub fn is_new(&self, now: SchedTime) -> bool {
        !self.launched && self.trigger_time == now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_fade_reaches_target() {
        let mut f = NoteFade::new(1.0, 0.1, FadeCurve::Linear);
        f.fade_to(0.0, 0.01, 1000.0);
        let vals: Vec<f32> = (0..10).map(|_| f.render()).collect();
        assert!((vals[4] - 0.5).abs() < 1e-5);
        assert_eq!(vals[9], 0.0);
        assert!(!f.is_fading());
    }

    #[test]
    fn eased_fade_is_monotonic() {
        let mut f = NoteFade::new(0.0, 0.1, FadeCurve::EaseInEaseOut);
        f.fade_to(1.0, 0.02, 1000.0);
        let vals: Vec<f32> = (0..20).map(|_| f.render()).collect();
        assert!(vals.windows(2).all(|w| w[1] >= w[0] - 1e-4));
        // Slow start, fast middle.
        assert!(vals[0] < 0.05);
        assert!((vals[9] - 0.5).abs() < 0.1);
        assert_eq!(vals[19], 1.0);
    }

    #[test]
    fn zero_time_jumps() {
        let mut f = NoteFade::default();
        f.fade_to(0.25, 0.0, 1000.0);
        assert_eq!(f.value(), 0.25);
        assert_eq!(f.render(), 0.25);
    }

    #[test]
    fn relative_changes_multiply() {
        let mut o = NoteOverrides::default();
        o.apply(SynthParam::Volume, 0.5, false);
        o.apply(SynthParam::Volume, 0.5, true);
        assert_eq!(o.volume, 0.25);
        o.apply(SynthParam::AmpLfoFreq, 2.0, true);
        assert_eq!(o.units.amp_lfo_freq, 2.0);
    }

    #[test]
    fn relative_pan_averages() {
        let mut o = NoteOverrides::default();
        o.apply(SynthParam::Pan, 1.0, false);
        o.apply(SynthParam::Pan, -1.0, true);
        assert_eq!(o.pan, 0.0);
    }

    #[test]
    fn note_is_new_until_launched() {
        let mut n = Note::new(60, 100, 0, 480);
        assert!(n.is_new(480));
        assert!(!n.is_new(481));
        n.launched = true;
        assert!(!n.is_new(480));
    }
}
