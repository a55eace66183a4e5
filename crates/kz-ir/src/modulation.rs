//! Modulation definitions attached to regions: CC bindings, envelope and
//! LFO descriptions, equalizer bands.

use alloc::vec::Vec;

/// Number of controller slots tracked per channel.
///
/// Slots 0..=127 are MIDI CCs, 128 is channel pressure and 129 is the
/// pitch wheel scaled to 0..=127.
pub const CTRL_TABLE_SIZE: usize = 130;

/// Controller slot holding channel pressure.
pub const CTRL_CHANNEL_PRESSURE: u16 = 128;

/// Controller slot holding the scaled pitch wheel.
pub const CTRL_PITCH_BEND: u16 = 129;

/// One controller influencing a parameter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CcBinding {
    /// Controller slot (see [`CTRL_TABLE_SIZE`]).
    pub cc: u16,
    /// Value added at full controller deflection.
    pub influence: f32,
    /// Curve index, or -1 for a straight line.
    pub curve: i16,
    /// Smoothing time in milliseconds, 0 for none.
    pub smooth: f32,
    /// Quantization step, 0 for none.
    pub step: f32,
}

impl CcBinding {
    pub fn new(cc: u16, influence: f32) -> Self {
        Self { cc, influence, curve: -1, smooth: 0.0, step: 0.0 }
    }
}

/// All controllers influencing one parameter.
pub type CcList = Vec<CcBinding>;

/// Find or create the binding for `cc` in `list`.
pub fn binding_mut(list: &mut CcList, cc: u16) -> &mut CcBinding {
    let idx = match list.iter().position(|b| b.cc == cc) {
        Some(idx) => idx,
        None => {
            list.push(CcBinding::new(cc, 0.0));
            list.len() - 1
        }
    };
    &mut list[idx]
}

/// A classic delay/attack/hold/decay/sustain/release envelope description
/// (the `ampeg_*`, `fileg_*` and `pitcheg_*` opcode families).
#[derive(Clone, Debug, PartialEq)]
pub struct AdsrDefinition {
    pub delay: f32,
    /// Initial level in percent.
    pub start: f32,
    pub attack: f32,
    pub hold: f32,
    pub decay: f32,
    /// Sustain level in percent; negative means "derive from context".
    pub sustain: f32,
    pub release: f32,
    /// Modulation depth (cents for pitch and filter envelopes).
    pub depth: f32,

    pub vel2delay: f32,
    pub vel2attack: f32,
    pub vel2hold: f32,
    pub vel2decay: f32,
    pub vel2sustain: f32,
    pub vel2release: f32,
    pub vel2depth: f32,

    pub delay_oncc: CcList,
    pub start_oncc: CcList,
    pub attack_oncc: CcList,
    pub hold_oncc: CcList,
    pub decay_oncc: CcList,
    pub sustain_oncc: CcList,
    pub release_oncc: CcList,
    pub depth_oncc: CcList,
}

impl Default for AdsrDefinition {
    fn default() -> Self {
        Self {
            delay: 0.0,
            start: 0.0,
            attack: 0.0,
            hold: 0.0,
            decay: 0.0,
            sustain: 100.0,
            release: 0.0,
            depth: 0.0,
            vel2delay: 0.0,
            vel2attack: 0.0,
            vel2hold: 0.0,
            vel2decay: 0.0,
            vel2sustain: 0.0,
            vel2release: 0.0,
            vel2depth: 0.0,
            delay_oncc: Vec::new(),
            start_oncc: Vec::new(),
            attack_oncc: Vec::new(),
            hold_oncc: Vec::new(),
            decay_oncc: Vec::new(),
            sustain_oncc: Vec::new(),
            release_oncc: Vec::new(),
            depth_oncc: Vec::new(),
        }
    }
}

impl AdsrDefinition {
    /// Amplitude envelope defaults: sustain is left unresolved until the
    /// voice knows whether flex envelopes drive the volume.
    pub fn amplitude() -> Self {
        Self { sustain: -1.0, ..Self::default() }
    }
}

/// A fixed-shape LFO description (`amplfo_*`, `fillfo_*`, `pitchlfo_*`).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LfoV1Definition {
    pub delay: f32,
    pub freq: f32,
    pub fade: f32,
    pub depth: f32,
    pub delay_oncc: CcList,
    pub fade_oncc: CcList,
    pub freq_oncc: CcList,
    pub depth_oncc: CcList,
}

impl LfoV1Definition {
    /// An LFO without frequency and without frequency modulation never runs.
    pub fn is_active(&self) -> bool {
        self.freq > 0.0 || !self.freq_oncc.is_empty()
    }
}

/// One breakpoint of a flex envelope.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EgNode {
    /// Time to reach this node from the previous one, in seconds.
    pub time: f32,
    /// Target level 0..=1.
    pub level: f32,
    /// Segment curvature; 0 is linear.
    pub shape: f32,
    pub time_oncc: CcList,
    pub level_oncc: CcList,
}

/// Level below which a flex envelope volume contribution counts as unset.
pub const EG_VOLUME_UNSET: f32 = -144.0;

/// A flex envelope (`egN_*` opcodes).
#[derive(Clone, Debug, PartialEq)]
pub struct EgDefinition {
    pub nodes: Vec<EgNode>,
    /// Node index the envelope holds at until release.
    pub sustain: usize,
    pub amplitude: f32,
    /// Volume in dB; anything below -144 dB is unset.
    pub volume: f32,
    pub cutoff: f32,
    pub pitch: f32,
    pub resonance: f32,
    pub pan: f32,
    pub pan_curve: i16,
    pub amplitude_oncc: CcList,
    pub volume_oncc: CcList,
    pub cutoff_oncc: CcList,
    pub pitch_oncc: CcList,
    pub resonance_oncc: CcList,
    pub pan_oncc: CcList,
}

impl Default for EgDefinition {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            sustain: 0,
            amplitude: 0.0,
            volume: -200.0,
            cutoff: 0.0,
            pitch: 0.0,
            resonance: 0.0,
            pan: 0.0,
            pan_curve: -1,
            amplitude_oncc: Vec::new(),
            volume_oncc: Vec::new(),
            cutoff_oncc: Vec::new(),
            pitch_oncc: Vec::new(),
            resonance_oncc: Vec::new(),
            pan_oncc: Vec::new(),
        }
    }
}

impl EgDefinition {
    /// True if the envelope contributes to the voice amplitude.
    pub fn drives_volume(&self) -> bool {
        self.amplitude > 0.0
            || !self.amplitude_oncc.is_empty()
            || self.volume > -145.0
            || !self.volume_oncc.is_empty()
    }

    pub fn drives_cutoff(&self) -> bool {
        self.cutoff != 0.0 || !self.cutoff_oncc.is_empty()
    }

    pub fn drives_pitch(&self) -> bool {
        self.pitch != 0.0 || !self.pitch_oncc.is_empty()
    }

    pub fn drives_resonance(&self) -> bool {
        self.resonance != 0.0 || !self.resonance_oncc.is_empty()
    }

    pub fn drives_pan(&self) -> bool {
        self.pan != 0.0 || !self.pan_oncc.is_empty()
    }
}

/// LFO waveforms selectable through `lfoN_wave`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LfoWave {
    #[default]
    Triangle,
    Sine,
    Pulse75,
    Square,
    Pulse25,
    Pulse12,
    SawUp,
    SawDown,
}

impl LfoWave {
    /// Map an opcode index to a waveform; unknown indices fall back to triangle.
    pub fn from_index(index: i32) -> Self {
        match index {
            1 => LfoWave::Sine,
            2 => LfoWave::Pulse75,
            3 => LfoWave::Square,
            4 => LfoWave::Pulse25,
            5 => LfoWave::Pulse12,
            6 => LfoWave::SawUp,
            7 => LfoWave::SawDown,
            _ => LfoWave::Triangle,
        }
    }
}

/// A flex LFO (`lfoN_*` opcodes).
#[derive(Clone, Debug, PartialEq)]
pub struct LfoDefinition {
    /// Frequency in Hz; values <= 0 without `freq_oncc` disable the LFO.
    pub freq: f32,
    /// Start phase 0..=1.
    pub phase: f32,
    pub wave: LfoWave,
    pub delay: f32,
    pub fade: f32,
    pub volume: f32,
    pub pitch: f32,
    pub cutoff: f32,
    pub resonance: f32,
    pub pan: f32,
    pub freq_oncc: CcList,
    pub phase_oncc: CcList,
    pub delay_oncc: CcList,
    pub fade_oncc: CcList,
    pub volume_oncc: CcList,
    pub pitch_oncc: CcList,
    pub cutoff_oncc: CcList,
    pub resonance_oncc: CcList,
    pub pan_oncc: CcList,
}

impl Default for LfoDefinition {
    fn default() -> Self {
        Self {
            freq: -1.0,
            phase: 0.0,
            wave: LfoWave::Triangle,
            delay: 0.0,
            fade: 0.0,
            volume: 0.0,
            pitch: 0.0,
            cutoff: 0.0,
            resonance: 0.0,
            pan: 0.0,
            freq_oncc: Vec::new(),
            phase_oncc: Vec::new(),
            delay_oncc: Vec::new(),
            fade_oncc: Vec::new(),
            volume_oncc: Vec::new(),
            pitch_oncc: Vec::new(),
            cutoff_oncc: Vec::new(),
            resonance_oncc: Vec::new(),
            pan_oncc: Vec::new(),
        }
    }
}

impl LfoDefinition {
    pub fn is_active(&self) -> bool {
        self.freq > 0.0 || !self.freq_oncc.is_empty()
    }
}

/// One peaking band of the per-voice equalizer.
#[derive(Clone, Debug, PartialEq)]
pub struct EqBand {
    /// Center frequency in Hz.
    pub freq: f32,
    /// Bandwidth in octaves.
    pub bw: f32,
    /// Gain in dB.
    pub gain: f32,
    pub vel2freq: f32,
    pub vel2gain: f32,
    pub freq_oncc: CcList,
    pub bw_oncc: CcList,
    pub gain_oncc: CcList,
}

impl EqBand {
    pub fn new(freq: f32) -> Self {
        Self {
            freq,
            bw: 1.0,
            gain: 0.0,
            vel2freq: 0.0,
            vel2gain: 0.0,
            freq_oncc: Vec::new(),
            bw_oncc: Vec::new(),
            gain_oncc: Vec::new(),
        }
    }

    /// A band only needs processing when it can change the signal.
    pub fn is_active(&self) -> bool {
        self.gain != 0.0 || self.vel2gain != 0.0 || !self.gain_oncc.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_mut_reuses_existing_entry() {
        let mut list = CcList::new();
        binding_mut(&mut list, 7).influence = 6.0;
        binding_mut(&mut list, 7).curve = 2;
        binding_mut(&mut list, 11).influence = -3.0;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].influence, 6.0);
        assert_eq!(list[0].curve, 2);
    }

    #[test]
    fn unset_flex_eg_does_not_drive_volume() {
        let mut eg = EgDefinition::default();
        assert!(!eg.drives_volume());
        eg.volume = -6.0;
        assert!(eg.drives_volume());
    }

    #[test]
    fn lfo_wave_index_mapping() {
        assert_eq!(LfoWave::from_index(1), LfoWave::Sine);
        assert_eq!(LfoWave::from_index(7), LfoWave::SawDown);
        assert_eq!(LfoWave::from_index(42), LfoWave::Triangle);
    }
}
