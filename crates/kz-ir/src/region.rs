//! Regions: immutable key/velocity/controller zones of an instrument.

use alloc::string::String;
use alloc::vec::Vec;
use core::ops::BitOr;

use crate::modulation::{AdsrDefinition, CcList, EgDefinition, EqBand, LfoDefinition, LfoV1Definition};
use crate::sample::{Sample, SampleKey};

/// Conditions under which a region may start a voice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Trigger(u8);

impl Trigger {
    pub const NONE: Trigger = Trigger(0);
    /// Any note-on.
    pub const ATTACK: Trigger = Trigger(1 << 0);
    /// Note-off (release trigger samples).
    pub const RELEASE: Trigger = Trigger(1 << 1);
    /// Note-on with no other key held.
    pub const FIRST: Trigger = Trigger(1 << 2);
    /// Note-on while another key is held.
    pub const LEGATO: Trigger = Trigger(1 << 3);
    /// Note-off of the key itself, ignoring the sustain pedal.
    pub const RELEASE_KEY: Trigger = Trigger(1 << 4);

    pub fn bits(self) -> u8 {
        self.0
    }

    /// True if any condition in `other` is also in `self`.
    pub fn intersects(self, other: Trigger) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Trigger {
    type Output = Trigger;

    fn bitor(self, rhs: Trigger) -> Trigger {
        Trigger(self.0 | rhs.0)
    }
}

/// How a voice reacts when another region's group silences it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OffMode {
    /// Fade out within the fast-kill step bound.
    #[default]
    Fast,
    /// Enter the release stage as for a note-off.
    Normal,
}

/// Region loop behaviour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoopMode {
    /// Use whatever the sample file declares.
    #[default]
    Unset,
    NoLoop,
    /// Play to the end ignoring note-off.
    OneShot,
    Continuous,
    /// Loop until release, then play out.
    Sustain,
}

/// Cross-fade curve shape.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum XfCurve {
    Gain,
    /// Equal-power (sine-shaped) fade.
    #[default]
    Power,
}

/// Which velocity feeds the key-switch velocity lookup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SwVel {
    #[default]
    Current,
    Previous,
}

/// Per-voice filter type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterType {
    Lpf1p,
    Hpf1p,
    #[default]
    Lpf2p,
    Hpf2p,
    Bpf2p,
    Brf2p,
}

/// A controller range taking part in a cross-fade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XfCcRange {
    pub cc: u16,
    pub lo: u8,
    pub hi: u8,
}

/// One zone of an instrument.
///
/// Regions are built by a loader and never change afterwards; voices only
/// read them. Mutable matching state such as round-robin counters lives
/// with the engine channel, indexed by region position.
#[derive(Clone, Debug)]
pub struct Region {
    // === Sample playback ===
    pub sample: Option<SampleKey>,
    /// Sample name as written in the instrument file.
    pub sample_name: String,
    pub offset: u32,
    pub offset_random: u32,
    pub offset_oncc: CcList,
    /// Last frame to play, 0 for the sample end.
    pub end: u32,
    pub count: Option<u32>,
    pub loop_mode: LoopMode,
    pub loop_start: Option<u32>,
    pub loop_end: Option<u32>,
    /// Delay before the voice starts, in seconds.
    pub delay: f32,
    pub delay_random: f32,
    pub delay_samples: u32,
    pub delay_oncc: CcList,
    pub delay_samples_oncc: CcList,

    // === Input controls ===
    pub lochan: u8,
    pub hichan: u8,
    /// -1 removes the region from note triggering.
    pub lokey: i16,
    /// -1 means "no upper bound" and marks a CC-triggered region.
    pub hikey: i16,
    pub lovel: u8,
    pub hivel: u8,
    pub lobend: i16,
    pub hibend: i16,
    pub lobpm: f32,
    pub hibpm: f32,
    pub lochanaft: u8,
    pub hichanaft: u8,
    pub lopolyaft: u8,
    pub hipolyaft: u8,
    pub loprog: u8,
    pub hiprog: u8,
    pub lorand: f32,
    pub hirand: f32,
    pub lotimer: f32,
    pub hitimer: f32,
    pub seq_length: u32,
    pub seq_position: u32,
    pub locc: [u8; 128],
    pub hicc: [u8; 128],
    pub on_locc: [i16; 128],
    pub on_hicc: [i16; 128],
    pub sw_lokey: i16,
    pub sw_hikey: i16,
    pub sw_last: i16,
    pub sw_down: i16,
    pub sw_up: i16,
    pub sw_previous: i16,
    pub sw_vel: SwVel,
    pub trigger: Trigger,
    pub group: u32,
    pub off_by: u32,
    pub off_mode: OffMode,

    // === Amplifier ===
    /// Volume in dB.
    pub volume: f32,
    /// Amplitude in percent.
    pub amplitude: f32,
    /// Pan -100..=100.
    pub pan: f32,
    pub width: f32,
    pub position: f32,
    pub amp_keytrack: f32,
    pub amp_keycenter: u8,
    pub amp_veltrack: f32,
    pub amp_random: f32,
    /// Release trigger attenuation in dB per second of note length.
    pub rt_decay: f32,
    pub volume_oncc: CcList,
    pub amplitude_oncc: CcList,
    pub pan_oncc: CcList,
    pub xfin_lokey: u8,
    pub xfin_hikey: u8,
    pub xfout_lokey: u8,
    pub xfout_hikey: u8,
    pub xf_keycurve: XfCurve,
    pub xfin_lovel: u8,
    pub xfin_hivel: u8,
    pub xfout_lovel: u8,
    pub xfout_hivel: u8,
    pub xf_velcurve: XfCurve,
    pub xfin_cc: Vec<XfCcRange>,
    pub xfout_cc: Vec<XfCcRange>,
    pub xf_cccurve: XfCurve,

    // === Pitch ===
    pub transpose: i32,
    pub tune: i32,
    pub pitch_keycenter: i16,
    pub pitch_keytrack: i32,
    pub pitch_veltrack: i32,
    pub pitch_random: i32,
    pub bend_up: i32,
    pub bend_down: i32,
    pub pitch_oncc: CcList,

    // === Filter ===
    pub fil_type: FilterType,
    /// Cutoff in Hz; no filter runs when unset.
    pub cutoff: Option<f32>,
    pub cutoff_oncc: CcList,
    pub resonance: f32,
    pub resonance_oncc: CcList,
    pub fil_keytrack: i32,
    pub fil_keycenter: u8,
    pub fil_veltrack: i32,
    pub fil_random: i32,

    // === Equalizer ===
    pub eq: [EqBand; 3],

    // === Fixed envelopes and LFOs ===
    pub ampeg: AdsrDefinition,
    pub fileg: AdsrDefinition,
    pub pitcheg: AdsrDefinition,
    pub amplfo: LfoV1Definition,
    pub fillfo: LfoV1Definition,
    pub pitchlfo: LfoV1Definition,

    // === Flex envelopes and LFOs ===
    pub egs: Vec<EgDefinition>,
    pub lfos: Vec<LfoDefinition>,
}

impl Default for Region {
    fn default() -> Self {
        Self {
            sample: None,
            sample_name: String::new(),
            offset: 0,
            offset_random: 0,
            offset_oncc: Vec::new(),
            end: 0,
            count: None,
            loop_mode: LoopMode::Unset,
            loop_start: None,
            loop_end: None,
            delay: 0.0,
            delay_random: 0.0,
            delay_samples: 0,
            delay_oncc: Vec::new(),
            delay_samples_oncc: Vec::new(),

            lochan: 1,
            hichan: 16,
            lokey: 0,
            hikey: 127,
            lovel: 0,
            hivel: 127,
            lobend: -8192,
            hibend: 8192,
            lobpm: 0.0,
            hibpm: 500.0,
            lochanaft: 0,
            hichanaft: 127,
            lopolyaft: 0,
            hipolyaft: 127,
            loprog: 0,
            hiprog: 127,
            lorand: 0.0,
            hirand: 1.0,
            lotimer: 0.0,
            hitimer: 0.0,
            seq_length: 1,
            seq_position: 1,
            locc: [0; 128],
            hicc: [127; 128],
            on_locc: [-1; 128],
            on_hicc: [-1; 128],
            sw_lokey: -1,
            sw_hikey: -1,
            sw_last: -1,
            sw_down: -1,
            sw_up: -1,
            sw_previous: -1,
            sw_vel: SwVel::Current,
            trigger: Trigger::ATTACK,
            group: 0,
            off_by: 0,
            off_mode: OffMode::Fast,

            volume: 0.0,
            amplitude: 100.0,
            pan: 0.0,
            width: 100.0,
            position: 0.0,
            amp_keytrack: 0.0,
            amp_keycenter: 60,
            amp_veltrack: 100.0,
            amp_random: 0.0,
            rt_decay: 0.0,
            volume_oncc: Vec::new(),
            amplitude_oncc: Vec::new(),
            pan_oncc: Vec::new(),
            xfin_lokey: 0,
            xfin_hikey: 0,
            xfout_lokey: 127,
            xfout_hikey: 127,
            xf_keycurve: XfCurve::Power,
            xfin_lovel: 0,
            xfin_hivel: 0,
            xfout_lovel: 127,
            xfout_hivel: 127,
            xf_velcurve: XfCurve::Power,
            xfin_cc: Vec::new(),
            xfout_cc: Vec::new(),
            xf_cccurve: XfCurve::Power,

            transpose: 0,
            tune: 0,
            pitch_keycenter: 60,
            pitch_keytrack: 100,
            pitch_veltrack: 0,
            pitch_random: 0,
            bend_up: 200,
            bend_down: -200,
            pitch_oncc: Vec::new(),

            fil_type: FilterType::Lpf2p,
            cutoff: None,
            cutoff_oncc: Vec::new(),
            resonance: 0.0,
            resonance_oncc: Vec::new(),
            fil_keytrack: 0,
            fil_keycenter: 60,
            fil_veltrack: 0,
            fil_random: 0,

            eq: [EqBand::new(50.0), EqBand::new(500.0), EqBand::new(5000.0)],

            ampeg: AdsrDefinition::amplitude(),
            fileg: AdsrDefinition::default(),
            pitcheg: AdsrDefinition::default(),
            amplfo: LfoV1Definition::default(),
            fillfo: LfoV1Definition::default(),
            pitchlfo: LfoV1Definition::default(),

            egs: Vec::new(),
            lfos: Vec::new(),
        }
    }
}

impl Region {
    /// True if the region loops, resolving `Unset` against the sample file.
    pub fn has_loop(&self, sample: &Sample) -> bool {
        let looped = match self.loop_mode {
            LoopMode::Unset => sample.has_loop(),
            LoopMode::Continuous | LoopMode::Sustain => true,
            LoopMode::NoLoop | LoopMode::OneShot => false,
        };
        looped && self.loop_end(sample) > self.loop_start(sample)
    }

    pub fn loop_start(&self, sample: &Sample) -> u32 {
        self.loop_start.unwrap_or(sample.loop_start)
    }

    pub fn loop_end(&self, sample: &Sample) -> u32 {
        self.loop_end.unwrap_or(sample.loop_end)
    }

    /// Number of loop iterations, 0 for endless.
    pub fn loop_count(&self) -> u32 {
        self.count.unwrap_or(0)
    }

    /// True if controller `cc` can start this region.
    pub fn is_cc_triggered(&self, cc: u8) -> bool {
        let cc = cc as usize;
        self.hikey < 0 && cc < 128 && self.on_locc[cc] >= 0 && self.on_hicc[cc] >= 0
    }

    /// True if this region reacts to key-switch keys at all.
    pub fn uses_key_switches(&self) -> bool {
        self.sw_last != -1 || self.sw_down != -1 || self.sw_up != -1 || self.sw_previous != -1
    }

    /// True if the per-voice equalizer has work to do.
    pub fn has_eq(&self) -> bool {
        self.eq.iter().any(EqBand::is_active)
    }
}
