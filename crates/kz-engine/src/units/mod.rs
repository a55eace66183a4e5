//! Per-voice modulation units.
//!
//! Every voice owns one [`Rack`]. The rack is triggered once when the voice
//! starts and then advanced once per modulation step (a fixed number of
//! audio frames). Units are evaluated in a fixed order so that controller
//! smoothers run before the units reading them, LFO frequency modulators
//! before their LFO, and all generators before the endpoint combining them.

mod cc;
mod eg_adsr;
mod eg_flex;
mod endpoint;
mod envelope;
mod eq;
mod lfo;
mod rack;
mod smoother;
mod xfade;

pub use cc::{CcUnit, MAX_CC_BINDINGS};
pub use eg_adsr::{Adsr, AdsrParams, AdsrStage, AdsrTarget, AdsrUnit};
pub use eg_flex::{FlexEg, FlexEgUnit, MAX_EG_NODES};
pub use endpoint::Endpoint;
pub use envelope::{EgEvent, EnvelopeCore, Segment};
pub use eq::{EqUnit, EQ_BANDS};
pub use lfo::{FlexLfoUnit, LfoUnit, Oscillator};
pub use rack::{Rack, MAX_EG, MAX_LFO};
pub use smoother::Smoother;
pub use xfade::{xf_coefficient, XfCcUnit, XfDirection};

use kz_ir::{CcBinding, Curve, Region, CTRL_TABLE_SIZE};

/// Multiplicative adjustments a note applies on top of region values.
///
/// Scripts change these through note overrides; 1.0 leaves the region
/// value untouched.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UnitOverrides {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
    pub amp_lfo_depth: f32,
    pub amp_lfo_freq: f32,
    pub pitch_lfo_depth: f32,
    pub pitch_lfo_freq: f32,
    pub cutoff_lfo_depth: f32,
    pub cutoff_lfo_freq: f32,
}

impl Default for UnitOverrides {
    fn default() -> Self {
        Self {
            attack: 1.0,
            decay: 1.0,
            sustain: 1.0,
            release: 1.0,
            amp_lfo_depth: 1.0,
            amp_lfo_freq: 1.0,
            pitch_lfo_depth: 1.0,
            pitch_lfo_freq: 1.0,
            cutoff_lfo_depth: 1.0,
            cutoff_lfo_freq: 1.0,
        }
    }
}

/// Destination amounts of a flex envelope or LFO, copied from the
/// definition when the unit is triggered.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Destinations {
    /// Percent.
    pub amplitude: f32,
    /// dB; at or below -144 dB counts as unset for envelopes.
    pub volume: f32,
    /// Cents.
    pub pitch: f32,
    /// Cents.
    pub cutoff: f32,
    /// dB.
    pub resonance: f32,
    /// -100..=100.
    pub pan: f32,
    /// Curve shaping the pan amount, -1 for none.
    pub pan_curve: i16,
}

impl Default for Destinations {
    fn default() -> Self {
        Self {
            amplitude: 0.0,
            volume: 0.0,
            pitch: 0.0,
            cutoff: 0.0,
            resonance: 0.0,
            pan: 0.0,
            pan_curve: -1,
        }
    }
}

/// Everything a unit may read while it is triggered.
#[derive(Clone, Copy)]
pub struct TriggerContext<'a> {
    pub region: &'a Region,
    pub curves: &'a [Curve],
    /// Controller values of the voice's channel.
    pub cc: &'a [u8; CTRL_TABLE_SIZE],
    pub key: u8,
    pub velocity: u8,
    /// Audio sample rate.
    pub sample_rate: f32,
    /// Modulation steps per second.
    pub sub_rate: f32,
    /// Duration of a fade-out from full level, in seconds.
    pub fade_time: f32,
    /// Shortest release stage, in seconds.
    pub min_release: f32,
    /// Envelope level treated as silence.
    pub eg_bottom: f32,
    /// Uniform random number in 0..1 drawn for this voice.
    pub random: f32,
    pub overrides: UnitOverrides,
}

/// Sum of controller contributions: each binding adds
/// `value / 127 * influence`.
pub fn cc_influence(list: &[CcBinding], cc: &[u8; CTRL_TABLE_SIZE]) -> f32 {
    list.iter()
        .map(|b| {
            let value = cc.get(b.cc as usize).copied().unwrap_or(0);
            value as f32 / 127.0 * b.influence
        })
        .sum()
}

/// Decibels to linear gain.
pub fn db_to_ratio(db: f32) -> f32 {
    if db == 0.0 {
        return 1.0;
    }
    libm::powf(10.0, db / 20.0)
}

/// Cents to frequency ratio.
pub fn cents_to_ratio(cents: f32) -> f32 {
    if cents == 0.0 {
        return 1.0;
    }
    libm::exp2f(cents / 1200.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions() {
        assert_eq!(db_to_ratio(0.0), 1.0);
        assert!((db_to_ratio(-6.0) - 0.501_187).abs() < 1e-5);
        assert!((db_to_ratio(20.0) - 10.0).abs() < 1e-4);
        assert_eq!(cents_to_ratio(0.0), 1.0);
        assert!((cents_to_ratio(1200.0) - 2.0).abs() < 1e-6);
        assert!((cents_to_ratio(-1200.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn influence_sums_bindings() {
        let mut cc = [0u8; CTRL_TABLE_SIZE];
        cc[1] = 127;
        cc[7] = 0;
        let list = [CcBinding::new(1, 10.0), CcBinding::new(7, 5.0)];
        assert_eq!(cc_influence(&list, &cc), 10.0);
        assert_eq!(cc_influence(&[], &cc), 0.0);
    }
}
