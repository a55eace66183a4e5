//! Three-band per-voice equalizer (`eqN_*`).

use kz_ir::{Curve, EqBand};

use super::cc::CcUnit;
use super::TriggerContext;
use crate::filter::{Biquad, BiquadCoeffs};

pub const EQ_BANDS: usize = 3;

#[derive(Clone, Debug, Default)]
struct BandState {
    biquad: Biquad,
    freq: f32,
    bw: f32,
    gain: f32,
    freq_cc: CcUnit,
    bw_cc: CcUnit,
    gain_cc: CcUnit,
}

impl BandState {
    fn trigger(&mut self, band: &EqBand, ctx: &TriggerContext<'_>) {
        let vel = ctx.velocity as f32 / 127.0;
        self.freq = band.freq + band.vel2freq * vel;
        self.bw = band.bw;
        self.gain = band.gain + band.vel2gain * vel;
        self.freq_cc.trigger(&band.freq_oncc, ctx.cc, ctx.curves, ctx.sub_rate);
        self.bw_cc.trigger(&band.bw_oncc, ctx.cc, ctx.curves, ctx.sub_rate);
        self.gain_cc.trigger(&band.gain_oncc, ctx.cc, ctx.curves, ctx.sub_rate);
        self.biquad.reset();
    }

    fn update_coeffs(&mut self, sample_rate: f32) {
        let freq = self.freq + self.freq_cc.level();
        let bw = self.bw + self.bw_cc.level();
        let gain = self.gain + self.gain_cc.level();
        self.biquad.coeffs = BiquadCoeffs::peaking(freq, bw, gain, sample_rate);
    }
}

/// The equalizer of one voice; disabled unless some band can change the
/// signal.
#[derive(Clone, Debug, Default)]
pub struct EqUnit {
    bands: [BandState; EQ_BANDS],
    enabled: bool,
    sample_rate: f32,
}

impl EqUnit {
    pub fn trigger(&mut self, ctx: &TriggerContext<'_>) {
        self.enabled = ctx.region.has_eq();
        if !self.enabled {
            return;
        }
        self.sample_rate = ctx.sample_rate;
        for (state, band) in self.bands.iter_mut().zip(ctx.region.eq.iter()) {
            state.trigger(band, ctx);
            state.update_coeffs(ctx.sample_rate);
        }
    }

    pub fn increment(&mut self, curves: &[Curve]) {
        if !self.enabled {
            return;
        }
        for band in &mut self.bands {
            let a = band.freq_cc.increment(curves);
            let b = band.bw_cc.increment(curves);
            let c = band.gain_cc.increment(curves);
            if a || b || c {
                band.update_coeffs(self.sample_rate);
            }
        }
    }

    pub fn process_cc(&mut self, cc: u16, value: u8, curves: &[Curve]) {
        if !self.enabled {
            return;
        }
        for band in &mut self.bands {
            let a = band.freq_cc.process_cc(cc, value, curves);
            let b = band.bw_cc.process_cc(cc, value, curves);
            let c = band.gain_cc.process_cc(cc, value, curves);
            if a || b || c {
                band.update_coeffs(self.sample_rate);
            }
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        if !self.enabled {
            return;
        }
        for band in &mut self.bands {
            band.biquad.process(left, right);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::UnitOverrides;
    use kz_ir::{CcBinding, Region, CTRL_TABLE_SIZE};

    fn ctx<'a>(region: &'a Region, cc: &'a [u8; CTRL_TABLE_SIZE]) -> TriggerContext<'a> {
        TriggerContext {
            region,
            curves: &[],
            cc,
            key: 60,
            velocity: 127,
            sample_rate: 44100.0,
            sub_rate: 44100.0 / 32.0,
            fade_time: 0.0025,
            min_release: 0.0025,
            eg_bottom: 0.001,
            random: 0.0,
            overrides: UnitOverrides::default(),
        }
    }

    #[test]
    fn flat_bands_stay_disabled() {
        let region = Region::default();
        let cc = [0u8; CTRL_TABLE_SIZE];
        let mut eq = EqUnit::default();
        eq.trigger(&ctx(&region, &cc));
        assert!(!eq.enabled());
        let mut l = [0.5f32; 8];
        let mut r = [0.5f32; 8];
        eq.process(&mut l, &mut r);
        assert_eq!(l, [0.5; 8]);
    }

    #[test]
    fn velocity_and_controller_shape_gain() {
        let mut region = Region::default();
        region.eq[1].vel2gain = 6.0;
        region.eq[1].gain_oncc.push(CcBinding::new(20, 6.0));
        let mut cc = [0u8; CTRL_TABLE_SIZE];
        cc[20] = 127;
        let mut eq = EqUnit::default();
        eq.trigger(&ctx(&region, &cc));
        assert!(eq.enabled());
        let boosted = eq.bands[1].biquad.coeffs;
        assert_eq!(boosted, BiquadCoeffs::peaking(500.0, 1.0, 12.0, 44100.0));
        eq.process_cc(20, 0, &[]);
        assert_eq!(eq.bands[1].biquad.coeffs, BiquadCoeffs::peaking(500.0, 1.0, 6.0, 44100.0));
    }
}
