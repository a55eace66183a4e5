//! The endpoint: combines every unit of a rack into the final volume,
//! pitch, pan, cutoff and resonance of a voice.

use kz_ir::modulation::EG_VOLUME_UNSET;
use kz_ir::Curve;

use super::cc::CcUnit;
use super::rack::Rack;
use super::xfade::{xf_coefficient, XfCcUnit, XfDirection};
use super::{cc_influence, cents_to_ratio, db_to_ratio, TriggerContext};

/// Trigger-time state of the endpoint.
#[derive(Clone, Debug, Default)]
pub struct Endpoint {
    /// Product of the key and velocity cross-fades.
    pub xf_coeff: f32,
    /// Frames left before the voice starts sounding.
    pub delay_frames: u32,
    pitch_veltrack_ratio: f32,
    xfin_cc: XfCcUnit,
    xfout_cc: XfCcUnit,
    pub pan_cc: CcUnit,
}

impl Endpoint {
    pub fn trigger(&mut self, ctx: &TriggerContext<'_>) {
        let r = ctx.region;
        let sr = ctx.sample_rate;
        let mut delay = cc_influence(&r.delay_samples_oncc, ctx.cc).max(0.0) as u32;
        delay += r.delay_samples;
        delay += (r.delay.max(0.0) * sr) as u32;
        delay += (ctx.random * r.delay_random.max(0.0) * sr) as u32;
        delay += (cc_influence(&r.delay_oncc, ctx.cc).max(0.0) * sr) as u32;
        self.delay_frames = delay;

        let (key, vel) = (ctx.key, ctx.velocity);
        self.xf_coeff = xf_coefficient(vel, r.xfin_lovel, r.xfin_hivel, XfDirection::In, r.xf_velcurve)
            * xf_coefficient(vel, r.xfout_lovel, r.xfout_hivel, XfDirection::Out, r.xf_velcurve)
            * xf_coefficient(key, r.xfin_lokey, r.xfin_hikey, XfDirection::In, r.xf_keycurve)
            * xf_coefficient(key, r.xfout_lokey, r.xfout_hikey, XfDirection::Out, r.xf_keycurve);

        self.xfin_cc.trigger(&r.xfin_cc, XfDirection::In, r.xf_cccurve, ctx.cc);
        self.xfout_cc.trigger(&r.xfout_cc, XfDirection::Out, r.xf_cccurve, ctx.cc);
        self.pan_cc.trigger(&r.pan_oncc, ctx.cc, ctx.curves, ctx.sub_rate);

        self.pitch_veltrack_ratio = cents_to_ratio(vel as f32 / 127.0 * r.pitch_veltrack as f32);
    }

    pub fn increment(&mut self, curves: &[Curve]) {
        self.pan_cc.increment(curves);
    }

    pub fn process_cc(&mut self, cc: u16, value: u8, curves: &[Curve]) {
        self.xfin_cc.process_cc(cc, value);
        self.xfout_cc.process_cc(cc, value);
        self.pan_cc.process_cc(cc, value, curves);
    }

    /// Consume up to `frames` of the start delay; returns the frames
    /// consumed.
    pub fn consume_delay(&mut self, frames: u32) -> u32 {
        let n = self.delay_frames.min(frames);
        self.delay_frames -= n;
        n
    }

    /// True while the voice is still in its start delay.
    pub fn delayed(&self) -> bool {
        self.delay_frames > 0
    }

    /// Linear gain of the voice.
    pub fn volume(&self, rack: &Rack) -> f32 {
        let mut vol = if rack.amp_eg.active() { rack.amp_eg.level() } else { 0.0 };

        for &i in &rack.vol_egs {
            let eg = &rack.egs[i as usize];
            if !eg.active() {
                continue;
            }
            let mut db = if eg.volume_cc.active() { eg.volume_cc.level() } else { -200.0 };
            if db < EG_VOLUME_UNSET {
                db = eg.dest.volume;
            } else if eg.dest.volume >= EG_VOLUME_UNSET {
                db += eg.dest.volume;
            }
            let mut amp = (eg.amplitude_cc.level() + eg.dest.amplitude) / 100.0;
            if db >= EG_VOLUME_UNSET {
                if amp == 0.0 && !eg.amplitude_cc.has_bindings() {
                    amp = 1.0;
                }
                amp *= db_to_ratio(db);
            }
            vol += amp * eg.level();
        }

        let lfo = &rack.amp_lfo;
        if lfo.active() {
            vol *= db_to_ratio(lfo.level() * lfo.total_depth() * rack.overrides.amp_lfo_depth);
        }
        vol *= db_to_ratio(rack.volume_cc.level());
        if rack.amplitude_cc.has_bindings() {
            vol *= ((rack.base_amplitude + rack.amplitude_cc.level()) / rack.base_amplitude.max(1e-3)).max(0.0);
        }

        for &i in &rack.vol_lfos {
            let lfo = &rack.lfos[i as usize];
            if lfo.active() {
                vol *= db_to_ratio(lfo.level() * (lfo.dest.volume + lfo.volume_cc.level()));
            }
        }

        if self.xfin_cc.active() {
            vol *= self.xfin_cc.level();
        }
        if self.xfout_cc.active() {
            vol *= self.xfout_cc.level();
        }
        vol * self.xf_coeff
    }

    /// Cutoff frequency ratio.
    pub fn cutoff(&self, rack: &Rack) -> f32 {
        let mut val = cents_to_ratio(rack.cutoff_cc.level());
        let lfo = &rack.fil_lfo;
        if lfo.active() {
            val *= cents_to_ratio(lfo.level() * lfo.total_depth() * rack.overrides.cutoff_lfo_depth);
        }
        if rack.fil_eg.active() {
            val *= cents_to_ratio(rack.fil_eg.level() * rack.fil_eg.depth);
        }
        for &i in &rack.cutoff_egs {
            let eg = &rack.egs[i as usize];
            if eg.active() {
                val *= cents_to_ratio(eg.level() * (eg.dest.cutoff + eg.cutoff_cc.level()));
            }
        }
        for &i in &rack.cutoff_lfos {
            let lfo = &rack.lfos[i as usize];
            if lfo.active() {
                val *= cents_to_ratio(lfo.level() * (lfo.dest.cutoff + lfo.cutoff_cc.level()));
            }
        }
        val
    }

    /// Pitch ratio.
    pub fn pitch(&self, rack: &Rack) -> f32 {
        let mut p = cents_to_ratio(rack.pitch_cc.level());
        if rack.pitch_eg.active() {
            p *= cents_to_ratio(rack.pitch_eg.level() * rack.pitch_eg.depth);
        }
        for &i in &rack.pitch_egs {
            let eg = &rack.egs[i as usize];
            if eg.active() {
                p *= cents_to_ratio(eg.level() * (eg.dest.pitch + eg.pitch_cc.level()));
            }
        }
        let lfo = &rack.pitch_lfo;
        if lfo.active() {
            p *= cents_to_ratio(lfo.level() * lfo.total_depth() * rack.overrides.pitch_lfo_depth);
        }
        for &i in &rack.pitch_lfos {
            let lfo = &rack.lfos[i as usize];
            if lfo.active() {
                p *= cents_to_ratio(lfo.level() * (lfo.dest.pitch + lfo.pitch_cc.level()));
            }
        }
        p * self.pitch_veltrack_ratio
    }

    /// Resonance offset in dB.
    pub fn resonance(&self, rack: &Rack) -> f32 {
        let mut val = rack.resonance_cc.level();
        for &i in &rack.res_egs {
            let eg = &rack.egs[i as usize];
            if eg.active() {
                val += eg.level() * (eg.dest.resonance + eg.resonance_cc.level());
            }
        }
        for &i in &rack.res_lfos {
            let lfo = &rack.lfos[i as usize];
            if lfo.active() {
                val += lfo.level() * (lfo.dest.resonance + lfo.resonance_cc.level());
            }
        }
        val
    }

    /// Pan offset, -100..=100 before clamping.
    pub fn pan(&self, rack: &Rack, curves: &[Curve]) -> f32 {
        let mut pan = self.pan_cc.level();
        for &i in &rack.pan_egs {
            let eg = &rack.egs[i as usize];
            if !eg.active() {
                continue;
            }
            let cc = eg.pan_cc.level();
            let curve = usize::try_from(eg.dest.pan_curve).ok().and_then(|c| curves.get(c));
            pan += match curve {
                Some(curve) => {
                    let idx = (eg.level() * 127.0).clamp(0.0, 127.0) as u8;
                    eg.dest.pan * curve.get(idx) + eg.level() * cc
                }
                None => eg.level() * (eg.dest.pan + cc),
            };
        }
        for &i in &rack.pan_lfos {
            let lfo = &rack.lfos[i as usize];
            if lfo.active() {
                pan += lfo.level() * (lfo.dest.pan + lfo.pan_cc.level());
            }
        }
        pan
    }
}
