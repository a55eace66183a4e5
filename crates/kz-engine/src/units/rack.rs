//! The per-voice unit rack.

use arrayvec::ArrayVec;
use kz_ir::Curve;

use super::cc::CcUnit;
use super::eg_adsr::{AdsrTarget, AdsrUnit};
use super::eg_flex::FlexEgUnit;
use super::endpoint::Endpoint;
use super::eq::EqUnit;
use super::lfo::{FlexLfoUnit, LfoUnit};
use super::{TriggerContext, UnitOverrides};

/// Flex envelopes per voice; further `egN` definitions are ignored.
pub const MAX_EG: usize = 8;
/// Flex LFOs per voice; further `lfoN` definitions are ignored.
pub const MAX_LFO: usize = 8;

type EgList = ArrayVec<u8, MAX_EG>;
type LfoList = ArrayVec<u8, MAX_LFO>;

/// All modulation units of one voice, evaluated in a fixed order.
#[derive(Clone, Debug)]
pub struct Rack {
    pub(super) amp_eg: AdsrUnit,
    pub(super) fil_eg: AdsrUnit,
    pub(super) pitch_eg: AdsrUnit,
    pub(super) amp_lfo: LfoUnit,
    pub(super) fil_lfo: LfoUnit,
    pub(super) pitch_lfo: LfoUnit,

    pub(super) volume_cc: CcUnit,
    pub(super) amplitude_cc: CcUnit,
    pub(super) pitch_cc: CcUnit,
    pub(super) cutoff_cc: CcUnit,
    pub(super) resonance_cc: CcUnit,
    /// Region `amplitude`, the reference for `amplitude_oncc`.
    pub(super) base_amplitude: f32,

    pub(super) egs: ArrayVec<FlexEgUnit, MAX_EG>,
    pub(super) lfos: ArrayVec<FlexLfoUnit, MAX_LFO>,
    // Indices into `egs` / `lfos` by destination.
    pub(super) vol_egs: EgList,
    pub(super) pitch_egs: EgList,
    pub(super) cutoff_egs: EgList,
    pub(super) res_egs: EgList,
    pub(super) pan_egs: EgList,
    pub(super) vol_lfos: LfoList,
    pub(super) pitch_lfos: LfoList,
    pub(super) cutoff_lfos: LfoList,
    pub(super) res_lfos: LfoList,
    pub(super) pan_lfos: LfoList,

    pub(super) endpoint: Endpoint,
    pub(super) eq: EqUnit,
    pub(super) overrides: UnitOverrides,
    release_entered: bool,
}

impl Default for Rack {
    fn default() -> Self {
        Self {
            amp_eg: AdsrUnit::new(AdsrTarget::Amplitude),
            fil_eg: AdsrUnit::new(AdsrTarget::Cutoff),
            pitch_eg: AdsrUnit::new(AdsrTarget::Pitch),
            amp_lfo: LfoUnit::default(),
            fil_lfo: LfoUnit::default(),
            pitch_lfo: LfoUnit::default(),
            volume_cc: CcUnit::default(),
            amplitude_cc: CcUnit::default(),
            pitch_cc: CcUnit::default(),
            cutoff_cc: CcUnit::default(),
            resonance_cc: CcUnit::default(),
            base_amplitude: 100.0,
            egs: ArrayVec::new(),
            lfos: ArrayVec::new(),
            vol_egs: EgList::new(),
            pitch_egs: EgList::new(),
            cutoff_egs: EgList::new(),
            res_egs: EgList::new(),
            pan_egs: EgList::new(),
            vol_lfos: LfoList::new(),
            pitch_lfos: LfoList::new(),
            cutoff_lfos: LfoList::new(),
            res_lfos: LfoList::new(),
            pan_lfos: LfoList::new(),
            endpoint: Endpoint::default(),
            eq: EqUnit::default(),
            overrides: UnitOverrides::default(),
            release_entered: false,
        }
    }
}

impl Rack {
    pub fn trigger(&mut self, ctx: &TriggerContext<'_>) {
        let region = ctx.region;
        let (cc, curves, rate) = (ctx.cc, ctx.curves, ctx.sub_rate);
        self.release_entered = false;
        self.overrides = ctx.overrides;
        self.base_amplitude = region.amplitude;

        self.eq.trigger(ctx);
        self.volume_cc.trigger(&region.volume_oncc, cc, curves, rate);
        self.amplitude_cc.trigger(&region.amplitude_oncc, cc, curves, rate);
        self.pitch_cc.trigger(&region.pitch_oncc, cc, curves, rate);
        self.cutoff_cc.trigger(&region.cutoff_oncc, cc, curves, rate);
        self.resonance_cc.trigger(&region.resonance_oncc, cc, curves, rate);

        self.egs.clear();
        for list in [
            &mut self.vol_egs,
            &mut self.pitch_egs,
            &mut self.cutoff_egs,
            &mut self.res_egs,
            &mut self.pan_egs,
        ] {
            list.clear();
        }
        for (i, def) in region.egs.iter().enumerate() {
            if def.nodes.is_empty() {
                continue;
            }
            if self.egs.try_push(FlexEgUnit::default()).is_err() {
                break;
            }
            let idx = (self.egs.len() - 1) as u8;
            if let Some(unit) = self.egs.last_mut() {
                unit.trigger(i, def, ctx);
            }
            let roles = [
                (def.drives_volume(), &mut self.vol_egs),
                (def.drives_pitch(), &mut self.pitch_egs),
                (def.drives_cutoff(), &mut self.cutoff_egs),
                (def.drives_resonance(), &mut self.res_egs),
                (def.drives_pan(), &mut self.pan_egs),
            ];
            for (drives, list) in roles {
                if drives {
                    list.push(idx);
                }
            }
        }

        self.lfos.clear();
        for list in [
            &mut self.vol_lfos,
            &mut self.pitch_lfos,
            &mut self.cutoff_lfos,
            &mut self.res_lfos,
            &mut self.pan_lfos,
        ] {
            list.clear();
        }
        for (i, def) in region.lfos.iter().enumerate() {
            if !def.is_active() {
                continue;
            }
            if self.lfos.try_push(FlexLfoUnit::default()).is_err() {
                break;
            }
            let idx = (self.lfos.len() - 1) as u8;
            if let Some(unit) = self.lfos.last_mut() {
                unit.trigger(i, def, ctx);
            }
            let roles = [
                (def.volume != 0.0 || !def.volume_oncc.is_empty(), &mut self.vol_lfos),
                (def.pitch != 0.0 || !def.pitch_oncc.is_empty(), &mut self.pitch_lfos),
                (def.cutoff != 0.0 || !def.cutoff_oncc.is_empty(), &mut self.cutoff_lfos),
                (def.resonance != 0.0 || !def.resonance_oncc.is_empty(), &mut self.res_lfos),
                (def.pan != 0.0 || !def.pan_oncc.is_empty(), &mut self.pan_lfos),
            ];
            for (drives, list) in roles {
                if drives {
                    list.push(idx);
                }
            }
        }

        // An unset amplitude sustain defers to flex envelopes driving volume.
        let sustain = if region.ampeg.sustain == -1.0 {
            if self.vol_egs.is_empty() {
                100.0
            } else {
                0.0
            }
        } else {
            region.ampeg.sustain
        };
        self.amp_eg.trigger_with_sustain(&region.ampeg, sustain, ctx);
        self.fil_eg.trigger(&region.fileg, ctx);
        self.pitch_eg.trigger(&region.pitcheg, ctx);

        let ov = ctx.overrides;
        self.amp_lfo.trigger_v1(&region.amplfo, ov.amp_lfo_freq, ctx);
        self.fil_lfo.trigger_v1(&region.fillfo, ov.cutoff_lfo_freq, ctx);
        self.pitch_lfo.trigger_v1(&region.pitchlfo, ov.pitch_lfo_freq, ctx);

        self.endpoint.trigger(ctx);
    }

    /// Advance every unit by one modulation step.
    pub fn increment(&mut self, curves: &[Curve]) {
        self.eq.increment(curves);

        self.volume_cc.increment(curves);
        self.amplitude_cc.increment(curves);
        self.pitch_cc.increment(curves);
        self.cutoff_cc.increment(curves);
        self.resonance_cc.increment(curves);

        self.amp_eg.increment();
        self.fil_eg.increment();
        self.pitch_eg.increment();

        self.amp_lfo.increment(curves);
        self.fil_lfo.increment(curves);
        self.pitch_lfo.increment(curves);

        for eg in &mut self.egs {
            eg.increment(curves);
        }
        for lfo in &mut self.lfos {
            lfo.increment(curves);
        }

        self.endpoint.increment(curves);
    }

    pub fn process_cc(&mut self, cc: u16, value: u8, curves: &[Curve]) {
        self.eq.process_cc(cc, value, curves);
        self.volume_cc.process_cc(cc, value, curves);
        self.amplitude_cc.process_cc(cc, value, curves);
        self.pitch_cc.process_cc(cc, value, curves);
        self.cutoff_cc.process_cc(cc, value, curves);
        self.resonance_cc.process_cc(cc, value, curves);
        self.amp_lfo.process_cc(cc, value, curves);
        self.fil_lfo.process_cc(cc, value, curves);
        self.pitch_lfo.process_cc(cc, value, curves);
        for eg in &mut self.egs {
            eg.process_cc(cc, value, curves);
        }
        for lfo in &mut self.lfos {
            lfo.process_cc(cc, value, curves);
        }
        self.endpoint.process_cc(cc, value, curves);
    }

    /// Apply changed note overrides to running units.
    pub fn set_overrides(&mut self, ov: UnitOverrides) {
        self.overrides = ov;
        self.amp_lfo.set_freq_scale(ov.amp_lfo_freq);
        self.fil_lfo.set_freq_scale(ov.cutoff_lfo_freq);
        self.pitch_lfo.set_freq_scale(ov.pitch_lfo_freq);
    }

    pub fn enter_release(&mut self) {
        self.release_entered = true;
        self.amp_eg.enter_release();
        self.fil_eg.enter_release();
        self.pitch_eg.enter_release();
        for eg in &mut self.egs {
            eg.enter_release();
        }
    }

    pub fn cancel_release(&mut self) {
        self.release_entered = false;
        self.amp_eg.cancel_release();
        self.fil_eg.cancel_release();
        self.pitch_eg.cancel_release();
    }

    pub fn release_entered(&self) -> bool {
        self.release_entered
    }

    /// Ramp every amplitude source to silence at the fade-out slope.
    pub fn enter_fade_out(&mut self) {
        self.amp_eg.enter_fade_out();
        for &i in &self.vol_egs {
            self.egs[i as usize].enter_fade_out();
        }
    }

    /// Ramp every amplitude source to silence within `max_steps` steps.
    pub fn enter_fade_out_within(&mut self, max_steps: i32) {
        self.amp_eg.enter_fade_out_within(max_steps);
        for &i in &self.vol_egs {
            self.egs[i as usize].enter_fade_out_within(max_steps);
        }
    }

    /// False once every amplitude source has ended, or if the key was
    /// released before the start delay ran out.
    pub fn active(&self) -> bool {
        if self.release_entered && self.endpoint.delayed() {
            return false;
        }
        self.amp_eg.active() || self.vol_egs.iter().any(|&i| self.egs[i as usize].active())
    }

    pub fn volume(&self) -> f32 {
        self.endpoint.volume(self)
    }

    pub fn pitch(&self) -> f32 {
        self.endpoint.pitch(self)
    }

    pub fn cutoff(&self) -> f32 {
        self.endpoint.cutoff(self)
    }

    pub fn resonance(&self) -> f32 {
        self.endpoint.resonance(self)
    }

    pub fn pan(&self, curves: &[Curve]) -> f32 {
        self.endpoint.pan(self, curves)
    }

    pub fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }

    pub fn eq_mut(&mut self) -> &mut EqUnit {
        &mut self.eq
    }

    pub fn flex_eg_count(&self) -> usize {
        self.egs.len()
    }

    pub fn flex_lfo_count(&self) -> usize {
        self.lfos.len()
    }
}
