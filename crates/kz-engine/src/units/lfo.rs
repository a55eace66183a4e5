//! Low frequency oscillators: the fixed amplitude, filter and pitch LFOs
//! and the flex `lfoN_*` LFOs.

use core::f32::consts::TAU;

use kz_ir::{Curve, LfoDefinition, LfoV1Definition, LfoWave};

use super::cc::CcUnit;
use super::eg_adsr::{Adsr, AdsrParams};
use super::envelope::EgEvent;
use super::{cc_influence, Destinations, TriggerContext};

/// Bipolar oscillator producing -1..=1, advanced once per modulation step.
///
/// The sine wave runs as a rotating phasor so the per-step cost is a few
/// multiplications; trigonometric functions are only evaluated when the
/// oscillator starts or its frequency changes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Oscillator {
    wave: LfoWave,
    /// Position in the cycle, 0..1.
    phase: f32,
    /// Phase advance per step.
    inc: f32,
    sin: f32,
    cos: f32,
    rot_sin: f32,
    rot_cos: f32,
}

impl Oscillator {
    pub fn start(&mut self, wave: LfoWave, freq: f32, phase: f32, rate: f32) {
        self.wave = wave;
        self.phase = phase - libm::floorf(phase);
        let angle = TAU * self.phase;
        self.sin = libm::sinf(angle);
        self.cos = libm::cosf(angle);
        self.set_frequency(freq, rate);
    }

    pub fn set_frequency(&mut self, freq: f32, rate: f32) {
        self.inc = if rate > 0.0 { freq.max(0.0) / rate } else { 0.0 };
        let angle = TAU * self.inc;
        self.rot_sin = libm::sinf(angle);
        self.rot_cos = libm::cosf(angle);
    }

    pub fn frequency(&self, rate: f32) -> f32 {
        self.inc * rate
    }

    /// Current value, then advance one step.
    pub fn render(&mut self) -> f32 {
        let p = self.phase;
        let value = match self.wave {
            LfoWave::Triangle => {
                if p < 0.25 {
                    4.0 * p
                } else if p < 0.75 {
                    2.0 - 4.0 * p
                } else {
                    4.0 * p - 4.0
                }
            }
            LfoWave::Sine => self.sin,
            LfoWave::Pulse75 => pulse(p, 0.75),
            LfoWave::Square => pulse(p, 0.5),
            LfoWave::Pulse25 => pulse(p, 0.25),
            LfoWave::Pulse12 => pulse(p, 0.125),
            LfoWave::SawUp => 2.0 * p - 1.0,
            LfoWave::SawDown => 1.0 - 2.0 * p,
        };

        self.phase += self.inc;
        if self.phase >= 1.0 {
            self.phase -= libm::floorf(self.phase);
        }
        if self.wave == LfoWave::Sine {
            let s = self.sin * self.rot_cos + self.cos * self.rot_sin;
            let c = self.cos * self.rot_cos - self.sin * self.rot_sin;
            // Keep the phasor on the unit circle.
            let norm = 1.5 - 0.5 * (s * s + c * c);
            self.sin = s * norm;
            self.cos = c * norm;
        }
        value
    }
}

fn pulse(phase: f32, duty: f32) -> f32 {
    if phase < duty {
        1.0
    } else {
        -1.0
    }
}

/// An LFO with delay, fade-in and controller-driven frequency and depth.
#[derive(Clone, Debug, Default)]
pub struct LfoUnit {
    pub osc: Oscillator,
    pub freq_cc: CcUnit,
    pub depth_cc: CcUnit,
    /// Depth from the definition; the unit of the destination.
    pub depth: f32,
    level: f32,
    running: bool,
    delay_steps: u32,
    fade: Adsr,
    fade_delay: u32,
    fade_on: bool,
    base_freq: f32,
    freq_scale: f32,
    rate: f32,
}

impl LfoUnit {
    /// Start as one of the fixed amplitude, filter or pitch LFOs.
    pub fn trigger_v1(&mut self, def: &LfoV1Definition, freq_scale: f32, ctx: &TriggerContext<'_>) {
        self.level = 0.0;
        self.running = def.is_active();
        if !self.running {
            self.freq_cc.clear();
            self.depth_cc.clear();
            return;
        }
        self.rate = ctx.sub_rate;
        self.freq_scale = freq_scale;
        self.depth = def.depth;
        self.base_freq = def.freq.max(0.0);
        self.freq_cc.trigger(&def.freq_oncc, ctx.cc, ctx.curves, ctx.sub_rate);
        self.depth_cc.trigger(&def.depth_oncc, ctx.cc, ctx.curves, ctx.sub_rate);
        self.setup_delay_and_fade(def.delay, &def.delay_oncc, def.fade, &def.fade_oncc, ctx);
        let freq = self.frequency();
        self.osc.start(LfoWave::Triangle, freq, 0.0, self.rate);
    }

    /// Start as a flex LFO.
    pub fn trigger_v2(&mut self, def: &LfoDefinition, ctx: &TriggerContext<'_>) {
        self.level = 0.0;
        self.running = def.is_active();
        self.depth_cc.clear();
        if !self.running {
            self.freq_cc.clear();
            return;
        }
        self.rate = ctx.sub_rate;
        self.freq_scale = 1.0;
        self.depth = 1.0;
        self.base_freq = def.freq.max(0.0);
        self.freq_cc.trigger(&def.freq_oncc, ctx.cc, ctx.curves, ctx.sub_rate);
        self.setup_delay_and_fade(def.delay, &def.delay_oncc, def.fade, &def.fade_oncc, ctx);
        let phase = def.phase + cc_influence(&def.phase_oncc, ctx.cc);
        let freq = self.frequency();
        self.osc.start(def.wave, freq, phase, self.rate);
    }

    fn setup_delay_and_fade(
        &mut self,
        delay: f32,
        delay_oncc: &[kz_ir::CcBinding],
        fade: f32,
        fade_oncc: &[kz_ir::CcBinding],
        ctx: &TriggerContext<'_>,
    ) {
        let delay_total = delay + cc_influence(delay_oncc, ctx.cc);
        self.delay_steps = (delay_total.max(0.0) * self.rate) as u32;
        let fade = fade + cc_influence(fade_oncc, ctx.cc);
        self.fade_on = fade != 0.0;
        if self.fade_on {
            // The fade-in starts with the LFO and ramps to full depth.
            self.fade_delay = (delay.max(0.0) * self.rate) as u32;
            let params = AdsrParams {
                start: 0.0,
                attack: fade.max(0.0),
                hold: 0.0,
                decay: 0.0,
                sustain: 1000.0,
                release: 0.0,
                linear: false,
            };
            self.fade.trigger(&params, self.rate, ctx.min_release, ctx.eg_bottom);
        }
    }

    /// Effective frequency in Hz.
    pub fn frequency(&self) -> f32 {
        (self.base_freq + self.freq_cc.level()).max(0.0) * self.freq_scale
    }

    /// Scale the frequency, e.g. from a note override.
    pub fn set_freq_scale(&mut self, scale: f32) {
        if self.freq_scale != scale {
            self.freq_scale = scale;
            self.osc.set_frequency(self.frequency(), self.rate);
        }
    }

    pub fn increment(&mut self, curves: &[Curve]) {
        if !self.running {
            return;
        }
        if self.freq_cc.increment(curves) {
            self.osc.set_frequency(self.frequency(), self.rate);
        }
        self.depth_cc.increment(curves);

        if self.delay_steps > 0 {
            self.delay_steps -= 1;
        } else {
            self.level = self.osc.render();
            if self.fade_on && self.fade.active() {
                self.level *= self.fade.level();
            }
        }

        if self.fade_on {
            if self.fade_delay > 0 {
                self.fade_delay -= 1;
            } else {
                self.fade.core.process();
                if self.fade.core.step_elapsed() {
                    self.fade.update(EgEvent::StageEnd, self.rate);
                }
            }
        }
    }

    pub fn process_cc(&mut self, cc: u16, value: u8, curves: &[Curve]) {
        if !self.running {
            return;
        }
        if self.freq_cc.process_cc(cc, value, curves) {
            self.osc.set_frequency(self.frequency(), self.rate);
        }
        self.depth_cc.process_cc(cc, value, curves);
    }

    /// Current output, -1..=1.
    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn active(&self) -> bool {
        self.running
    }

    /// Depth including controller influence.
    pub fn total_depth(&self) -> f32 {
        self.depth + self.depth_cc.level()
    }
}

/// A flex LFO with its destination controller units.
#[derive(Clone, Debug, Default)]
pub struct FlexLfoUnit {
    pub lfo: LfoUnit,
    /// Index of the definition in the region's LFO list.
    pub def: usize,
    pub dest: Destinations,
    pub volume_cc: CcUnit,
    pub pitch_cc: CcUnit,
    pub cutoff_cc: CcUnit,
    pub resonance_cc: CcUnit,
    pub pan_cc: CcUnit,
}

impl FlexLfoUnit {
    pub fn trigger(&mut self, def_index: usize, def: &LfoDefinition, ctx: &TriggerContext<'_>) {
        let (cc, curves, rate) = (ctx.cc, ctx.curves, ctx.sub_rate);
        self.def = def_index;
        self.dest = Destinations {
            volume: def.volume,
            pitch: def.pitch,
            cutoff: def.cutoff,
            resonance: def.resonance,
            pan: def.pan,
            ..Destinations::default()
        };
        self.lfo.trigger_v2(def, ctx);
        self.volume_cc.trigger(&def.volume_oncc, cc, curves, rate);
        self.pitch_cc.trigger(&def.pitch_oncc, cc, curves, rate);
        self.cutoff_cc.trigger(&def.cutoff_oncc, cc, curves, rate);
        self.resonance_cc.trigger(&def.resonance_oncc, cc, curves, rate);
        self.pan_cc.trigger(&def.pan_oncc, cc, curves, rate);
    }

    pub fn increment(&mut self, curves: &[Curve]) {
        self.lfo.increment(curves);
        self.volume_cc.increment(curves);
        self.pitch_cc.increment(curves);
        self.cutoff_cc.increment(curves);
        self.resonance_cc.increment(curves);
        self.pan_cc.increment(curves);
    }

    pub fn process_cc(&mut self, cc: u16, value: u8, curves: &[Curve]) {
        self.lfo.process_cc(cc, value, curves);
        self.volume_cc.process_cc(cc, value, curves);
        self.pitch_cc.process_cc(cc, value, curves);
        self.cutoff_cc.process_cc(cc, value, curves);
        self.resonance_cc.process_cc(cc, value, curves);
        self.pan_cc.process_cc(cc, value, curves);
    }

    pub fn level(&self) -> f32 {
        self.lfo.level()
    }

    pub fn active(&self) -> bool {
        self.lfo.active()
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
            velocity: 100,
            sample_rate: 1000.0,
            sub_rate: 100.0,
            fade_time: 0.0025,
            min_release: 0.0025,
            eg_bottom: 0.001,
            random: 0.0,
            overrides: UnitOverrides::default(),
        }
    }

    fn cycle(wave: LfoWave, steps: usize) -> Vec<f32> {
        let mut osc = Oscillator::default();
        osc.start(wave, 1.0, 0.0, steps as f32);
        (0..steps).map(|_| osc.render()).collect()
    }

    #[test]
    fn triangle_starts_at_zero_rising() {
        let v = cycle(LfoWave::Triangle, 8);
        assert_eq!(v, vec![0.0, 0.5, 1.0, 0.5, 0.0, -0.5, -1.0, -0.5]);
    }

    #[test]
    fn sine_phasor_tracks_sin() {
        let v = cycle(LfoWave::Sine, 64);
        for (i, x) in v.iter().enumerate() {
            let expected = libm::sinf(TAU * i as f32 / 64.0);
            assert!((x - expected).abs() < 1e-3, "step {i}: {x} vs {expected}");
        }
    }

    #[test]
    fn pulse_duty_cycles() {
        let high = |wave| cycle(wave, 8).iter().filter(|&&x| x > 0.0).count();
        assert_eq!(high(LfoWave::Pulse75), 6);
        assert_eq!(high(LfoWave::Square), 4);
        assert_eq!(high(LfoWave::Pulse25), 2);
        assert_eq!(high(LfoWave::Pulse12), 1);
    }

    #[test]
    fn saws_ramp() {
        let up = cycle(LfoWave::SawUp, 4);
        assert_eq!(up, vec![-1.0, -0.5, 0.0, 0.5]);
        let down = cycle(LfoWave::SawDown, 4);
        assert_eq!(down, vec![1.0, 0.5, 0.0, -0.5]);
    }

    #[test]
    fn start_phase_offsets_cycle() {
        let mut osc = Oscillator::default();
        osc.start(LfoWave::SawUp, 1.0, 0.5, 4.0);
        assert_eq!(osc.render(), 0.0);
    }

    #[test]
    fn v1_without_frequency_stays_silent() {
        let region = Region::default();
        let cc = [0u8; CTRL_TABLE_SIZE];
        let mut lfo = LfoUnit::default();
        lfo.trigger_v1(&LfoV1Definition { depth: 6.0, ..Default::default() }, 1.0, &ctx(&region, &cc));
        assert!(!lfo.active());
        lfo.increment(&[]);
        assert_eq!(lfo.level(), 0.0);
    }

    #[test]
    fn delay_holds_output() {
        let region = Region::default();
        let cc = [0u8; CTRL_TABLE_SIZE];
        let def = LfoV1Definition { freq: 25.0, delay: 0.05, depth: 1.0, ..Default::default() };
        let mut lfo = LfoUnit::default();
        lfo.trigger_v1(&def, 1.0, &ctx(&region, &cc));
        for _ in 0..5 {
            lfo.increment(&[]);
            assert_eq!(lfo.level(), 0.0);
        }
        lfo.increment(&[]); // phase 0
        lfo.increment(&[]); // quarter cycle
        assert!((lfo.level() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn frequency_follows_controller() {
        let region = Region::default();
        let mut cc = [0u8; CTRL_TABLE_SIZE];
        cc[1] = 127;
        let def = LfoDefinition {
            freq: 2.0,
            freq_oncc: vec![CcBinding::new(1, 3.0)],
            ..Default::default()
        };
        let mut unit = FlexLfoUnit::default();
        unit.trigger(0, &def, &ctx(&region, &cc));
        assert!((unit.lfo.frequency() - 5.0).abs() < 1e-6);
        unit.process_cc(1, 0, &[]);
        assert!((unit.lfo.osc.frequency(100.0) - 2.0).abs() < 1e-4);
    }

    #[test]
    fn fade_in_scales_output() {
        let region = Region::default();
        let cc = [0u8; CTRL_TABLE_SIZE];
        let def = LfoDefinition { freq: 25.0, fade: 1.0, ..Default::default() };
        let mut unit = FlexLfoUnit::default();
        unit.trigger(0, &def, &ctx(&region, &cc));
        unit.increment(&[]);
        unit.increment(&[]);
        // Quarter cycle peak scaled by an early fade level.
        assert!(unit.level() > 0.0 && unit.level() < 0.1);
    }
}
