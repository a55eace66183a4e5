//! Fixed-shape DAHDSR envelopes (`ampeg_*`, `fileg_*`, `pitcheg_*`).

use kz_ir::AdsrDefinition;

use super::envelope::{EgEvent, EnvelopeCore, Segment};
use super::{cc_influence, TriggerContext};

/// Attack times below this are treated as instant.
const MIN_ATTACK: f32 = 0.0005;

/// Natural log of the decay ratio an exponential stage covers over its
/// nominal time (about -80 dB).
const EXP_DECAY_SLOPE: f32 = -9.226;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AdsrStage {
    Attack,
    Hold,
    Decay,
    Sustain,
    Release,
    FadeOut,
    #[default]
    End,
}

/// The stage machine of a DAHDSR envelope, without the delay.
#[derive(Clone, Copy, Debug, Default)]
pub struct Adsr {
    pub core: EnvelopeCore,
    stage: AdsrStage,
    sustain_level: f32,
    decay_time: f32,
    hold_steps: i32,
    release_time: f32,
    linear: bool,
    bottom: f32,
}

/// Parameters for [`Adsr::trigger`]; times in seconds, levels 0..=1000.
#[derive(Clone, Copy, Debug)]
pub struct AdsrParams {
    pub start: f32,
    pub attack: f32,
    pub hold: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
    /// Linear decay and release instead of exponential ones.
    pub linear: bool,
}

impl Adsr {
    pub fn stage(&self) -> AdsrStage {
        self.stage
    }

    pub fn level(&self) -> f32 {
        self.core.level
    }

    pub fn active(&self) -> bool {
        self.core.active()
    }

    /// Start the envelope. `rate` is the modulation step rate.
    pub fn trigger(&mut self, p: &AdsrParams, rate: f32, min_release: f32, bottom: f32) {
        self.core.enter_first_stage();
        self.sustain_level = p.sustain / 1000.0;
        self.hold_steps = (p.hold * rate) as i32;
        self.decay_time = p.decay;
        self.linear = p.linear;
        self.bottom = bottom;
        self.release_time = p.release.max(min_release) * rate;

        if p.attack >= MIN_ATTACK {
            self.stage = AdsrStage::Attack;
            self.core.segment = Segment::Lin;
            self.core.steps_left = (p.attack * rate) as i32;
            self.core.level = p.start / 1000.0;
            self.core.coeff = (1.0 - self.core.level) / self.core.steps_left.max(1) as f32;
        } else {
            self.core.level = 1.0;
            if self.hold_steps > 0 {
                self.enter_hold();
            } else {
                self.enter_decay(rate);
            }
        }
    }

    /// Feed an event into the stage machine.
    pub fn update(&mut self, event: EgEvent, rate: f32) {
        if self.core.at_end(event) {
            if !self.core.active() {
                self.stage = AdsrStage::End;
            }
            return;
        }
        match self.stage {
            AdsrStage::Attack => match event {
                EgEvent::Release => self.enter_release(),
                EgEvent::StageEnd if self.hold_steps > 0 => self.enter_hold(),
                EgEvent::StageEnd => self.enter_decay(rate),
                EgEvent::CancelRelease => {}
            },
            AdsrStage::Hold => match event {
                EgEvent::StageEnd => self.enter_decay(rate),
                EgEvent::Release => self.enter_release(),
                EgEvent::CancelRelease => {}
            },
            AdsrStage::Decay => match event {
                EgEvent::StageEnd
                    if self.core.level < self.bottom || self.sustain_level < self.bottom =>
                {
                    self.enter_end()
                }
                EgEvent::StageEnd => {
                    // Step truncation can leave the level slightly above target.
                    self.core.level = self.sustain_level;
                    self.enter_sustain();
                }
                EgEvent::Release => self.enter_release(),
                EgEvent::CancelRelease => {}
            },
            AdsrStage::Sustain => match event {
                // Nothing to do but wait; refresh the step counter.
                EgEvent::StageEnd => self.core.steps_left = i32::MAX,
                EgEvent::Release => self.enter_release(),
                EgEvent::CancelRelease => {}
            },
            AdsrStage::Release => match event {
                EgEvent::StageEnd => self.enter_fade_out(),
                EgEvent::CancelRelease => self.enter_sustain(),
                EgEvent::Release => {}
            },
            AdsrStage::FadeOut | AdsrStage::End => {}
        }
    }

    pub fn enter_fade_out(&mut self) {
        self.stage = AdsrStage::FadeOut;
        self.core.enter_fade_out();
        if !self.core.active() {
            self.stage = AdsrStage::End;
        }
    }

    pub fn enter_fade_out_within(&mut self, max_steps: i32) {
        self.stage = AdsrStage::FadeOut;
        self.core.enter_fade_out_within(max_steps);
        if !self.core.active() {
            self.stage = AdsrStage::End;
        }
    }

    fn enter_hold(&mut self) {
        self.stage = AdsrStage::Hold;
        self.core.segment = Segment::Lin;
        self.core.coeff = 0.0;
        self.core.steps_left = self.hold_steps;
    }

    fn enter_decay(&mut self, rate: f32) {
        self.stage = AdsrStage::Decay;
        let steps = self.decay_time * rate;
        if self.linear {
            self.core.steps_left = (steps * (self.core.level - self.sustain_level)) as i32;
            if self.core.steps_left > 0 {
                self.core.segment = Segment::Lin;
                self.core.coeff = -1.0 / steps;
                return;
            }
        } else if steps > 0.0 && self.core.level > self.sustain_level {
            let slope = EXP_DECAY_SLOPE / steps;
            self.core.segment = Segment::Exp;
            self.core.coeff = libm::expf(slope);
            self.core.offset = 0.0;
            let target = self.sustain_level.max(self.bottom);
            self.core.steps_left = (libm::logf(target / self.core.level) / slope) as i32;
            if self.core.steps_left > 0 {
                return;
            }
        }
        self.core.level = self.sustain_level;
        self.enter_sustain();
    }

    fn enter_sustain(&mut self) {
        self.stage = AdsrStage::Sustain;
        self.core.segment = Segment::Lin;
        self.core.coeff = 0.0;
        self.core.steps_left = i32::MAX;
    }

    fn enter_release(&mut self) {
        self.stage = AdsrStage::Release;
        let rt = self.release_time;
        if self.linear {
            self.core.segment = Segment::Lin;
            self.core.steps_left = (self.core.level * rt) as i32;
            self.core.coeff = -1.0 / rt;
        } else {
            let slope = EXP_DECAY_SLOPE / rt;
            self.core.segment = Segment::Exp;
            self.core.offset = 0.0;
            self.core.steps_left = if self.core.level > 0.0 {
                (libm::logf(self.bottom / self.core.level) / slope) as i32
            } else {
                0
            };
            self.core.coeff = libm::expf(slope);
        }
        if self.core.steps_left <= 0 {
            self.enter_fade_out();
        }
    }

    fn enter_end(&mut self) {
        self.stage = AdsrStage::End;
        self.core.enter_end();
    }
}

/// What a fixed envelope modulates; decides velocity and release behaviour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AdsrTarget {
    #[default]
    Amplitude,
    Cutoff,
    Pitch,
}

/// A fixed envelope with its delay, as run inside a voice.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdsrUnit {
    pub eg: Adsr,
    pub target: AdsrTarget,
    /// Modulation depth in cents (filter and pitch envelopes).
    pub depth: f32,
    delay_steps: u32,
    rate: f32,
}

impl AdsrUnit {
    pub fn new(target: AdsrTarget) -> Self {
        Self { target, ..Self::default() }
    }

    pub fn trigger(&mut self, def: &AdsrDefinition, ctx: &TriggerContext<'_>) {
        self.trigger_with_sustain(def, def.sustain, ctx);
    }

    /// Trigger with `sustain` (percent) in place of the definition's value.
    pub fn trigger_with_sustain(&mut self, def: &AdsrDefinition, sustain: f32, ctx: &TriggerContext<'_>) {
        let infl = |list| cc_influence(list, ctx.cc);
        // Velocity scaling of the vel2* opcodes.
        let velrel = ctx.velocity as f32 / 127.0;
        self.rate = ctx.sub_rate;
        self.eg.core.set_fade_out_time(ctx.fade_time, ctx.sub_rate);

        self.depth = def.depth + def.vel2depth * velrel + infl(&def.depth_oncc);
        let delay = def.delay + def.vel2delay * velrel + infl(&def.delay_oncc);
        self.delay_steps = (delay.max(0.0) * ctx.sub_rate) as u32;

        let stage = |base: f32, vel: f32, list| (base + vel * velrel + infl(list)).max(0.0);
        let mut params = AdsrParams {
            start: ((def.start + infl(&def.start_oncc)) * 10.0).clamp(0.0, 1000.0),
            attack: stage(def.attack, def.vel2attack, &def.attack_oncc),
            hold: stage(def.hold, def.vel2hold, &def.hold_oncc),
            decay: stage(def.decay, def.vel2decay, &def.decay_oncc),
            sustain: 0.0,
            release: stage(def.release, def.vel2release, &def.release_oncc),
            linear: self.target != AdsrTarget::Amplitude,
        };
        let mut sustain =
            10.0 * (sustain + def.vel2sustain * velrel + infl(&def.sustain_oncc));
        if self.target == AdsrTarget::Amplitude {
            let ov = ctx.overrides;
            sustain *= ov.sustain;
            params.attack *= ov.attack;
            params.decay *= ov.decay;
            params.release *= ov.release;
        }
        params.sustain = sustain.clamp(0.0, 1000.0);
        self.eg.trigger(&params, ctx.sub_rate, ctx.min_release, ctx.eg_bottom);
    }

    /// Advance one modulation step.
    pub fn increment(&mut self) {
        if self.delay_steps > 0 {
            self.delay_steps -= 1;
            return;
        }
        self.eg.core.process();
        if self.eg.core.step_elapsed() {
            self.eg.update(EgEvent::StageEnd, self.rate);
        }
    }

    pub fn level(&self) -> f32 {
        self.eg.level()
    }

    pub fn active(&self) -> bool {
        self.eg.active()
    }

    pub fn in_delay(&self) -> bool {
        self.delay_steps > 0
    }

    pub fn enter_release(&mut self) {
        self.delay_steps = 0;
        self.eg.update(EgEvent::Release, self.rate);
    }

    pub fn cancel_release(&mut self) {
        self.eg.update(EgEvent::CancelRelease, self.rate);
    }

    pub fn enter_fade_out(&mut self) {
        self.eg.enter_fade_out();
    }

    pub fn enter_fade_out_within(&mut self, max_steps: i32) {
        self.eg.enter_fade_out_within(max_steps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: f32 = 1000.0;

    fn params(attack: f32, decay: f32, sustain: f32, release: f32) -> AdsrParams {
        AdsrParams { start: 0.0, attack, hold: 0.0, decay, sustain, release, linear: false }
    }

    fn run(eg: &mut Adsr, steps: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(steps);
        for _ in 0..steps {
            eg.core.process();
            out.push(eg.level());
            if eg.core.step_elapsed() {
                eg.update(EgEvent::StageEnd, RATE);
            }
        }
        out
    }

    #[test]
    fn attack_rises_then_decays_to_sustain() {
        let mut eg = Adsr::default();
        eg.trigger(&params(0.01, 0.05, 500.0, 0.1), RATE, 0.0025, 0.001);
        let attack = run(&mut eg, 10);
        assert!(attack.windows(2).all(|w| w[1] >= w[0]));
        assert!((attack[9] - 1.0).abs() < 1e-3);
        assert_eq!(eg.stage(), AdsrStage::Decay);

        let decay = run(&mut eg, 200);
        assert!(decay.windows(2).all(|w| w[1] <= w[0] + 1e-6));
        assert_eq!(eg.stage(), AdsrStage::Sustain);
        assert!((eg.level() - 0.5).abs() < 0.02);
    }

    #[test]
    fn sustain_holds_until_release() {
        let mut eg = Adsr::default();
        eg.trigger(&params(0.0, 0.0, 700.0, 0.05), RATE, 0.0025, 0.001);
        assert_eq!(eg.stage(), AdsrStage::Sustain);
        run(&mut eg, 1000);
        assert_eq!(eg.stage(), AdsrStage::Sustain);
        assert!((eg.level() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn release_ends_within_bound() {
        let mut eg = Adsr::default();
        eg.core.set_fade_out_time(0.0025, RATE);
        eg.trigger(&params(0.0, 0.0, 1000.0, 0.1), RATE, 0.0025, 0.001);
        eg.update(EgEvent::Release, RATE);
        assert_eq!(eg.stage(), AdsrStage::Release);
        // 100 release steps plus a short fade-out tail.
        let tail = run(&mut eg, 110);
        assert!(tail.windows(2).all(|w| w[1] <= w[0] + 1e-6));
        assert!(!eg.active());
        assert_eq!(eg.level(), 0.0);
    }

    #[test]
    fn cancel_release_returns_to_sustain() {
        let mut eg = Adsr::default();
        eg.trigger(&params(0.0, 0.0, 1000.0, 1.0), RATE, 0.0025, 0.001);
        eg.update(EgEvent::Release, RATE);
        run(&mut eg, 10);
        eg.update(EgEvent::CancelRelease, RATE);
        assert_eq!(eg.stage(), AdsrStage::Sustain);
    }

    #[test]
    fn linear_release_slope() {
        let mut eg = Adsr::default();
        let p = AdsrParams { linear: true, ..params(0.0, 0.0, 1000.0, 0.01) };
        eg.trigger(&p, RATE, 0.0025, 0.001);
        eg.update(EgEvent::Release, RATE);
        let out = run(&mut eg, 3);
        assert!((out[0] - 0.9).abs() < 1e-5);
        assert!((out[2] - 0.7).abs() < 1e-5);
    }

    #[test]
    fn decay_to_silence_ends_envelope() {
        let mut eg = Adsr::default();
        eg.trigger(&params(0.0, 0.02, 0.0, 0.1), RATE, 0.0025, 0.001);
        run(&mut eg, 100);
        assert_eq!(eg.stage(), AdsrStage::End);
        assert!(!eg.active());
    }
}
