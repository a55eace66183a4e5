//! Flex envelopes (`egN_*`): an arbitrary list of time/level/shape nodes
//! with one sustain node.

use arrayvec::ArrayVec;
use kz_ir::{Curve, EgDefinition, CTRL_TABLE_SIZE};

use super::cc::CcUnit;
use super::envelope::{EgEvent, EnvelopeCore, Segment};
use super::{cc_influence, Destinations, TriggerContext};

/// Nodes per flex envelope; later nodes are dropped.
pub const MAX_EG_NODES: usize = 16;

/// Longest node time after controller influence, in seconds.
const MAX_NODE_TIME: f32 = 100.0;

#[derive(Clone, Copy, Debug, Default)]
struct Node {
    time: f32,
    level: f32,
    shape: f32,
}

/// The stage machine of a flex envelope.
///
/// Each stage moves from the current level to the next node's level along
/// a power curve; a shape of 0 or 1 is linear. Stage length grows with
/// velocity, doubling at full velocity.
#[derive(Clone, Debug, Default)]
pub struct FlexEg {
    pub core: EnvelopeCore,
    nodes: ArrayVec<Node, MAX_EG_NODES>,
    sustain: usize,
    stage: usize,
    got_release: bool,
    time_coeff: f32,
}

impl FlexEg {
    pub fn trigger(&mut self, def: &EgDefinition, cc: &[u8; CTRL_TABLE_SIZE], velocity: u8, rate: f32) {
        self.nodes.clear();
        for node in def.nodes.iter().take(MAX_EG_NODES) {
            let level = (node.level + cc_influence(&node.level_oncc, cc)).min(1.0);
            let time = (node.time + cc_influence(&node.time_oncc, cc)).min(MAX_NODE_TIME);
            self.nodes.push(Node { time, level, shape: node.shape });
        }
        self.sustain = def.sustain;
        self.stage = 0;
        self.got_release = false;
        self.time_coeff = libm::exp2f(velocity as f32 / 127.0);

        let Some(first) = self.nodes.first() else {
            self.core.enter_end();
            return;
        };
        self.core.level = first.level;
        self.core.enter_first_stage();
        self.update(EgEvent::StageEnd, rate);
    }

    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn update(&mut self, event: EgEvent, rate: f32) {
        if self.core.at_end(event) {
            return;
        }
        if event == EgEvent::Release {
            if self.got_release {
                return;
            }
            self.got_release = true;
        }
        if event == EgEvent::CancelRelease {
            return;
        }

        let last = self.nodes.len().saturating_sub(1);
        let releasing_past_end = event == EgEvent::Release && self.sustain >= last;
        if self.stage == self.sustain && self.stage != 0 && event != EgEvent::Release {
            self.enter_sustain();
        } else if self.stage >= last || releasing_past_end {
            self.core.enter_fade_out();
        } else {
            if event == EgEvent::Release {
                self.stage = self.sustain;
            } else {
                self.core.level = self.nodes[self.stage].level;
            }
            self.stage += 1;
            self.enter_stage(rate);
        }
    }

    fn enter_stage(&mut self, rate: f32) {
        let node = self.nodes[self.stage];
        let prev_shape = self.nodes[self.stage - 1].shape;
        let shape = if node.shape < 0.000_001 { 1.0 } else { node.shape };
        let xd = node.time * rate * self.time_coeff;
        let yd = node.level - self.core.level;
        let core = &mut self.core;

        core.segment = Segment::Pow;
        core.steps_left = xd as i32;
        if xd < 1.0 {
            // Shorter than one step: land on the node right away.
            core.segment = Segment::Lin;
            core.coeff = 0.0;
            core.level = node.level;
            core.steps_left = 0;
            return;
        }
        if !(0.000_001..=0.999_999).contains(&prev_shape) {
            core.exp = 1.0 / shape;
            core.offset = core.level;
            core.x = 0.0;
            core.x_delta = 1.0 / xd;
            core.coeff = yd;
        } else {
            core.exp = shape;
            core.offset = node.level;
            core.x = 1.0;
            core.x_delta = -1.0 / xd;
            core.coeff = -yd;
        }
    }

    fn enter_sustain(&mut self) {
        self.core.segment = Segment::Lin;
        self.core.coeff = 0.0;
        self.core.steps_left = i32::MAX;
        self.core.level = self.nodes[self.stage].level;
    }
}

/// A flex envelope with its destination controller units.
#[derive(Clone, Debug, Default)]
pub struct FlexEgUnit {
    pub eg: FlexEg,
    /// Index of the definition in the region's envelope list.
    pub def: usize,
    pub dest: Destinations,
    pub amplitude_cc: CcUnit,
    pub volume_cc: CcUnit,
    pub pitch_cc: CcUnit,
    pub cutoff_cc: CcUnit,
    pub resonance_cc: CcUnit,
    pub pan_cc: CcUnit,
    rate: f32,
}

impl FlexEgUnit {
    pub fn trigger(&mut self, def_index: usize, def: &EgDefinition, ctx: &TriggerContext<'_>) {
        let (cc, curves, rate) = (ctx.cc, ctx.curves, ctx.sub_rate);
        self.def = def_index;
        self.dest = Destinations {
            amplitude: def.amplitude,
            volume: def.volume,
            pitch: def.pitch,
            cutoff: def.cutoff,
            resonance: def.resonance,
            pan: def.pan,
            pan_curve: def.pan_curve,
        };
        self.rate = rate;
        self.eg.core.set_fade_out_time(ctx.fade_time, rate);
        self.amplitude_cc.trigger(&def.amplitude_oncc, cc, curves, rate);
        self.volume_cc.trigger(&def.volume_oncc, cc, curves, rate);
        self.pitch_cc.trigger(&def.pitch_oncc, cc, curves, rate);
        self.cutoff_cc.trigger(&def.cutoff_oncc, cc, curves, rate);
        self.resonance_cc.trigger(&def.resonance_oncc, cc, curves, rate);
        self.pan_cc.trigger(&def.pan_oncc, cc, curves, rate);
        self.eg.trigger(def, cc, ctx.velocity, rate);
    }

    pub fn increment(&mut self, curves: &[Curve]) {
        self.eg.core.process();
        if self.eg.core.step_elapsed() {
            self.eg.update(EgEvent::StageEnd, self.rate);
        }
        self.amplitude_cc.increment(curves);
        self.volume_cc.increment(curves);
        self.pitch_cc.increment(curves);
        self.cutoff_cc.increment(curves);
        self.resonance_cc.increment(curves);
        self.pan_cc.increment(curves);
    }

    pub fn process_cc(&mut self, cc: u16, value: u8, curves: &[Curve]) {
        self.amplitude_cc.process_cc(cc, value, curves);
        self.volume_cc.process_cc(cc, value, curves);
        self.pitch_cc.process_cc(cc, value, curves);
        self.cutoff_cc.process_cc(cc, value, curves);
        self.resonance_cc.process_cc(cc, value, curves);
        self.pan_cc.process_cc(cc, value, curves);
    }

    pub fn level(&self) -> f32 {
        self.eg.core.level
    }

    pub fn active(&self) -> bool {
        self.eg.core.active()
    }

    pub fn enter_release(&mut self) {
        self.eg.update(EgEvent::Release, self.rate);
    }

    pub fn enter_fade_out(&mut self) {
        self.eg.core.enter_fade_out();
    }

    pub fn enter_fade_out_within(&mut self, max_steps: i32) {
        self.eg.core.enter_fade_out_within(max_steps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kz_ir::EgNode;

    const RATE: f32 = 100.0;

    fn node(time: f32, level: f32) -> EgNode {
        EgNode { time, level, ..EgNode::default() }
    }

    fn step(eg: &mut FlexEg) -> f32 {
        eg.core.process();
        if eg.core.step_elapsed() {
            eg.update(EgEvent::StageEnd, RATE);
        }
        eg.core.level
    }

    fn def(nodes: Vec<EgNode>, sustain: usize) -> EgDefinition {
        EgDefinition { nodes, sustain, ..EgDefinition::default() }
    }

    #[test]
    fn linear_rise_to_sustain_node() {
        let d = def(vec![node(0.0, 0.0), node(0.1, 1.0), node(0.1, 0.5)], 2);
        let cc = [0u8; CTRL_TABLE_SIZE];
        let mut eg = FlexEg::default();
        // Velocity 0 keeps stage times unscaled.
        eg.trigger(&d, &cc, 0, RATE);
        assert_eq!(eg.stage(), 1);
        let rise: Vec<f32> = (0..10).map(|_| step(&mut eg)).collect();
        assert!(rise.windows(2).all(|w| w[1] >= w[0]));
        for _ in 0..30 {
            step(&mut eg);
        }
        assert_eq!(eg.stage(), 2);
        assert!((eg.core.level - 0.5).abs() < 1e-6);
        assert!(eg.core.steps_left > 1_000_000);
    }

    #[test]
    fn release_leaves_sustain_and_fades() {
        let d = def(vec![node(0.0, 1.0), node(0.0, 1.0), node(0.05, 0.0)], 1);
        let cc = [0u8; CTRL_TABLE_SIZE];
        let mut eg = FlexEg::default();
        eg.core.set_fade_out_time(0.01, RATE);
        eg.trigger(&d, &cc, 0, RATE);
        for _ in 0..5 {
            step(&mut eg);
        }
        eg.update(EgEvent::Release, RATE);
        assert_eq!(eg.stage(), 2);
        for _ in 0..20 {
            step(&mut eg);
        }
        assert!(!eg.core.active());
    }

    #[test]
    fn velocity_stretches_stages() {
        let d = def(vec![node(0.0, 0.0), node(0.1, 1.0)], 0);
        let cc = [0u8; CTRL_TABLE_SIZE];
        let mut slow = FlexEg::default();
        slow.trigger(&d, &cc, 127, RATE);
        let mut fast = FlexEg::default();
        fast.trigger(&d, &cc, 0, RATE);
        assert_eq!(fast.core.steps_left, 10);
        assert_eq!(slow.core.steps_left, 20);
    }

    #[test]
    fn empty_definition_is_inactive() {
        let cc = [0u8; CTRL_TABLE_SIZE];
        let mut eg = FlexEg::default();
        eg.trigger(&EgDefinition::default(), &cc, 100, RATE);
        assert!(!eg.core.active());
    }
}
