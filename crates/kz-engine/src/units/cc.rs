//! Controller-driven parameter contributions with curves, smoothing and
//! stepping.

use arrayvec::ArrayVec;
use kz_ir::{CcBinding, Curve, CTRL_TABLE_SIZE};

use super::smoother::Smoother;

/// Controllers one parameter may follow; extra bindings are ignored.
pub const MAX_CC_BINDINGS: usize = 4;

#[derive(Clone, Copy, Debug)]
struct Slot {
    cc: u16,
    influence: f32,
    curve: i16,
    step: f32,
    smooth: bool,
    value: u8,
    smoother: Smoother,
}

impl Slot {
    fn normalize(&self, value: f32, curves: &[Curve]) -> f32 {
        let idx = (value.clamp(0.0, 127.0)) as usize;
        match usize::try_from(self.curve).ok().and_then(|c| curves.get(c)) {
            Some(curve) => curve.v[idx],
            None => value / 127.0,
        }
    }

    fn quantized(&self, value: u8, curves: &[Curve]) -> f32 {
        let v = self.normalize(value as f32, curves) * self.influence;
        if self.step > 0.0 {
            libm::truncf(v / self.step) * self.step
        } else {
            v
        }
    }

    fn calculate(&mut self, curves: &[Curve]) -> f32 {
        if !self.smooth {
            return self.quantized(self.value, curves);
        }
        if self.step > 0.0 {
            self.smoother.render()
        } else {
            let raw = self.smoother.render();
            self.normalize(raw, curves) * self.influence
        }
    }
}

/// Sum of controller contributions to one parameter.
#[derive(Clone, Debug, Default)]
pub struct CcUnit {
    slots: ArrayVec<Slot, MAX_CC_BINDINGS>,
    level: f32,
    /// A smoother is moving towards a new goal.
    ramping: bool,
}

impl CcUnit {
    /// Bind to `list` and compute the initial level from `cc`.
    pub fn trigger(
        &mut self,
        list: &[CcBinding],
        cc: &[u8; CTRL_TABLE_SIZE],
        curves: &[Curve],
        step_rate: f32,
    ) {
        self.slots.clear();
        self.ramping = false;
        for b in list.iter().take(MAX_CC_BINDINGS) {
            let value = cc.get(b.cc as usize).copied().unwrap_or(0);
            let mut slot = Slot {
                cc: b.cc,
                influence: b.influence,
                curve: b.curve,
                step: b.step,
                smooth: b.smooth > 0.0,
                value,
                smoother: Smoother::default(),
            };
            if slot.smooth {
                let start = if slot.step > 0.0 { slot.quantized(value, curves) } else { value as f32 };
                slot.smoother.trigger(b.smooth / 1000.0, step_rate, start);
            }
            self.slots.push(slot);
        }
        self.recalculate(curves);
    }

    /// Drop all bindings.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.level = 0.0;
        self.ramping = false;
    }

    /// Feed a controller change. Returns true if the level changed.
    pub fn process_cc(&mut self, cc: u16, value: u8, curves: &[Curve]) -> bool {
        let mut touched = false;
        for slot in self.slots.iter_mut().filter(|s| s.cc == cc) {
            if slot.value == value {
                continue;
            }
            slot.value = value;
            touched = true;
            if slot.smooth {
                self.ramping = true;
                if slot.step > 0.0 {
                    let goal = slot.quantized(value, curves);
                    slot.smoother.update(goal);
                } else {
                    slot.smoother.update(value as f32);
                }
            }
        }
        // Smoothed changes take effect through `increment`.
        if !touched || self.ramping {
            return false;
        }
        let before = self.level;
        self.recalculate(curves);
        before != self.level
    }

    /// Advance smoothing by one step. Returns true if the level changed.
    pub fn increment(&mut self, curves: &[Curve]) -> bool {
        if !self.ramping {
            return false;
        }
        // The render that reaches the goal still has to run.
        let still_moving = self.is_smoothing();
        let before = self.level;
        self.recalculate(curves);
        self.ramping = still_moving;
        before != self.level
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    /// A unit contributes only while its level is non-zero.
    pub fn active(&self) -> bool {
        self.level != 0.0
    }

    pub fn has_bindings(&self) -> bool {
        !self.slots.is_empty()
    }

    fn is_smoothing(&self) -> bool {
        self.slots.iter().any(|s| s.smooth && s.smoother.is_smoothing())
    }

    fn recalculate(&mut self, curves: &[Curve]) {
        self.level = self.slots.iter_mut().map(|s| s.calculate(curves)).sum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pairs: &[(usize, u8)]) -> [u8; CTRL_TABLE_SIZE] {
        let mut cc = [0u8; CTRL_TABLE_SIZE];
        for &(i, v) in pairs {
            cc[i] = v;
        }
        cc
    }

    #[test]
    fn level_follows_controller() {
        let mut unit = CcUnit::default();
        unit.trigger(&[CcBinding::new(7, 12.0)], &table(&[(7, 127)]), &[], 1000.0);
        assert_eq!(unit.level(), 12.0);
        assert!(unit.process_cc(7, 0, &[]));
        assert_eq!(unit.level(), 0.0);
        assert!(!unit.active());
        assert!(!unit.process_cc(8, 100, &[]));
    }

    #[test]
    fn curve_shapes_value() {
        let curves = vec![Curve::from_points(&[(0, 1.0), (127, 0.0)])];
        let mut b = CcBinding::new(1, 10.0);
        b.curve = 0;
        let mut unit = CcUnit::default();
        unit.trigger(&[b], &table(&[(1, 0)]), &curves, 1000.0);
        assert_eq!(unit.level(), 10.0);
    }

    #[test]
    fn step_quantizes() {
        let mut b = CcBinding::new(1, 100.0);
        b.step = 25.0;
        let mut unit = CcUnit::default();
        unit.trigger(&[b], &table(&[(1, 80)]), &[], 1000.0);
        // 80/127*100 = 62.99 -> 50
        assert_eq!(unit.level(), 50.0);
    }

    #[test]
    fn smoothing_ramps_over_steps() {
        let mut b = CcBinding::new(1, 127.0);
        b.smooth = 4.0; // 4 ms at 1000 steps/s
        let mut unit = CcUnit::default();
        unit.trigger(&[b], &table(&[(1, 0)]), &[], 1000.0);
        assert_eq!(unit.level(), 0.0);
        // Level does not jump on the change.
        assert!(!unit.process_cc(1, 100, &[]));
        assert_eq!(unit.level(), 0.0);
        let mut seen = Vec::new();
        for _ in 0..6 {
            unit.increment(&[]);
            seen.push(unit.level());
        }
        assert!(seen.windows(2).all(|w| w[1] >= w[0]));
        assert!((seen[5] - 100.0).abs() < 1e-3);
    }

    #[test]
    fn extra_bindings_are_ignored() {
        let list: Vec<CcBinding> = (0..6).map(|i| CcBinding::new(i, 1.0)).collect();
        let cc = [127u8; CTRL_TABLE_SIZE];
        let mut unit = CcUnit::default();
        unit.trigger(&list, &cc, &[], 1000.0);
        assert_eq!(unit.level(), MAX_CC_BINDINGS as f32);
    }
}
