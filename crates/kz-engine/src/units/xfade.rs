//! Key, velocity and controller cross-fades.

use core::f32::consts::FRAC_PI_2;

use arrayvec::ArrayVec;
use kz_ir::{XfCcRange, XfCurve, CTRL_TABLE_SIZE};

use super::cc::MAX_CC_BINDINGS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XfDirection {
    /// Fades from silent at `lo` to full at `hi`.
    In,
    /// Fades from full at `lo` to silent at `hi`.
    Out,
}

fn shape(c: f32, curve: XfCurve) -> f32 {
    match curve {
        XfCurve::Gain => c,
        XfCurve::Power => libm::sinf(c * FRAC_PI_2),
    }
}

/// Cross-fade coefficient of `value` within `lo..=hi`.
///
/// A range left at its default (`xfin` with `hi == 0`, `xfout` with
/// `lo == 127`) does not silence anything at its edge.
pub fn xf_coefficient(value: u8, lo: u8, hi: u8, dir: XfDirection, curve: XfCurve) -> f32 {
    let size = hi.saturating_sub(lo) as f32;
    let pos = value.saturating_sub(lo) as f32;
    match dir {
        XfDirection::In => {
            if value <= lo {
                if hi > 0 {
                    0.0
                } else {
                    1.0
                }
            } else if value >= hi {
                1.0
            } else {
                shape(pos / size, curve)
            }
        }
        XfDirection::Out => {
            if value >= hi {
                if lo < 127 {
                    0.0
                } else {
                    1.0
                }
            } else if value <= lo {
                1.0
            } else {
                shape(1.0 - pos / size, curve)
            }
        }
    }
}

/// Product of controller cross-fades, updated on controller changes.
///
/// Unlike the other controller units it applies whenever it has ranges,
/// even at level 0, so a closed fade silences the voice.
#[derive(Clone, Debug, Default)]
pub struct XfCcUnit {
    ranges: ArrayVec<XfCcRange, MAX_CC_BINDINGS>,
    values: ArrayVec<u8, MAX_CC_BINDINGS>,
    dir: Option<XfDirection>,
    curve: XfCurve,
    level: f32,
}

impl XfCcUnit {
    pub fn trigger(
        &mut self,
        ranges: &[XfCcRange],
        dir: XfDirection,
        curve: XfCurve,
        cc: &[u8; CTRL_TABLE_SIZE],
    ) {
        self.ranges.clear();
        self.values.clear();
        self.dir = Some(dir);
        self.curve = curve;
        for r in ranges.iter().take(MAX_CC_BINDINGS) {
            let hi = if r.hi == 0 { 127 } else { r.hi };
            self.ranges.push(XfCcRange { hi, ..*r });
            self.values.push(cc.get(r.cc as usize).copied().unwrap_or(0));
        }
        self.recalculate();
    }

    pub fn process_cc(&mut self, cc: u16, value: u8) {
        let mut touched = false;
        for (r, v) in self.ranges.iter().zip(self.values.iter_mut()) {
            if r.cc == cc && *v != value {
                *v = value;
                touched = true;
            }
        }
        if touched {
            self.recalculate();
        }
    }

    fn recalculate(&mut self) {
        let Some(dir) = self.dir else {
            self.level = 1.0;
            return;
        };
        self.level = self
            .ranges
            .iter()
            .zip(self.values.iter())
            .map(|(r, &v)| match dir {
                XfDirection::In if v <= r.lo => 0.0,
                XfDirection::In if v >= r.hi => 1.0,
                XfDirection::Out if v >= r.hi => 0.0,
                XfDirection::Out if v <= r.lo => 1.0,
                _ => {
                    let c = (v - r.lo) as f32 / (r.hi - r.lo) as f32;
                    let c = if dir == XfDirection::Out { 1.0 - c } else { c };
                    shape(c, self.curve)
                }
            })
            .product();
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn active(&self) -> bool {
        !self.ranges.is_empty()
    }
}
