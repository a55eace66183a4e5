//! Per-voice filter and equalizer sections.
//!
//! Coefficients are recomputed only when cutoff or resonance change, which
//! happens at most once per modulation step; the per-sample loop is plain
//! multiply-add.

use core::f32::consts::{LN_2, PI, TAU};

use kz_ir::FilterType;

use crate::units::db_to_ratio;

/// Normalized biquad coefficients (`a0 == 1`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    pub a1: f32,
    pub a2: f32,
}

impl Default for BiquadCoeffs {
    /// Pass-through.
    fn default() -> Self {
        Self { b0: 1.0, b1: 0.0, b2: 0.0, a1: 0.0, a2: 0.0 }
    }
}

impl BiquadCoeffs {
    fn normalized(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> Self {
        Self { b0: b0 / a0, b1: b1 / a0, b2: b2 / a0, a1: a1 / a0, a2: a2 / a0 }
    }

    /// Two-pole response of `kind` at `freq` Hz with quality `q`.
    ///
    /// One-pole kinds have no biquad form and return pass-through.
    pub fn two_pole(kind: FilterType, freq: f32, q: f32, sample_rate: f32) -> Self {
        let freq = freq.clamp(10.0, sample_rate * 0.49);
        let omega = TAU * freq / sample_rate;
        let sin = libm::sinf(omega);
        let cos = libm::cosf(omega);
        let alpha = sin / (2.0 * q.max(0.1));
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos;
        let a2 = 1.0 - alpha;
        match kind {
            FilterType::Lpf2p => {
                let b = (1.0 - cos) / 2.0;
                Self::normalized(b, 1.0 - cos, b, a0, a1, a2)
            }
            FilterType::Hpf2p => {
                let b = (1.0 + cos) / 2.0;
                Self::normalized(b, -(1.0 + cos), b, a0, a1, a2)
            }
            FilterType::Bpf2p => Self::normalized(alpha, 0.0, -alpha, a0, a1, a2),
            FilterType::Brf2p => Self::normalized(1.0, -2.0 * cos, 1.0, a0, a1, a2),
            FilterType::Lpf1p | FilterType::Hpf1p => Self::default(),
        }
    }

    /// Peaking band at `freq` Hz, `bw` octaves wide, `gain` dB.
    pub fn peaking(freq: f32, bw: f32, gain: f32, sample_rate: f32) -> Self {
        let freq = freq.clamp(10.0, sample_rate * 0.49);
        let a = libm::powf(10.0, gain / 40.0);
        let omega = TAU * freq / sample_rate;
        let sin = libm::sinf(omega);
        let cos = libm::cosf(omega);
        let bw = bw.max(0.001);
        let alpha = sin * libm::sinhf(LN_2 / 2.0 * bw * omega / sin);
        Self::normalized(
            1.0 + alpha * a,
            -2.0 * cos,
            1.0 - alpha * a,
            1.0 + alpha / a,
            -2.0 * cos,
            1.0 - alpha / a,
        )
    }
}

/// Stereo biquad in transposed direct form II.
#[derive(Clone, Copy, Debug, Default)]
pub struct Biquad {
    pub coeffs: BiquadCoeffs,
    z1: [f32; 2],
    z2: [f32; 2],
}

impl Biquad {
    pub fn reset(&mut self) {
        self.z1 = [0.0; 2];
        self.z2 = [0.0; 2];
    }

    #[inline]
    pub fn tick(&mut self, ch: usize, x: f32) -> f32 {
        let c = &self.coeffs;
        let y = c.b0 * x + self.z1[ch];
        self.z1[ch] = c.b1 * x - c.a1 * y + self.z2[ch];
        self.z2[ch] = c.b2 * x - c.a2 * y;
        y
    }

    pub fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            *l = self.tick(0, *l);
            *r = self.tick(1, *r);
        }
    }
}

/// Resonance in dB to filter quality; 0 dB is a Butterworth response.
pub fn resonance_to_q(resonance_db: f32) -> f32 {
    core::f32::consts::FRAC_1_SQRT_2 * db_to_ratio(resonance_db.max(0.0))
}

/// The `fil_type` filter of one voice.
#[derive(Clone, Copy, Debug, Default)]
pub struct VoiceFilter {
    kind: FilterType,
    biquad: Biquad,
    /// One-pole smoothing factor.
    alpha: f32,
    pole: [f32; 2],
    sample_rate: f32,
    cutoff: f32,
    resonance: f32,
}

impl VoiceFilter {
    pub fn reset(&mut self, kind: FilterType, sample_rate: f32) {
        self.kind = kind;
        self.sample_rate = sample_rate;
        self.biquad.reset();
        self.pole = [0.0; 2];
        self.cutoff = -1.0;
        self.resonance = -1.0;
    }

    /// Retune; a no-op when nothing changed.
    pub fn set_params(&mut self, cutoff: f32, resonance: f32) {
        if cutoff == self.cutoff && resonance == self.resonance {
            return;
        }
        self.cutoff = cutoff;
        self.resonance = resonance;
        match self.kind {
            FilterType::Lpf1p | FilterType::Hpf1p => {
                let fc = cutoff.clamp(10.0, self.sample_rate * 0.49);
                self.alpha = 1.0 - libm::expf(-2.0 * PI * fc / self.sample_rate);
            }
            kind => {
                let q = resonance_to_q(resonance);
                self.biquad.coeffs = BiquadCoeffs::two_pole(kind, cutoff, q, self.sample_rate);
            }
        }
    }

    pub fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        match self.kind {
            FilterType::Lpf1p | FilterType::Hpf1p => {
                let highpass = self.kind == FilterType::Hpf1p;
                let alpha = self.alpha;
                let [mut pl, mut pr] = self.pole;
                for (l, r) in left.iter_mut().zip(right.iter_mut()) {
                    pl += alpha * (*l - pl);
                    pr += alpha * (*r - pr);
                    if highpass {
                        *l -= pl;
                        *r -= pr;
                    } else {
                        *l = pl;
                        *r = pr;
                    }
                }
                self.pole = [pl, pr];
            }
            _ => self.biquad.process(left, right),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 44100.0;

    fn sine(freq: f32, len: usize) -> Vec<f32> {
        (0..len).map(|i| libm::sinf(TAU * freq * i as f32 / SR)).collect()
    }

    fn peak(buf: &[f32]) -> f32 {
        buf.iter().skip(buf.len() / 2).fold(0.0f32, |m, x| m.max(x.abs()))
    }

    fn run(kind: FilterType, cutoff: f32, freq: f32) -> f32 {
        let mut f = VoiceFilter::default();
        f.reset(kind, SR);
        f.set_params(cutoff, 0.0);
        let mut l = sine(freq, 4096);
        let mut r = l.clone();
        f.process(&mut l, &mut r);
        peak(&l)
    }

    #[test]
    fn lowpass_attenuates_highs() {
        assert!(run(FilterType::Lpf2p, 500.0, 100.0) > 0.9);
        assert!(run(FilterType::Lpf2p, 500.0, 8000.0) < 0.05);
        assert!(run(FilterType::Lpf1p, 500.0, 8000.0) < 0.2);
    }

    #[test]
    fn highpass_attenuates_lows() {
        assert!(run(FilterType::Hpf2p, 2000.0, 100.0) < 0.05);
        assert!(run(FilterType::Hpf2p, 2000.0, 10000.0) > 0.9);
    }

    #[test]
    fn bandreject_notches_center() {
        assert!(run(FilterType::Brf2p, 1000.0, 1000.0) < 0.05);
        assert!(run(FilterType::Bpf2p, 1000.0, 1000.0) > 0.9);
    }

    #[test]
    fn resonance_raises_q() {
        assert!((resonance_to_q(0.0) - 0.707_106_8).abs() < 1e-5);
        assert!(resonance_to_q(12.0) > 2.0);
    }

    #[test]
    fn peaking_band_boosts_center_only() {
        let mut b = Biquad { coeffs: BiquadCoeffs::peaking(1000.0, 1.0, 12.0, SR), ..Default::default() };
        let mut l = sine(1000.0, 4096);
        let mut r = l.clone();
        b.process(&mut l, &mut r);
        assert!((peak(&l) - 3.98).abs() < 0.1);

        b.reset();
        let mut l = sine(50.0, 8192);
        let mut r = l.clone();
        b.process(&mut l, &mut r);
        assert!((peak(&l) - 1.0).abs() < 0.1);
    }
}
