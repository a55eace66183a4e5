//! Engine-wide response tables built once at startup.

/// Interpolate a line-segment description `[x0, y0, x1, y1, ...]` into
/// `N` points.
fn segments<const N: usize>(points: &[f32]) -> [f32; N] {
    let mut y = [0.0; N];
    let mut seg = 0;
    for (x, out) in y.iter_mut().enumerate() {
        let x = x as f32;
        while seg + 3 < points.len() - 2 && x > points[seg + 2] {
            seg += 2;
        }
        let (x0, y0, x1, y1) = (points[seg], points[seg + 1], points[seg + 2], points[seg + 3]);
        *out = y0 + (x - x0) * (y1 - y0) / (x1 - x0);
    }
    y
}

/// Gain of one output side for pan positions 0..=128 (64 is center).
#[derive(Clone, Debug)]
pub struct PanCurve([f32; 129]);

impl Default for PanCurve {
    fn default() -> Self {
        Self::new()
    }
}

impl PanCurve {
    pub fn new() -> Self {
        const POINTS: [f32; 16] =
            [0.0, 0.0, 1.0, 0.0, 2.0, 0.05, 31.5, 0.7, 51.0, 0.851, 74.5, 1.12, 127.0, 1.41, 128.0, 1.41];
        Self(segments(&POINTS))
    }

    /// Left and right gains for `pan` in 0..=128.
    pub fn gains(&self, pan: u8) -> (f32, f32) {
        let pan = pan.min(128) as usize;
        (self.0[128 - pan], self.0[pan])
    }

    /// Left and right gains for a normalized pan in -1..=1.
    pub fn gains_norm(&self, pan: f32) -> (f32, f32) {
        let pos = ((pan.clamp(-1.0, 1.0) + 1.0) * 64.0) as u8;
        self.gains(pos)
    }
}

/// Channel volume (CC 7) response.
#[derive(Clone, Debug)]
pub struct VolumeCurve([f32; 128]);

impl Default for VolumeCurve {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeCurve {
    pub fn new() -> Self {
        const POINTS: [f32; 24] = [
            0.0, 0.0, 2.0, 0.0046, 16.0, 0.016, 31.0, 0.051, 45.0, 0.115, 54.5, 0.2, 64.5, 0.39,
            74.0, 0.74, 92.0, 1.03, 114.0, 1.94, 119.2, 2.2, 127.0, 2.2,
        ];
        Self(segments(&POINTS))
    }

    pub fn get(&self, value: u8) -> f32 {
        self.0[(value as usize).min(127)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pan_center_is_unity() {
        let curve = PanCurve::new();
        let (l, r) = curve.gains(64);
        assert!((l - 1.0).abs() < 0.01);
        assert_eq!(l, r);
    }

    #[test]
    fn pan_extremes_silence_one_side() {
        let curve = PanCurve::new();
        assert_eq!(curve.gains(0).1, 0.0);
        assert!((curve.gains(0).0 - 1.41).abs() < 1e-4);
        assert_eq!(curve.gains_norm(1.0).0, 0.0);
    }

    #[test]
    fn volume_curve_is_monotonic() {
        let curve = VolumeCurve::new();
        assert_eq!(curve.get(0), 0.0);
        assert!((0..127).all(|v| curve.get(v + 1) >= curve.get(v)));
        assert!((curve.get(127) - 2.2).abs() < 1e-4);
    }
}
