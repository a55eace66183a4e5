//! Controller response curves (`<curve>` sections).

/// Number of built-in curves present in every instrument.
pub const BUILTIN_CURVES: usize = 7;

/// A 128-point response curve mapping a controller value to 0..=1.
#[derive(Clone, Debug, PartialEq)]
pub struct Curve {
    pub v: [f32; 128],
}

impl Default for Curve {
    fn default() -> Self {
        Self::linear()
    }
}

impl Curve {
    /// The identity mapping `value / 127`.
    pub fn linear() -> Self {
        let mut v = [0.0; 128];
        for (i, x) in v.iter_mut().enumerate() {
            *x = i as f32 / 127.0;
        }
        Self { v }
    }

    /// Build a curve from sparse `(index, value)` points.
    ///
    /// Missing end points default to 0 at index 0 and 1 at index 127;
    /// values between points are interpolated linearly.
    pub fn from_points(points: &[(u8, f32)]) -> Self {
        let mut set = [None; 128];
        for &(idx, value) in points {
            if let Some(slot) = set.get_mut(idx as usize) {
                *slot = Some(value.clamp(0.0, 1.0));
            }
        }
        if set[0].is_none() {
            set[0] = Some(0.0);
        }
        if set[127].is_none() {
            set[127] = Some(1.0);
        }

        let mut v = [0.0; 128];
        let mut prev = 0usize;
        let mut prev_value = set[0].unwrap_or(0.0);
        v[0] = prev_value;
        for i in 1..128 {
            if let Some(value) = set[i] {
                let step = (value - prev_value) / (i - prev) as f32;
                for j in prev + 1..=i {
                    v[j] = prev_value + step * (j - prev) as f32;
                }
                prev = i;
                prev_value = value;
            }
        }
        Self { v }
    }

    /// Look up a controller value.
    pub fn get(&self, value: u8) -> f32 {
        self.v[(value as usize).min(127)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_spans_unit_range() {
        let c = Curve::linear();
        assert_eq!(c.get(0), 0.0);
        assert!((c.get(127) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn sparse_points_interpolate() {
        let c = Curve::from_points(&[(0, 1.0), (64, 0.0)]);
        assert_eq!(c.get(0), 1.0);
        assert!((c.get(32) - 0.5).abs() < 1e-6);
        assert_eq!(c.get(64), 0.0);
        // Implicit end point at 127.
        assert_eq!(c.get(127), 1.0);
    }

    #[test]
    fn out_of_range_values_clamp() {
        let c = Curve::from_points(&[(10, 3.0)]);
        assert_eq!(c.get(10), 1.0);
    }
}
