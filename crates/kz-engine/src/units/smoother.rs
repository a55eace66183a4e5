//! Linear ramp towards a moving goal, used for smoothed controllers.

#[derive(Clone, Copy, Debug, Default)]
pub struct Smoother {
    /// Steps needed to reach the goal.
    time_steps: u32,
    current_step: u32,
    goal: f32,
    prev: f32,
}

impl Smoother {
    /// Start with `value` as settled value and `time` seconds per ramp.
    pub fn trigger(&mut self, time: f32, rate: f32, value: f32) {
        self.time_steps = (time * rate).max(0.0) as u32;
        self.current_step = self.time_steps;
        self.prev = value;
        self.goal = value;
    }

    /// Jump to `value` without ramping.
    pub fn set_value(&mut self, value: f32) {
        self.current_step = self.time_steps;
        self.prev = value;
        self.goal = value;
    }

    /// Ramp from the current position towards `value`.
    pub fn update(&mut self, value: f32) {
        if value == self.goal {
            return;
        }
        self.prev = self.current();
        self.goal = value;
        self.current_step = 0;
    }

    /// Current value, advancing the ramp by one step.
    pub fn render(&mut self) -> f32 {
        if self.current_step >= self.time_steps {
            return self.goal;
        }
        let v = self.current();
        self.current_step += 1;
        v
    }

    pub fn goal(&self) -> f32 {
        self.goal
    }

    pub fn is_smoothing(&self) -> bool {
        self.current_step < self.time_steps
    }

    fn current(&self) -> f32 {
        if self.time_steps == 0 {
            return self.goal;
        }
        self.prev + (self.goal - self.prev) * (self.current_step as f32 / self.time_steps as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_after_trigger() {
        let mut s = Smoother::default();
        s.trigger(0.1, 100.0, 5.0);
        assert!(!s.is_smoothing());
        assert_eq!(s.render(), 5.0);
    }

    #[test]
    fn ramps_linearly_to_goal() {
        let mut s = Smoother::default();
        s.trigger(0.04, 100.0, 0.0); // 4 steps
        s.update(8.0);
        let values: Vec<f32> = (0..6).map(|_| s.render()).collect();
        assert_eq!(values, vec![0.0, 2.0, 4.0, 6.0, 8.0, 8.0]);
    }

    #[test]
    fn retarget_starts_from_current_position() {
        let mut s = Smoother::default();
        s.trigger(0.04, 100.0, 0.0);
        s.update(8.0);
        s.render();
        s.render(); // now at step 2, value 4
        s.update(0.0);
        assert_eq!(s.render(), 4.0);
    }

    #[test]
    fn zero_time_jumps() {
        let mut s = Smoother::default();
        s.trigger(0.0, 100.0, 1.0);
        s.update(3.0);
        assert_eq!(s.render(), 3.0);
    }
}
