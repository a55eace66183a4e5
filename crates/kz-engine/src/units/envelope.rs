//! Segment machinery shared by all envelope generators.
//!
//! An envelope advances one step per modulation step. Each stage programs
//! a segment (linear, exponential or power curve) and a step count; when
//! the count runs out the owning generator receives [`EgEvent::StageEnd`]
//! and moves on. Fade-out and the final end state are handled here so all
//! generators can be fast-killed the same way.

/// Input to an envelope generator's stage machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EgEvent {
    StageEnd,
    Release,
    CancelRelease,
}

/// Curve the level follows in the current stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Segment {
    #[default]
    End,
    Lin,
    Exp,
    Pow,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Phase {
    Main,
    FadeOut,
    #[default]
    End,
}

#[derive(Clone, Copy, Debug)]
pub struct EnvelopeCore {
    pub level: f32,
    pub coeff: f32,
    pub offset: f32,
    pub exp: f32,
    pub x: f32,
    pub x_delta: f32,
    /// Steps until the current stage ends.
    pub steps_left: i32,
    pub segment: Segment,
    phase: Phase,
    fade_out_coeff: f32,
}

impl Default for EnvelopeCore {
    fn default() -> Self {
        Self {
            level: 0.0,
            coeff: 0.0,
            offset: 0.0,
            exp: 1.0,
            x: 0.0,
            x_delta: 0.0,
            steps_left: 0,
            segment: Segment::End,
            phase: Phase::End,
            fade_out_coeff: -1.0,
        }
    }
}

impl EnvelopeCore {
    /// Slope of the fade-out ramp: full level to zero in `time` seconds.
    pub fn set_fade_out_time(&mut self, time: f32, step_rate: f32) {
        let steps = (time * step_rate).max(1.0);
        self.fade_out_coeff = -1.0 / steps;
    }

    /// Advance the current segment by one step.
    pub fn process(&mut self) -> f32 {
        match self.segment {
            Segment::End => {}
            Segment::Lin => self.level += self.coeff,
            Segment::Exp => self.level = self.level * self.coeff + self.offset,
            Segment::Pow => {
                self.level = self.offset + self.coeff * libm::powf(self.x, self.exp);
                self.x += self.x_delta;
            }
        }
        self.level
    }

    pub fn enter_first_stage(&mut self) {
        self.phase = Phase::Main;
    }

    /// Handle events for the fade-out and end phases. Returns true if the
    /// generator's own stage machine must not see the event.
    pub fn at_end(&mut self, event: EgEvent) -> bool {
        match self.phase {
            Phase::Main => false,
            Phase::End => true,
            Phase::FadeOut => {
                if event == EgEvent::StageEnd {
                    self.enter_end();
                }
                true
            }
        }
    }

    /// Ramp to silence at the fade-out slope.
    pub fn enter_fade_out(&mut self) {
        self.phase = Phase::FadeOut;
        self.segment = Segment::Lin;
        self.steps_left = (self.level / -self.fade_out_coeff) as i32;
        self.coeff = self.fade_out_coeff;
        if self.steps_left <= 0 {
            self.enter_end();
        }
    }

    /// Ramp to silence within at most `max_steps` steps.
    pub fn enter_fade_out_within(&mut self, max_steps: i32) {
        self.phase = Phase::FadeOut;
        self.segment = Segment::Lin;
        self.steps_left = (self.level / -self.fade_out_coeff) as i32;
        if self.steps_left > max_steps {
            self.steps_left = max_steps;
            self.coeff = -self.level / max_steps as f32;
        } else {
            self.coeff = self.fade_out_coeff;
        }
        if self.steps_left <= 0 {
            self.enter_end();
        }
    }

    pub fn enter_end(&mut self) {
        self.phase = Phase::End;
        self.segment = Segment::End;
        self.level = 0.0;
    }

    pub fn active(&self) -> bool {
        self.segment != Segment::End
    }

    pub fn is_fading_out(&self) -> bool {
        self.phase == Phase::FadeOut
    }

    /// Count down one step; returns true when the stage just ran out.
    pub fn step_elapsed(&mut self) -> bool {
        if !self.active() {
            return false;
        }
        self.steps_left = (self.steps_left - 1).max(0);
        self.steps_left == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_core_is_inactive() {
        let core = EnvelopeCore::default();
        assert!(!core.active());
        assert_eq!(core.level, 0.0);
    }

    #[test]
    fn fade_out_reaches_zero_in_bounded_steps() {
        let mut core = EnvelopeCore::default();
        core.set_fade_out_time(0.0025, 44100.0 / 32.0);
        core.enter_first_stage();
        core.level = 1.0;
        core.enter_fade_out_within(2);
        assert_eq!(core.steps_left, 2);
        core.process();
        core.process();
        assert!(core.level.abs() < 1e-6);
        assert!(core.step_elapsed() || core.step_elapsed());
        assert!(core.at_end(EgEvent::StageEnd));
        assert!(!core.active());
    }

    #[test]
    fn fade_out_from_silence_ends_immediately() {
        let mut core = EnvelopeCore::default();
        core.enter_first_stage();
        core.level = 0.0;
        core.enter_fade_out();
        assert!(!core.active());
    }

    #[test]
    fn pow_segment_walks_x() {
        let mut core = EnvelopeCore::default();
        core.enter_first_stage();
        core.segment = Segment::Pow;
        core.offset = 0.0;
        core.coeff = 1.0;
        core.exp = 1.0;
        core.x = 0.0;
        core.x_delta = 0.25;
        core.process();
        assert_eq!(core.level, 0.0);
        core.process();
        assert_eq!(core.level, 0.25);
    }
}
