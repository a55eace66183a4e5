//! In-memory output for offline rendering and tests.

use crate::traits::{AudioError, AudioOutput};

/// Collects everything written to it as planar stereo.
#[derive(Clone, Debug)]
pub struct CaptureOutput {
    sample_rate: u32,
    running: bool,
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

impl CaptureOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate, running: true, left: Vec::new(), right: Vec::new() }
    }

    pub fn frames(&self) -> usize {
        self.left.len()
    }

    /// Largest absolute sample value on either channel.
    pub fn peak(&self) -> f32 {
        self.left.iter().chain(&self.right).fold(0.0f32, |m, s| m.max(s.abs()))
    }
}

impl AudioOutput for CaptureOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn write(&mut self, left: &[f32], right: &[f32]) -> Result<(), AudioError> {
        if self.running {
            let n = left.len().min(right.len());
            self.left.extend_from_slice(&left[..n]);
            self.right.extend_from_slice(&right[..n]);
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), AudioError> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.running = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_only_while_running() {
        let mut out = CaptureOutput::new(48000);
        out.write(&[0.5, -0.25], &[0.1, 0.2]).unwrap();
        out.stop().unwrap();
        out.write(&[1.0], &[1.0]).unwrap();
        out.start().unwrap();
        out.write(&[-0.75], &[0.0]).unwrap();

        assert_eq!(out.frames(), 3);
        assert_eq!(out.left, vec![0.5, -0.25, -0.75]);
        assert_eq!(out.peak(), 0.75);
        assert_eq!(out.sample_rate(), 48000);
    }
}
