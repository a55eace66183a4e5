//! Sample data types.

use alloc::vec::Vec;
use arrayvec::ArrayString;

slotmap::new_key_type! {
    /// Key for referencing samples in an instrument's sample bank.
    pub struct SampleKey;
}

/// A decoded sample as handed to the voice layer.
#[derive(Clone, Debug)]
pub struct Sample {
    /// File or resource name the sample was loaded from.
    pub name: ArrayString<64>,
    /// Audio data
    pub data: SampleData,
    /// Native sample rate in Hz
    pub sample_rate: u32,
    /// Loop start frame from the sample file (inclusive)
    pub loop_start: u32,
    /// Loop end frame from the sample file (inclusive)
    pub loop_end: u32,
    /// Loop type stored in the sample file
    pub loop_type: LoopType,
}

impl Default for Sample {
    fn default() -> Self {
        Self {
            name: ArrayString::new(),
            data: SampleData::Mono16(Vec::new()),
            sample_rate: 44100,
            loop_start: 0,
            loop_end: 0,
            loop_type: LoopType::None,
        }
    }
}

impl Sample {
    /// Create a new empty sample.
    pub fn new(name: &str) -> Self {
        let mut sample = Self::default();
        // Names longer than the inline capacity are truncated at a char boundary.
        for c in name.chars() {
            if sample.name.try_push(c).is_err() {
                break;
            }
        }
        sample
    }

    /// Get the length of the sample in frames.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the sample has no data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true if the sample file declares a usable loop.
    pub fn has_loop(&self) -> bool {
        self.loop_type != LoopType::None && self.loop_end > self.loop_start
    }
}

/// Sample audio data, one plane per channel.
#[derive(Clone, Debug)]
pub enum SampleData {
    /// 16-bit mono samples
    Mono16(Vec<i16>),
    /// 16-bit stereo samples (left, right)
    Stereo16(Vec<i16>, Vec<i16>),
    /// Float mono samples (24/32-bit sources)
    MonoF32(Vec<f32>),
    /// Float stereo samples (left, right)
    StereoF32(Vec<f32>, Vec<f32>),
}

const I16_SCALE: f32 = 1.0 / 32768.0;

impl SampleData {
    /// Get the number of sample frames.
    pub fn len(&self) -> usize {
        match self {
            SampleData::Mono16(v) => v.len(),
            SampleData::Stereo16(l, _) => l.len(),
            SampleData::MonoF32(v) => v.len(),
            SampleData::StereoF32(l, _) => l.len(),
        }
    }

    /// Returns true if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of channels in the sample data.
    pub fn num_channels(&self) -> u16 {
        match self {
            SampleData::Mono16(_) | SampleData::MonoF32(_) => 1,
            SampleData::Stereo16(_, _) | SampleData::StereoF32(_, _) => 2,
        }
    }

    /// Read one frame as a normalized (left, right) pair.
    ///
    /// Mono data is duplicated into both channels; out-of-range
    /// positions read as silence.
    pub fn frame(&self, pos: usize) -> (f32, f32) {
        match self {
            SampleData::Mono16(v) => {
                let s = v.get(pos).copied().unwrap_or(0) as f32 * I16_SCALE;
                (s, s)
            }
            SampleData::Stereo16(l, r) => (
                l.get(pos).copied().unwrap_or(0) as f32 * I16_SCALE,
                r.get(pos).copied().unwrap_or(0) as f32 * I16_SCALE,
            ),
            SampleData::MonoF32(v) => {
                let s = v.get(pos).copied().unwrap_or(0.0);
                (s, s)
            }
            SampleData::StereoF32(l, r) => (
                l.get(pos).copied().unwrap_or(0.0),
                r.get(pos).copied().unwrap_or(0.0),
            ),
        }
    }
}

/// Sample loop type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoopType {
    /// No loop
    #[default]
    None,
    /// Forward loop
    Forward,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_frame_is_duplicated() {
        let data = SampleData::Mono16(vec![0, 16384]);
        let (l, r) = data.frame(1);
        assert!((l - 0.5).abs() < 1e-6);
        assert_eq!(l, r);
    }

    #[test]
    fn stereo_frame_keeps_channels() {
        let data = SampleData::StereoF32(vec![0.25], vec![-0.25]);
        assert_eq!(data.frame(0), (0.25, -0.25));
        assert_eq!(data.num_channels(), 2);
    }

    #[test]
    fn out_of_range_reads_silence() {
        let data = SampleData::Stereo16(vec![100], vec![100]);
        assert_eq!(data.frame(5), (0.0, 0.0));
    }

    #[test]
    fn long_names_are_truncated() {
        let name = "x".repeat(100);
        let sample = Sample::new(&name);
        assert_eq!(sample.name.len(), 64);
    }

    #[test]
    fn loop_requires_end_after_start() {
        let mut sample = Sample::new("loop");
        sample.loop_type = LoopType::Forward;
        sample.loop_start = 10;
        sample.loop_end = 10;
        assert!(!sample.has_loop());
        sample.loop_end = 20;
        assert!(sample.has_loop());
    }
}
