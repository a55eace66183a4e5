//! Sample streaming as seen from the audio thread.
//!
//! Voices never touch sample storage directly. They ask a [`DiskStreams`]
//! implementation to make a window of frames available and then copy it out;
//! both calls must return immediately. A streaming implementation refills its
//! buffers on another thread and answers `false` from
//! [`DiskStreams::ensure_buffered`] while a window is not resident yet.

use kz_ir::{Sample, SampleKey};
use slotmap::SlotMap;

/// Non-blocking access to sample frames.
pub trait DiskStreams {
    /// True if frames `start..start + frames` of `sample` can be read now.
    fn ensure_buffered(&mut self, sample: SampleKey, start: u32, frames: u32) -> bool;

    /// Copy frames starting at `start` into `left`/`right` (mono samples
    /// fill both); returns the number of frames copied.
    fn read_frames(&mut self, sample: SampleKey, start: u32, left: &mut [f32], right: &mut [f32]) -> usize;
}

/// Streams served from samples fully held in memory.
pub struct RamStreams<'a> {
    samples: &'a SlotMap<SampleKey, Sample>,
}

impl<'a> RamStreams<'a> {
    pub fn new(samples: &'a SlotMap<SampleKey, Sample>) -> Self {
        Self { samples }
    }
}

impl DiskStreams for RamStreams<'_> {
    fn ensure_buffered(&mut self, sample: SampleKey, _start: u32, _frames: u32) -> bool {
        self.samples.contains_key(sample)
    }

    fn read_frames(&mut self, sample: SampleKey, start: u32, left: &mut [f32], right: &mut [f32]) -> usize {
        let Some(sample) = self.samples.get(sample) else {
            return 0;
        };
        let len = sample.len();
        let start = start as usize;
        if start >= len {
            return 0;
        }
        let n = left.len().min(right.len()).min(len - start);
        for (i, (l, r)) in left.iter_mut().zip(right.iter_mut()).take(n).enumerate() {
            let (a, b) = sample.data.frame(start + i);
            *l = a;
            *r = b;
        }
        n
    }
}
