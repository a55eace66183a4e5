//! The output seam between the controller and a sink for rendered blocks.

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("cannot open audio device: {0}")]
    DeviceInit(String),
    #[error("cannot create output stream: {0}")]
    StreamCreate(String),
    #[error("playback failed: {0}")]
    Playback(String),
    #[error("no matching audio output device")]
    NoDevice,
}

/// A sink for planar stereo blocks rendered by the engines.
pub trait AudioOutput {
    fn sample_rate(&self) -> u32;

    /// Queue one block; `left` and `right` have the same length. May block
    /// until the sink has room.
    fn write(&mut self, left: &[f32], right: &[f32]) -> Result<(), AudioError>;

    fn start(&mut self) -> Result<(), AudioError>;

    fn stop(&mut self) -> Result<(), AudioError>;
}
