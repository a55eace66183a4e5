//! Audio output backends for keyzone.
//!
//! Outputs take planar stereo `f32` blocks as produced by the engine.

mod capture;
mod cpal_backend;
mod traits;

pub use capture::CaptureOutput;
pub use cpal_backend::{CpalOutput, DEFAULT_DEVICE};
pub use traits::{AudioError, AudioOutput};
