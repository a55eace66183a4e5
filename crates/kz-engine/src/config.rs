//! Engine configuration.

use serde::Deserialize;

/// Which channels a GM master volume sysex applies to.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SysexScope {
    /// Every channel of the engine.
    #[default]
    Global,
    /// Only channels listening on the MIDI port the message arrived on.
    PerPort,
}

/// Sizes and timing of one engine. Every field has a default, so an empty
/// document is a valid configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: u32,
    /// Largest fragment the audio callback may ask for.
    pub max_fragment_frames: usize,
    /// Frames per modulation step.
    pub subfragment_frames: usize,
    pub max_voices: usize,
    pub max_notes: usize,
    /// Event pool size; also bounds events per fragment.
    pub max_events: usize,
    /// Delayed events and suspended script callbacks.
    pub max_scheduled: usize,
    pub max_script_callbacks: usize,
    /// Shortest release stage, in seconds.
    pub eg_min_release_time: f32,
    /// Envelope level treated as silence.
    pub eg_bottom: f32,
    /// Default transition time of script volume, pitch and pan changes.
    pub note_volume_time: f32,
    pub voice_stealing: bool,
    pub master_volume_sysex_scope: SysexScope,
    /// Instructions a script callback may run per fragment before it is
    /// suspended.
    pub script_instructions_per_slice: u32,
    /// Longest fast-kill, in modulation steps.
    pub max_fade_out_steps: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            max_fragment_frames: 512,
            subfragment_frames: 32,
            max_voices: 64,
            max_notes: 128,
            max_events: 1024,
            max_scheduled: 512,
            max_script_callbacks: 256,
            eg_min_release_time: 0.0025,
            eg_bottom: 0.001,
            note_volume_time: 0.013,
            voice_stealing: true,
            master_volume_sysex_scope: SysexScope::Global,
            script_instructions_per_slice: 70_000,
            max_fade_out_steps: 32,
        }
    }
}

impl EngineConfig {
    /// Check ranges the engine relies on. Returns a description of the
    /// first problem found.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.sample_rate < 8000 {
            return Err("sample_rate must be at least 8000");
        }
        if self.subfragment_frames == 0 || self.subfragment_frames > crate::voice::MAX_SUBFRAGMENT {
            return Err("subfragment_frames must be within 1..=64");
        }
        if self.max_fragment_frames == 0 {
            return Err("max_fragment_frames must be positive");
        }
        if self.max_voices == 0 || self.max_notes == 0 || self.max_events == 0 {
            return Err("pool sizes must be positive");
        }
        if self.max_fade_out_steps == 0 {
            return Err("max_fade_out_steps must be positive");
        }
        Ok(())
    }

    /// Modulation steps per second.
    pub fn sub_rate(&self) -> f32 {
        self.sample_rate as f32 / self.subfragment_frames as f32
    }
}
