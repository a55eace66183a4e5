//! Controller configuration, loaded from YAML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, File, FileFormat};
use kz_engine::{EngineConfig, Format};
use serde::Deserialize;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config load/parse error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level controller configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    pub engine: EngineConfig,
    pub audio: AudioConfig,
    pub midi_ports: Vec<MidiPortConfig>,
    pub channels: Vec<ChannelConfig>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Frames rendered per block on the playback thread.
    pub buffer_frames: usize,
    /// Output device name; engines are shared per device.
    pub device: String,
    /// How long an instrument swap waits for the audio thread, in ms.
    pub handshake_timeout_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self { buffer_frames: 256, device: kz_audio::DEFAULT_DEVICE.into(), handshake_timeout_ms: 2000 }
    }
}

impl AudioConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MidiPortConfig {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ChannelConfig {
    pub instrument: Option<PathBuf>,
    #[serde(default)]
    pub format: Format,
    /// MIDI channel 1..=16; all channels when unset.
    #[serde(default)]
    pub midi_channel: Option<u8>,
    /// Index into `midi_ports`.
    #[serde(default)]
    pub port: u8,
    #[serde(default = "unity")]
    pub volume: f32,
}

fn unity() -> f32 {
    1.0
}

impl ControllerConfig {
    /// Load and validate a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .add_source(File::from_str(text, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate().map_err(|e| ConfigError::Invalid(e.into()))?;
        if self.audio.buffer_frames == 0 {
            return Err(ConfigError::Invalid("audio.buffer_frames must be positive".into()));
        }
        for (i, ch) in self.channels.iter().enumerate() {
            if let Some(mc) = ch.midi_channel {
                if !(1..=16).contains(&mc) {
                    return Err(ConfigError::Invalid(format!("channel {i}: midi_channel {mc} not in 1..=16")));
                }
            }
            if !self.midi_ports.is_empty() && ch.port as usize >= self.midi_ports.len() {
                return Err(ConfigError::Invalid(format!("channel {i}: no MIDI port {}", ch.port)));
            }
            if !(0.0..=4.0).contains(&ch.volume) {
                return Err(ConfigError::Invalid(format!("channel {i}: volume {} out of range", ch.volume)));
            }
        }
        Ok(())
    }
}
