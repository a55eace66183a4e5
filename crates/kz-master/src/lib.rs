//! Headless controller for keyzone.
//!
//! Owns the engine registry, loads instruments off the audio thread and
//! swaps them in under the engine disable handshake, routes MIDI bytes to
//! channels and drives real-time or offline rendering. Shared by the CLI
//! and the integration tests.

mod config;
mod playback;
mod render;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kz_engine::registry::disable as disable_engine;
use kz_engine::{
    EngineError, EngineRegistry, Format, MidiInputPort, MidiPortInfo, MidiPortList, PreparedInstrument, ProgramCache,
    SharedEngine,
};
use tracing::info;

pub use config::{AudioConfig, ChannelConfig, ConfigError, ControllerConfig, MidiPortConfig};
pub use kz_audio::AudioError;
pub use kz_engine::EngineConfig;
pub use kz_formats::FormatError;
pub use kz_ir::{EventKind, Instrument};
pub use render::{render, Cue, RenderOptions, Rendered};

use playback::PlaybackHandle;

/// Error type for controller operations.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("instrument load failed: {0}")]
    Format(#[from] FormatError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("audio: {0}")]
    Audio(#[from] AudioError),

    #[error("no channel {0}")]
    InvalidChannel(usize),

    #[error("no MIDI port {0}")]
    UnknownPort(u8),
}

/// A sampler channel as the controller sees it.
struct ChannelSlot {
    engine: SharedEngine,
    format: Format,
    /// Channel index within its engine.
    index: u16,
    instrument: Option<PathBuf>,
}

/// Headless sampler controller.
pub struct Controller {
    config: ControllerConfig,
    registry: EngineRegistry,
    cache: ProgramCache,
    ports: Arc<MidiPortList>,
    inputs: Vec<MidiInputPort>,
    channels: Vec<ChannelSlot>,
    playback: Option<PlaybackHandle>,
}

impl Controller {
    /// Build engines and channels from `config` and load the configured
    /// instruments.
    pub fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        config.validate()?;
        let ports = Arc::new(MidiPortList::new());
        let port_names: Vec<String> = if config.midi_ports.is_empty() {
            vec!["default".into()]
        } else {
            config.midi_ports.iter().map(|p| p.name.clone()).collect()
        };
        ports.publish(
            port_names
                .iter()
                .enumerate()
                .map(|(i, name)| MidiPortInfo { index: i as u8, name: name.clone() })
                .collect(),
        );
        let inputs = (0..port_names.len()).map(|i| MidiInputPort::new(i as u8)).collect();

        let mut controller = Self {
            config,
            registry: EngineRegistry::new(),
            cache: ProgramCache::new(),
            ports,
            inputs,
            channels: Vec::new(),
            playback: None,
        };
        for ch in controller.config.channels.clone() {
            let c = controller.add_channel(ch.format, ch.port, ch.midi_channel.map(|m| m - 1))?;
            controller.set_volume(c, ch.volume)?;
            if let Some(path) = &ch.instrument {
                controller.load_instrument(c, path)?;
            }
        }
        Ok(controller)
    }

    /// Load a YAML configuration file and build a controller from it.
    pub fn from_file(path: &Path) -> Result<Self, ControllerError> {
        Self::new(ControllerConfig::load(path)?)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn ports(&self) -> &Arc<MidiPortList> {
        &self.ports
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of distinct engines in use.
    pub fn engine_count(&self) -> usize {
        self.registry.len()
    }

    /// Add a channel playing `format` instruments, fed by MIDI `port` on
    /// `midi_channel` (0..=15, all when `None`). Returns its index.
    pub fn add_channel(&mut self, format: Format, port: u8, midi_channel: Option<u8>) -> Result<usize, ControllerError> {
        let input = self.inputs.get_mut(port as usize).ok_or(ControllerError::UnknownPort(port))?;
        let engine = self.registry.acquire(format, &self.config.audio.device, &self.config.engine)?;
        let timeout = self.config.audio.handshake_timeout();
        let (index, sender) = {
            let mut guard = disable_engine(&engine, timeout)?;
            guard.set_port_list(self.ports.clone());
            let index = guard.add_channel();
            let chan = guard.channel_mut(index)?;
            chan.state_mut().midi_channel = midi_channel;
            chan.state_mut().port = port;
            (index, guard.open_input(index)?)
        };
        input.connect(midi_channel, sender);
        self.channels.push(ChannelSlot { engine, format, index, instrument: None });
        Ok(self.channels.len() - 1)
    }

    pub fn set_volume(&mut self, channel: usize, volume: f32) -> Result<(), ControllerError> {
        let slot = self.slot(channel)?;
        let mut engine = disable_engine(&slot.engine, self.config.audio.handshake_timeout())?;
        engine.channel_mut(slot.index)?.state_mut().volume = volume;
        Ok(())
    }

    /// Load the SFZ file at `path` and swap it onto `channel`.
    pub fn load_instrument(&mut self, channel: usize, path: &Path) -> Result<(), ControllerError> {
        let instrument = kz_formats::load_sfz(path)?;
        self.set_instrument(channel, instrument)?;
        if let Some(slot) = self.channels.get_mut(channel) {
            slot.instrument = Some(path.to_path_buf());
        }
        Ok(())
    }

    /// Prepare `instrument` and swap it onto `channel`. Everything that
    /// allocates happens before the engine is disabled.
    pub fn set_instrument(&mut self, channel: usize, instrument: Instrument) -> Result<(), ControllerError> {
        let slot = self.slot(channel)?;
        let prepared =
            PreparedInstrument::with_cache(Arc::new(instrument), slot.format, &self.config.engine, &self.cache)?;
        let old = {
            let mut engine = disable_engine(&slot.engine, self.config.audio.handshake_timeout())?;
            engine.load_instrument(slot.index, prepared)?
        };
        // The previous instrument is freed here, outside the handshake.
        drop(old);
        Ok(())
    }

    /// Path of the instrument file loaded on `channel`, if any.
    pub fn instrument_path(&self, channel: usize) -> Option<&Path> {
        self.channels.get(channel)?.instrument.as_deref()
    }

    pub fn instrument(&self, channel: usize) -> Option<Arc<Instrument>> {
        let slot = self.channels.get(channel)?;
        let engine = slot.engine.lock();
        engine.channel(slot.index)?.state().instrument().cloned()
    }

    /// Feed raw MIDI bytes received on `port`. Events reach the channels
    /// at their next fragment; a full channel queue drops the event.
    pub fn midi_in(&mut self, port: u8, bytes: &[u8]) -> Result<(), ControllerError> {
        let input = self.inputs.get_mut(port as usize).ok_or(ControllerError::UnknownPort(port))?;
        input.feed(bytes, 0);
        Ok(())
    }

    /// Events dropped on `port` because a channel queue was full.
    pub fn dropped_events(&self, port: u8) -> u64 {
        self.inputs.get(port as usize).map_or(0, MidiInputPort::dropped)
    }

    /// Render `frames` frames of every engine into `left`/`right`, mixed.
    /// Used when no audio device drives the engines.
    pub fn render_block(&self, left: &mut [f32], right: &mut [f32]) {
        let engines: Vec<SharedEngine> = self.registry.engines().map(|(_, _, e)| e.clone()).collect();
        playback::mix_engines(&engines, left, right, &mut Vec::new(), &mut Vec::new());
    }

    // --- Real-time playback ---

    /// Start the playback thread on the configured audio device.
    pub fn play(&mut self) -> Result<(), ControllerError> {
        self.stop();
        let engines: Vec<SharedEngine> = self.registry.engines().map(|(_, _, e)| e.clone()).collect();
        self.playback = Some(PlaybackHandle::spawn(engines, &self.config.audio)?);
        info!(engines = self.registry.len(), "playback started");
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(pb) = self.playback.take() {
            pb.stop();
            info!("playback stopped");
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playback.as_ref().is_some_and(PlaybackHandle::is_running)
    }

    /// Frames written to the device since playback started.
    pub fn frames_played(&self) -> u64 {
        self.playback.as_ref().map_or(0, PlaybackHandle::frames)
    }

    fn slot(&self, channel: usize) -> Result<&ChannelSlot, ControllerError> {
        self.channels.get(channel).ok_or(ControllerError::InvalidChannel(channel))
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
        for slot in self.channels.drain(..) {
            self.registry.release(slot.format, &self.config.audio.device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kz_ir::{Region, Sample, SampleData};

    fn tone() -> Instrument {
        let mut inst = Instrument::new("tone");
        let mut sample = Sample::new("tone");
        sample.data = SampleData::Mono16((0..2000).map(|i| ((i % 40) as i16 - 20) * 800).collect());
        let key = inst.samples.insert(sample);
        inst.regions.push(Region { sample: Some(key), ..Region::default() });
        inst
    }

    fn controller(yaml: &str) -> Controller {
        Controller::new(ControllerConfig::from_yaml(yaml).unwrap()).unwrap()
    }

    #[test]
    fn channels_share_engine_per_format() {
        let ctrl = controller("channels: [ {}, {}, { format: sf2 } ]");
        assert_eq!(ctrl.channel_count(), 3);
        assert_eq!(ctrl.engine_count(), 2);
    }

    #[test]
    fn midi_reaches_the_listening_channel() {
        let mut ctrl = controller("channels: [ { midi_channel: 1 }, { midi_channel: 2 } ]");
        ctrl.set_instrument(0, tone()).unwrap();
        ctrl.set_instrument(1, tone()).unwrap();

        // Note-on on MIDI channel 2 only.
        ctrl.midi_in(0, &[0x91, 60, 100]).unwrap();
        let (mut l, mut r) = (vec![0.0; 256], vec![0.0; 256]);
        ctrl.render_block(&mut l, &mut r);
        assert!(l.iter().any(|&s| s != 0.0));

        let engine = ctrl.channels[1].engine.lock();
        assert!(engine.channel(1).unwrap().state().is_key_down(60));
        assert!(!engine.channel(0).unwrap().state().is_key_down(60));
    }

    #[test]
    fn swapping_instruments_while_locked_times_out() {
        let yaml = "audio: { handshake_timeout_ms: 20 }\nchannels: [ {} ]";
        let mut ctrl = controller(yaml);
        let held = ctrl.channels[0].engine.clone();
        let guard = held.lock();
        let err = ctrl.set_instrument(0, tone()).unwrap_err();
        assert!(matches!(err, ControllerError::Engine(EngineError::Timeout)));
        drop(guard);
        ctrl.set_instrument(0, tone()).unwrap();
        assert_eq!(ctrl.instrument(0).unwrap().name, "tone");
    }

    #[test]
    fn unknown_channel_and_port() {
        let mut ctrl = controller("{}");
        assert!(matches!(ctrl.set_instrument(0, tone()), Err(ControllerError::InvalidChannel(0))));
        assert!(matches!(ctrl.midi_in(5, &[0x90, 60, 1]), Err(ControllerError::UnknownPort(5))));
        assert!(ctrl.ports().is_connected(0));
    }
}
