//! Engine channels: one instrument played from one MIDI channel, with the
//! controller, key and pedal state its events accumulate.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use kz_ir::{Event, Instrument, CTRL_TABLE_SIZE};
use ringbuf::traits::Split;
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::format::{Format, RegionMatcher};
use crate::scheduler::SchedTime;
use crate::script::{Program, ScriptRuntime};
use crate::tables::VolumeCurve;
use crate::voice::VoiceEvent;

/// Receiving end of a channel's input queue, drained on the audio thread.
pub type EventReceiver = HeapCons<Event>;
/// Sending end of a channel's input queue.
pub type EventSender = HeapProd<Event>;

/// Controller defaults after power-on and reset-all-controllers.
const DEFAULT_VOLUME: u8 = 100;
const DEFAULT_PAN: u8 = 64;
const DEFAULT_EXPRESSION: u8 = 127;

pub const CC_VOLUME: u8 = 7;
pub const CC_PAN: u8 = 10;
pub const CC_EXPRESSION: u8 = 11;
pub const CC_SUSTAIN: u8 = 64;
pub const CC_ALL_SOUND_OFF: u8 = 120;
pub const CC_RESET_CONTROLLERS: u8 = 121;
pub const CC_ALL_NOTES_OFF: u8 = 123;

/// An instrument made ready for a channel: region matcher built and script
/// compiled. Preparing allocates, so it happens off the audio thread; the
/// result is swapped in with [`crate::Engine::load_instrument`].
pub struct PreparedInstrument {
    pub instrument: Arc<Instrument>,
    pub(crate) matcher: Box<dyn RegionMatcher>,
    pub(crate) script: Option<ScriptRuntime>,
    pub(crate) key_switches: [bool; 128],
    pub(crate) trigger_ccs: [bool; 128],
}

impl PreparedInstrument {
    /// Build the matcher and compile the instrument script, if any.
    pub fn new(instrument: Arc<Instrument>, format: Format, config: &EngineConfig) -> Result<Self, EngineError> {
        let program = match &instrument.script {
            Some(source) => Some(Arc::new(crate::script::compile_source(source)?)),
            None => None,
        };
        Ok(Self::with_program(instrument, format, config, program))
    }

    /// Like [`PreparedInstrument::new`], sharing compiled programs through
    /// `cache`.
    #[cfg(feature = "std")]
    pub fn with_cache(
        instrument: Arc<Instrument>,
        format: Format,
        config: &EngineConfig,
        cache: &crate::script::ProgramCache,
    ) -> Result<Self, EngineError> {
        let program = match &instrument.script {
            Some(source) => Some(cache.get_or_compile(source)?),
            None => None,
        };
        Ok(Self::with_program(instrument, format, config, program))
    }

    fn with_program(
        instrument: Arc<Instrument>,
        format: Format,
        config: &EngineConfig,
        program: Option<Arc<Program>>,
    ) -> Self {
        let matcher = format.matcher(&instrument);
        let script = program.map(|p| {
            ScriptRuntime::new(p, config.max_script_callbacks, config.script_instructions_per_slice)
        });
        let key_switches = instrument.key_switch_bindings();
        let mut trigger_ccs = [false; 128];
        for cc in instrument.trigger_ccs() {
            trigger_ccs[cc as usize] = true;
        }
        Self { instrument, matcher, script, key_switches, trigger_ccs }
    }
}

/// Per-channel performance state.
pub struct ChannelState {
    pub(crate) instrument: Option<Arc<Instrument>>,
    pub(crate) matcher: Option<Box<dyn RegionMatcher>>,
    /// One round-robin counter per region.
    pub(crate) seq_counters: Vec<u32>,
    pub(crate) key_switches: [bool; 128],
    /// Controllers that start CC-triggered regions.
    pub(crate) trigger_ccs: [bool; 128],

    /// Listened MIDI channel (0..=15); `None` listens to all.
    pub midi_channel: Option<u8>,
    /// MIDI input port the channel is attached to.
    pub port: u8,
    /// Channel gain on top of CC 7.
    pub volume: f32,

    pub(crate) cc: [u8; CTRL_TABLE_SIZE],
    pub(crate) pitch_bend: i16,
    pub(crate) pressed: [bool; 128],
    pub(crate) key_velocity: [u8; 128],
    pub(crate) key_on_time: [SchedTime; 128],
    pub(crate) key_pressure: [u8; 128],
    pub(crate) last_sw_key: i16,
    pub(crate) prev_sw_key: i16,
    pub(crate) sustain: bool,
    /// Keys released while the pedal was down.
    pub(crate) deferred_release: [bool; 128],
    /// MIDI channel of the most recent note-on; script notes use it.
    pub(crate) last_midi_channel: u8,
    /// Velocity of the note-on before the current one, for `sw_vel=previous`.
    pub(crate) last_velocity: u8,
    /// Controller and pitch wheel changes of the current fragment.
    pub(crate) voice_events: Vec<VoiceEvent>,
    /// Set by `ignore_event`/`ignore_controller` on the event being handled.
    pub(crate) ignore_current: bool,
    pub(crate) midi_volume: f32,
}

impl ChannelState {
    fn new(max_events: usize) -> Self {
        let mut state = Self {
            instrument: None,
            matcher: None,
            seq_counters: Vec::new(),
            key_switches: [false; 128],
            trigger_ccs: [false; 128],
            midi_channel: None,
            port: 0,
            volume: 1.0,
            cc: [0; CTRL_TABLE_SIZE],
            pitch_bend: 0,
            pressed: [false; 128],
            key_velocity: [0; 128],
            key_on_time: [0; 128],
            key_pressure: [0; 128],
            last_sw_key: -1,
            prev_sw_key: -1,
            sustain: false,
            deferred_release: [false; 128],
            last_midi_channel: 0,
            last_velocity: 0,
            voice_events: Vec::with_capacity(max_events),
            ignore_current: false,
            midi_volume: 1.0,
        };
        state.reset_controllers();
        state
    }

    /// Controller table back to defaults; pedal up, wheel centred.
    pub(crate) fn reset_controllers(&mut self) {
        self.cc = [0; CTRL_TABLE_SIZE];
        self.cc[CC_VOLUME as usize] = DEFAULT_VOLUME;
        self.cc[CC_PAN as usize] = DEFAULT_PAN;
        self.cc[CC_EXPRESSION as usize] = DEFAULT_EXPRESSION;
        self.cc[kz_ir::CTRL_PITCH_BEND as usize] = 64;
        self.pitch_bend = 0;
        self.sustain = false;
        self.deferred_release = [false; 128];
        self.midi_volume = VolumeCurve::new().get(DEFAULT_VOLUME);
    }

    /// True if this channel takes events of MIDI channel `midi_channel`.
    pub fn listens_to(&self, midi_channel: u8) -> bool {
        self.midi_channel.map_or(true, |c| c == midi_channel)
    }

    pub fn instrument(&self) -> Option<&Arc<Instrument>> {
        self.instrument.as_ref()
    }

    pub fn controller(&self, cc: u8) -> u8 {
        self.cc.get(cc as usize).copied().unwrap_or(0)
    }

    pub fn is_key_down(&self, key: u8) -> bool {
        self.pressed.get(key as usize).copied().unwrap_or(false)
    }

    pub fn sustain_pedal(&self) -> bool {
        self.sustain
    }

    pub(crate) fn any_key_down_except(&self, key: u8) -> bool {
        self.pressed.iter().enumerate().any(|(k, &down)| down && k != key as usize)
    }

    /// Track key-switch keys; returns true if `key` is one.
    pub(crate) fn note_key_switch(&mut self, key: u8) -> bool {
        if !self.key_switches[key as usize] {
            return false;
        }
        if self.last_sw_key != key as i16 {
            self.prev_sw_key = self.last_sw_key;
            self.last_sw_key = key as i16;
        }
        true
    }
}

/// A channel of an engine.
pub struct EngineChannel {
    pub(crate) state: ChannelState,
    pub(crate) script: Option<ScriptRuntime>,
    pub(crate) input: Option<EventReceiver>,
}

impl EngineChannel {
    pub(crate) fn new(max_events: usize) -> Self {
        Self { state: ChannelState::new(max_events), script: None, input: None }
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ChannelState {
        &mut self.state
    }

    pub fn has_script(&self) -> bool {
        self.script.is_some()
    }

    /// Create the channel's input queue, replacing an earlier one, and
    /// return its sending end.
    pub(crate) fn open_input(&mut self, capacity: usize) -> EventSender {
        let (tx, rx) = HeapRb::<Event>::new(capacity).split();
        self.input = Some(rx);
        tx
    }

    /// Install a prepared instrument. Returns the previous one so it can be
    /// dropped away from the audio thread.
    pub(crate) fn install(&mut self, prepared: PreparedInstrument) -> Option<Arc<Instrument>> {
        let PreparedInstrument { instrument, matcher, script, key_switches, trigger_ccs } = prepared;
        self.state.seq_counters = vec![1; instrument.regions.len()];
        self.state.key_switches = key_switches;
        self.state.trigger_ccs = trigger_ccs;
        self.state.last_sw_key = -1;
        self.state.prev_sw_key = -1;
        for &(cc, value) in &instrument.initial_cc {
            if let Some(slot) = self.state.cc.get_mut(cc as usize) {
                *slot = value.min(127);
            }
            if cc == CC_VOLUME {
                self.state.midi_volume = VolumeCurve::new().get(value.min(127));
            }
        }
        self.state.matcher = Some(matcher);
        self.script = script;
        self.state.instrument.replace(instrument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kz_ir::Region;
    use ringbuf::traits::{Consumer, Producer};

    #[test]
    fn fresh_channel_has_midi_defaults() {
        let ch = EngineChannel::new(16);
        assert_eq!(ch.state().controller(CC_VOLUME), 100);
        assert_eq!(ch.state().controller(CC_PAN), 64);
        assert!(!ch.state().sustain_pedal());
        assert!(ch.state().listens_to(9));
    }

    #[test]
    fn key_switches_track_previous() {
        let mut ch = EngineChannel::new(16);
        ch.state.key_switches[24] = true;
        ch.state.key_switches[25] = true;
        assert!(ch.state.note_key_switch(24));
        assert!(ch.state.note_key_switch(25));
        assert!(!ch.state.note_key_switch(60));
        assert_eq!((ch.state.last_sw_key, ch.state.prev_sw_key), (25, 24));
    }

    #[test]
    fn install_resets_round_robin() {
        let mut inst = Instrument::new("two");
        inst.regions.push(Region::default());
        inst.regions.push(Region::default());
        let prepared = PreparedInstrument::new(Arc::new(inst), Format::Sfz, &EngineConfig::default()).unwrap();
        let mut ch = EngineChannel::new(16);
        assert!(ch.install(prepared).is_none());
        assert_eq!(ch.state.seq_counters, vec![1, 1]);
    }

    #[test]
    fn install_applies_initial_controllers() {
        let mut inst = Instrument::new("cc");
        inst.initial_cc.push((20, 99));
        let prepared = PreparedInstrument::new(Arc::new(inst), Format::Sfz, &EngineConfig::default()).unwrap();
        let mut ch = EngineChannel::new(16);
        ch.install(prepared);
        assert_eq!(ch.state().controller(20), 99);
    }

    #[test]
    fn input_queue_drops_when_full() {
        let mut ch = EngineChannel::new(16);
        let mut tx = ch.open_input(2);
        let ev = Event::new(kz_ir::EventKind::ReleaseKey { key: 1 });
        assert!(tx.try_push(ev.clone()).is_ok());
        assert!(tx.try_push(ev.clone()).is_ok());
        assert!(tx.try_push(ev).is_err());
        let rx = ch.input.as_mut().unwrap();
        assert!(rx.try_pop().is_some());
    }

    #[test]
    fn broken_script_fails_preparation() {
        let mut inst = Instrument::new("bad");
        inst.script = Some("on note\n$x := 1\nend on".into());
        let err = PreparedInstrument::new(Arc::new(inst), Format::Sfz, &EngineConfig::default());
        assert!(matches!(err, Err(EngineError::Script(_))));
    }
}
