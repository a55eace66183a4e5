//! Event records flowing from MIDI input and scripts into the engine.

/// Largest system exclusive message carried inline in an event.
pub const SYSEX_MAX: usize = 32;

/// Inline sysex payload, including the leading `F0` and trailing `F7`.
pub type SysexData = heapless::Vec<u8, SYSEX_MAX>;

/// An engine event.
///
/// Events are plain values stored in fixed-capacity pools; nothing in an
/// event owns heap memory.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Frame offset within the fragment the event belongs to.
    pub fragment_pos: u32,
    /// Engine channel the event is routed to, if any.
    pub channel: Option<u16>,
    /// Produced by a script or the engine rather than MIDI input; such
    /// events do not run script handlers.
    pub generated: bool,
}

impl Event {
    /// Create an event at the start of the fragment with no channel routing.
    pub fn new(kind: EventKind) -> Self {
        Self { kind, fragment_pos: 0, channel: None, generated: false }
    }

    /// Same event placed at `pos` within the fragment.
    pub fn at(mut self, pos: u32) -> Self {
        self.fragment_pos = pos;
        self
    }

    /// Same event routed to engine channel `channel`.
    pub fn on_channel(mut self, channel: u16) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Same event marked as generated.
    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    /// MIDI channel (0..=15) for MIDI-derived events.
    pub fn midi_channel(&self) -> Option<u8> {
        match self.kind {
            EventKind::NoteOn { midi_channel, .. }
            | EventKind::NoteOff { midi_channel, .. }
            | EventKind::ControlChange { midi_channel, .. }
            | EventKind::ChannelPressure { midi_channel, .. }
            | EventKind::NotePressure { midi_channel, .. }
            | EventKind::PitchBend { midi_channel, .. } => Some(midi_channel),
            _ => None,
        }
    }
}

/// Event payloads.
#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    // === MIDI-derived ===
    NoteOn { key: u8, velocity: u8, midi_channel: u8 },
    NoteOff { key: u8, velocity: u8, midi_channel: u8 },
    ControlChange { controller: u8, value: u8, midi_channel: u8 },
    ChannelPressure { value: u8, midi_channel: u8 },
    NotePressure { key: u8, value: u8, midi_channel: u8 },
    /// Pitch wheel, -8192..=8191.
    PitchBend { value: i16, midi_channel: u8 },
    /// System exclusive message received on MIDI port `port`.
    Sysex { data: SysexData, port: u8 },

    // === Script and engine generated ===
    /// Launch the voices of note `note`, created by a script.
    PlayNote { note: u32 },
    /// Release the note with ID `note`.
    StopNote { note: u32, velocity: u8 },
    /// Silence the note with ID `note` within the fast-kill bound.
    KillNote { note: u32 },
    /// Change a synthesis parameter of a running note.
    NoteSynthParam { note: u32, param: SynthParam, value: f32, relative: bool },
    /// Resume a suspended script callback.
    ScriptCallback { callback: u32 },
    /// Deferred key release after the sustain pedal went up.
    ReleaseKey { key: u8 },
}

/// Note parameters a script may override.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SynthParam {
    Volume,
    VolumeTime,
    VolumeCurve,
    Pitch,
    PitchTime,
    PitchCurve,
    Pan,
    PanTime,
    PanCurve,
    Cutoff,
    Resonance,
    Attack,
    Decay,
    Sustain,
    Release,
    AmpLfoDepth,
    AmpLfoFreq,
    CutoffLfoDepth,
    CutoffLfoFreq,
    PitchLfoDepth,
    PitchLfoFreq,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_position_and_channel() {
        let ev = Event::new(EventKind::NoteOn { key: 60, velocity: 100, midi_channel: 2 })
            .at(17)
            .on_channel(3);
        assert_eq!(ev.fragment_pos, 17);
        assert_eq!(ev.channel, Some(3));
        assert_eq!(ev.midi_channel(), Some(2));
    }

    #[test]
    fn script_events_have_no_midi_channel() {
        let ev = Event::new(EventKind::KillNote { note: 5 });
        assert_eq!(ev.midi_channel(), None);
    }

    #[test]
    fn sysex_payload_is_bounded() {
        let mut data = SysexData::new();
        for b in 0..SYSEX_MAX as u8 {
            assert!(data.push(b).is_ok());
        }
        assert!(data.push(0).is_err());
    }
}
