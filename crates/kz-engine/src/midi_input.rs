//! MIDI input: a byte stream parser, input ports feeding channel queues,
//! and the connected-port list the audio thread reads without locking.

use std::string::String;
use std::sync::Arc;
use std::vec::Vec;

use arc_swap::ArcSwap;
use kz_ir::{Event, EventKind, SysexData};
use ringbuf::traits::Producer;
use tracing::{debug, warn};

use crate::engine_channel::EventSender;

/// Parses a raw MIDI byte stream into events.
///
/// Handles running status for channel messages, treats note-on with
/// velocity 0 as note-off and collects system exclusive messages up to
/// [`kz_ir::SYSEX_MAX`] bytes. Real-time bytes are skipped without
/// disturbing the message in progress.
#[derive(Debug, Default)]
pub struct MidiParser {
    status: u8,
    data: [u8; 2],
    have: usize,
    sysex: SysexData,
    in_sysex: bool,
    sysex_overflow: bool,
}

fn data_len(status: u8) -> usize {
    match status & 0xF0 {
        0xC0 | 0xD0 => 1,
        _ => 2,
    }
}

impl MidiParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; returns an event when a message is complete. Sysex
    /// events carry `port`.
    pub fn push(&mut self, byte: u8, port: u8) -> Option<Event> {
        if byte >= 0xF8 {
            return None;
        }
        if byte == 0xF0 {
            self.sysex.clear();
            let _ = self.sysex.push(byte);
            self.in_sysex = true;
            self.sysex_overflow = false;
            self.status = 0;
            return None;
        }
        if self.in_sysex {
            if byte == 0xF7 {
                self.in_sysex = false;
                if self.sysex.push(byte).is_err() || self.sysex_overflow {
                    debug!(port, "sysex message too long, dropped");
                    return None;
                }
                let data = core::mem::take(&mut self.sysex);
                return Some(Event::new(EventKind::Sysex { data, port }));
            }
            if byte & 0x80 != 0 {
                // A status byte aborts the sysex message.
                self.in_sysex = false;
            } else {
                if self.sysex.push(byte).is_err() {
                    self.sysex_overflow = true;
                }
                return None;
            }
        }
        if byte & 0x80 != 0 {
            // System common messages cancel running status.
            self.status = if byte < 0xF0 { byte } else { 0 };
            self.have = 0;
            return None;
        }
        if self.status == 0 {
            return None;
        }
        self.data[self.have] = byte;
        self.have += 1;
        if self.have < data_len(self.status) {
            return None;
        }
        self.have = 0;
        self.channel_message()
    }

    fn channel_message(&self) -> Option<Event> {
        let midi_channel = self.status & 0x0F;
        let [a, b] = self.data;
        let kind = match self.status & 0xF0 {
            0x80 => EventKind::NoteOff { key: a, velocity: b, midi_channel },
            0x90 if b == 0 => EventKind::NoteOff { key: a, velocity: 0, midi_channel },
            0x90 => EventKind::NoteOn { key: a, velocity: b, midi_channel },
            0xA0 => EventKind::NotePressure { key: a, value: b, midi_channel },
            0xB0 => EventKind::ControlChange { controller: a, value: b, midi_channel },
            0xD0 => EventKind::ChannelPressure { value: a, midi_channel },
            0xE0 => EventKind::PitchBend { value: ((b as i16) << 7 | a as i16) - 8192, midi_channel },
            // Program change: instrument selection happens on the control side.
            _ => return None,
        };
        Some(Event::new(kind))
    }
}

struct Route {
    /// MIDI channel taken (0..=15); `None` takes all.
    midi_channel: Option<u8>,
    sender: EventSender,
}

/// A MIDI input port feeding the input queues of engine channels.
pub struct MidiInputPort {
    index: u8,
    parser: MidiParser,
    routes: Vec<Route>,
    dropped: u64,
}

impl MidiInputPort {
    pub fn new(index: u8) -> Self {
        Self { index, parser: MidiParser::new(), routes: Vec::new(), dropped: 0 }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    /// Send events of `midi_channel` (all channels if `None`) to `sender`.
    pub fn connect(&mut self, midi_channel: Option<u8>, sender: EventSender) {
        self.routes.push(Route { midi_channel, sender });
    }

    /// Events lost because a channel queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Parse `bytes` and queue the resulting events at fragment position
    /// `pos`. A full channel queue drops the event.
    pub fn feed(&mut self, bytes: &[u8], pos: u32) {
        for &byte in bytes {
            if let Some(event) = self.parser.push(byte, self.index) {
                self.dispatch(event.at(pos));
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        let midi_channel = event.midi_channel();
        for route in &mut self.routes {
            let wanted = match (route.midi_channel, midi_channel) {
                (Some(want), Some(got)) => want == got,
                _ => true,
            };
            if wanted && route.sender.try_push(event.clone()).is_err() {
                self.dropped += 1;
                warn!(port = self.index, "channel input queue full, event dropped");
            }
        }
    }
}

/// A MIDI port as seen by the control side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MidiPortInfo {
    pub index: u8,
    pub name: String,
}

/// Connected MIDI ports, published by the control thread and read by the
/// audio thread through a lock-free snapshot.
#[derive(Default)]
pub struct MidiPortList {
    ports: ArcSwap<Vec<MidiPortInfo>>,
}

impl MidiPortList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list. Allocates; control thread only.
    pub fn publish(&self, ports: Vec<MidiPortInfo>) {
        self.ports.store(Arc::new(ports));
    }

    pub fn snapshot(&self) -> Arc<Vec<MidiPortInfo>> {
        self.ports.load_full()
    }

    /// Lock-free; safe on the audio thread.
    pub fn is_connected(&self, index: u8) -> bool {
        self.ports.load().iter().any(|p| p.index == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::traits::{Consumer, Observer, Split};
    use ringbuf::HeapRb;

    fn parse(bytes: &[u8]) -> Vec<EventKind> {
        let mut p = MidiParser::new();
        bytes.iter().filter_map(|&b| p.push(b, 3)).map(|e| e.kind).collect()
    }

    #[test]
    fn running_status_repeats_the_last_status() {
        let events = parse(&[0x91, 60, 100, 62, 90, 60, 0]);
        assert_eq!(
            events,
            vec![
                EventKind::NoteOn { key: 60, velocity: 100, midi_channel: 1 },
                EventKind::NoteOn { key: 62, velocity: 90, midi_channel: 1 },
                EventKind::NoteOff { key: 60, velocity: 0, midi_channel: 1 },
            ]
        );
    }

    #[test]
    fn realtime_bytes_do_not_break_messages() {
        let events = parse(&[0xB0, 7, 0xF8, 64]);
        assert_eq!(events, vec![EventKind::ControlChange { controller: 7, value: 64, midi_channel: 0 }]);
    }

    #[test]
    fn pitch_bend_is_centred() {
        assert_eq!(parse(&[0xE0, 0, 64]), vec![EventKind::PitchBend { value: 0, midi_channel: 0 }]);
        assert_eq!(parse(&[0xE0, 0, 0]), vec![EventKind::PitchBend { value: -8192, midi_channel: 0 }]);
    }

    #[test]
    fn sysex_is_collected_with_port() {
        let gs = [0xF0, 0x41, 0x10, 0x42, 0x12, 0x40, 0x00, 0x7F, 0x00, 0x41, 0xF7];
        let events = parse(&gs);
        let [EventKind::Sysex { data, port }] = events.as_slice() else { panic!("{events:?}") };
        assert_eq!(data.as_slice(), &gs);
        assert_eq!(*port, 3);
    }

    #[test]
    fn oversized_sysex_is_dropped() {
        let mut bytes = vec![0xF0];
        bytes.extend(std::iter::repeat(1).take(64));
        bytes.push(0xF7);
        bytes.extend([0x90, 60, 1]);
        assert_eq!(parse(&bytes), vec![EventKind::NoteOn { key: 60, velocity: 1, midi_channel: 0 }]);
    }

    #[test]
    fn port_routes_by_midi_channel_and_drops_when_full() {
        let (tx_a, mut rx_a) = HeapRb::<Event>::new(1).split();
        let (tx_b, rx_b) = HeapRb::<Event>::new(8).split();
        let mut port = MidiInputPort::new(0);
        port.connect(Some(0), tx_a);
        port.connect(None, tx_b);
        port.feed(&[0x90, 60, 100, 0x91, 61, 100, 0x90, 62, 100], 5);
        assert_eq!(rx_a.try_pop().map(|e| e.fragment_pos), Some(5));
        assert!(rx_a.try_pop().is_none());
        assert_eq!(port.dropped(), 1);
        assert_eq!(rx_b.occupied_len(), 3);
    }

    #[test]
    fn port_list_snapshot() {
        let list = MidiPortList::new();
        assert!(!list.is_connected(0));
        list.publish(vec![MidiPortInfo { index: 2, name: "keys".into() }]);
        assert!(list.is_connected(2));
        assert_eq!(list.snapshot().len(), 1);
    }
}
