//! The engine: channels sharing one voice pool, note pool, event pool and
//! scheduler, rendered fragment by fragment on the audio thread.
//!
//! A fragment runs in four steps. Input events are imported and routed to
//! channels; events and scheduled entries are processed in time order,
//! running script handlers and triggering or releasing voices; voices are
//! rendered; finished voices and notes are reclaimed. Nothing on this path
//! allocates once the engine is built.

use alloc::sync::Arc;
use alloc::vec::Vec;

use kz_ir::{
    Event, EventKind, Instrument, OffMode, SwVel, SynthParam, SysexData, Trigger, CTRL_CHANNEL_PRESSURE,
    CTRL_PITCH_BEND,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ringbuf::traits::Consumer;
use tracing::{debug, warn};

use crate::bridge::Bridge;
use crate::config::{EngineConfig, SysexScope};
use crate::engine_channel::{
    ChannelState, EngineChannel, EventSender, PreparedInstrument, CC_ALL_NOTES_OFF, CC_ALL_SOUND_OFF, CC_PAN,
    CC_RESET_CONTROLLERS, CC_SUSTAIN, CC_VOLUME,
};
use crate::error::EngineError;
use crate::event_queue::{EventQueue, QueuedEvent};
use crate::format::{Format, RegionMatches};
use crate::note::{Note, NoteOverrides};
use crate::pool::{Pool, PoolId};
use crate::query::Query;
use crate::scheduler::{micros_to_frames, SchedTime, Scheduler};
use crate::script::{CallbackInfo, HandlerKind, ScriptId};
use crate::stream::RamStreams;
use crate::tables::{PanCurve, VolumeCurve};
use crate::voice::{
    RenderContext, VoiceEvent, VoiceEventKind, VoiceKind, VoiceScratch, VoiceSetup, VoiceState, VoiceTiming,
};
use crate::voice_pool::VoicePool;

/// MIDI input ports an engine tells apart.
pub const MAX_PORTS: usize = 16;

/// Key CC-triggered notes play.
const CC_TRIGGER_KEY: u8 = 60;
const CC_TRIGGER_VELOCITY: u8 = 127;

/// Capacity of a channel input queue created by [`Engine::open_input`].
const INPUT_QUEUE_LEN: usize = 1024;

const DEFAULT_SEED: u64 = 0x6b7a_5eed;

/// Engine state shared by all channels.
pub(crate) struct Core {
    pub(crate) config: EngineConfig,
    pub(crate) format: Format,
    pub(crate) timing: VoiceTiming,
    pub(crate) events: Pool<Event>,
    pub(crate) notes: Pool<Note>,
    pub(crate) voices: VoicePool,
    pub(crate) scheduler: Scheduler<PoolId>,
    pub(crate) queue: EventQueue,
    /// Engine time at the start of the current fragment.
    pub(crate) fragment_start: SchedTime,
    pub(crate) fragment_frames: u32,
    /// Time of the event being processed.
    pub(crate) now: SchedTime,
    pub(crate) rng: StdRng,
    pan_curve: PanCurve,
    volume_curve: VolumeCurve,
    scratch: VoiceScratch,
    master_volume: f32,
    port_volume: [f32; MAX_PORTS],
    /// Events handed to [`Engine::send`] for the next fragment.
    pending: Vec<Event>,
}

fn timing_for(config: &EngineConfig) -> VoiceTiming {
    VoiceTiming {
        sample_rate: config.sample_rate as f32,
        sub_frames: config.subfragment_frames,
        fade_time: config.max_fade_out_steps as f32 / config.sub_rate(),
        min_release: config.eg_min_release_time,
        eg_bottom: config.eg_bottom,
        kill_steps: config.max_fade_out_steps as i32,
    }
}

impl Core {
    fn new(config: EngineConfig, format: Format) -> Self {
        Self {
            timing: timing_for(&config),
            format,
            events: Pool::with_capacity(config.max_events, || Event::new(EventKind::ReleaseKey { key: 0 })),
            notes: Pool::with_capacity(config.max_notes, Note::default),
            voices: VoicePool::new(config.max_voices, config.voice_stealing),
            scheduler: Scheduler::with_capacity(config.max_scheduled),
            queue: EventQueue::with_capacity(config.max_events),
            fragment_start: 0,
            fragment_frames: 0,
            now: 0,
            rng: StdRng::seed_from_u64(DEFAULT_SEED),
            pan_curve: PanCurve::new(),
            volume_curve: VolumeCurve::new(),
            scratch: VoiceScratch::default(),
            master_volume: 1.0,
            port_volume: [1.0; MAX_PORTS],
            pending: Vec::with_capacity(config.max_events),
            config,
        }
    }

    /// Engine time at frame `pos` of the current fragment.
    pub(crate) fn time_at(&self, pos: u32) -> SchedTime {
        self.fragment_start + pos as SchedTime
    }

    /// Store `event` and queue it at frame `pos` of the current fragment.
    pub(crate) fn enqueue(&mut self, event: Event, pos: u32) -> Option<PoolId> {
        let Some(id) = self.events.allocate() else {
            warn!("event pool exhausted, dropping event");
            return None;
        };
        if let Some(slot) = self.events.get_mut(id) {
            *slot = event;
        }
        if !self.queue.push(pos, id) {
            warn!("event queue full, dropping event");
            self.events.free(id);
            return None;
        }
        Some(id)
    }

    /// Store `event` and schedule it for engine time `time`.
    pub(crate) fn schedule(&mut self, event: Event, time: SchedTime) -> Option<PoolId> {
        let id = self.events.allocate()?;
        if let Some(slot) = self.events.get_mut(id) {
            *slot = event;
        }
        if !self.scheduler.schedule(time, id) {
            debug!(time, "scheduler full, dropping event");
            self.events.free(id);
            return None;
        }
        Some(id)
    }

    /// Schedule `event` `us` microseconds after the current event.
    pub(crate) fn schedule_after(&mut self, event: Event, us: u64) -> Option<PoolId> {
        let time = self.now + micros_to_frames(us, self.config.sample_rate);
        self.schedule(event, time)
    }

    /// Drop a scheduled or queued event before it is dispatched.
    pub(crate) fn cancel(&mut self, id: PoolId) {
        self.scheduler.cancel(id);
        self.events.free(id);
    }

    /// Move scheduled entries due in this fragment into the event queue.
    fn pull_due(&mut self) {
        let end = self.time_at(self.fragment_frames);
        while let Some((time, id)) = self.scheduler.pop_due(end) {
            let pos = time.saturating_sub(self.fragment_start) as u32;
            if !self.queue.push(pos, id) {
                warn!("event queue full, dropping scheduled event");
                self.events.free(id);
            }
        }
    }

    /// Run a script handler on `chan`. Returns true if the handler asked
    /// to ignore the event.
    fn run_handler(&mut self, chan: &mut EngineChannel, c: u16, pos: u32, info: CallbackInfo) -> bool {
        let Some(script) = chan.script.as_mut() else { return false };
        let Some(cb) = script.spawn(info) else { return false };
        chan.state.ignore_current = false;
        let mut host = Bridge::new(self, &mut chan.state, c, pos);
        script.run(cb, &mut host);
        chan.state.ignore_current
    }

    fn has_handler(chan: &EngineChannel, kind: HandlerKind) -> bool {
        chan.script.as_ref().is_some_and(|s| s.has_handler(kind))
    }

    fn resume_callback(&mut self, chan: &mut EngineChannel, c: u16, pos: u32, callback: u32) {
        let (Some(script), Some(id)) = (chan.script.as_mut(), PoolId::from_raw(callback)) else { return };
        let mut host = Bridge::new(self, &mut chan.state, c, pos);
        script.run(id, &mut host);
    }

    fn push_voice_event(st: &mut ChannelState, pos: u32, kind: VoiceEventKind) {
        if st.voice_events.len() < st.voice_events.capacity() {
            st.voice_events.push(VoiceEvent { pos, kind });
        }
    }

    // === Notes ===

    fn note_on(&mut self, chan: &mut EngineChannel, c: u16, pos: u32, key: u8, velocity: u8, midi_channel: u8, generated: bool) {
        let k = key as usize;
        let st = &mut chan.state;
        st.last_midi_channel = midi_channel;
        let legato = st.any_key_down_except(key);
        st.note_key_switch(key);
        st.pressed[k] = true;
        st.key_velocity[k] = velocity;
        st.key_on_time[k] = self.now;
        st.deferred_release[k] = false;

        let Some(id) = self.notes.allocate() else {
            warn!(channel = c, key, "note pool exhausted");
            return;
        };
        if let Some(note) = self.notes.get_mut(id) {
            *note = Note::new(key, velocity, c, self.now);
            note.legato = legato;
        }

        if !generated && Self::has_handler(chan, HandlerKind::Note) {
            let info = CallbackInfo {
                handler: HandlerKind::Note,
                event: ScriptId::Note(id).raw(),
                note: Some(id),
                key,
                velocity,
                cc: 0,
            };
            if self.run_handler(chan, c, pos, info) {
                // Ignored notes never launch; reclaim them like finished ones.
                if let Some(note) = self.notes.get_mut(id) {
                    note.launched = true;
                    note.released = true;
                }
                chan.state.last_velocity = velocity;
                return;
            }
        }
        self.launch_note(&mut chan.state, c, id, pos);
        chan.state.last_velocity = velocity;
    }

    /// Start the voices of a note that has not launched yet.
    pub(crate) fn launch_note(&mut self, st: &mut ChannelState, c: u16, id: PoolId, pos: u32) {
        let Some(note) = self.notes.get_mut(id) else { return };
        if note.launched {
            return;
        }
        note.launched = true;
        let (key, velocity) = (note.key, note.velocity);
        let trig = Trigger::ATTACK | if note.legato { Trigger::LEGATO } else { Trigger::FIRST };
        let Some(inst) = st.instrument.clone() else { return };

        let mut matches = RegionMatches::new();
        {
            let mut q = Query::note(st.last_midi_channel + 1, key, velocity, &st.cc, &st.pressed, trig);
            q.bend = st.pitch_bend;
            q.rand = self.rng.gen();
            q.polyaft = st.key_pressure[key as usize];
            q.last_sw_key = st.last_sw_key;
            q.prev_sw_key = st.prev_sw_key;
            if let Some(matcher) = st.matcher.as_deref() {
                matcher.note_regions(&q, &inst.regions, &mut st.seq_counters, &mut matches);
            }
        }
        for &index in &matches {
            self.start_voice(st, c, &inst, index, Some(id), key, velocity, VoiceKind::Normal, pos, 1.0);
        }

        let Some(note) = self.notes.get(id) else { return };
        let (fade_in, fade_out, voices) = (note.fade_in, note.fade_out, note.voices.clone());
        for v in voices {
            if let Some(voice) = self.voices.get_mut(v) {
                if let Some(time) = fade_in {
                    voice.fade_in(time);
                }
                if let Some((time, stop)) = fade_out {
                    voice.fade_out(time, stop);
                }
            }
        }
    }

    /// Trigger one voice for region `index`. Returns `None` when the region
    /// has no playable sample or no voice could be claimed.
    #[allow(clippy::too_many_arguments)]
    fn start_voice(
        &mut self,
        st: &ChannelState,
        c: u16,
        inst: &Instrument,
        index: u32,
        note: Option<PoolId>,
        key: u8,
        velocity: u8,
        kind: VoiceKind,
        pos: u32,
        attenuation: f32,
    ) -> Option<PoolId> {
        let region = inst.regions.get(index as usize)?;
        let (Some(sample_key), Some(sample)) = (region.sample, inst.sample_for(region)) else {
            debug!(region = index, "region has no playable sample");
            return None;
        };
        if region.group != 0 {
            self.stop_group(c, region.group, note, pos);
        }
        let Some(id) = self.voices.allocate() else {
            warn!(channel = c, key, "voice pool exhausted");
            return None;
        };

        let overrides = note.and_then(|n| self.notes.get(n)).map_or_else(NoteOverrides::default, |n| n.overrides);
        let velocity = if region.sw_vel == SwVel::Previous { st.last_velocity } else { velocity };
        let random = [self.rng.gen(), self.rng.gen(), self.rng.gen(), self.rng.gen()];
        let timing = self.timing;
        let setup = VoiceSetup {
            region,
            region_index: index,
            sample_key,
            sample,
            curves: &inst.curves,
            cc: &st.cc,
            key,
            velocity,
            bend: st.pitch_bend,
            note,
            channel: c,
            kind,
            fragment_pos: pos,
            overrides: &overrides,
            attenuation,
            random,
            timing: &timing,
        };
        if !self.voices.get_mut(id).is_some_and(|v| v.trigger(&setup)) {
            self.voices.free(id);
            return None;
        }
        if let Some(n) = note.and_then(|n| self.notes.get_mut(n)) {
            if n.voices.try_push(id).is_err() {
                debug!(channel = c, key, "note voice list full");
                self.voices.kill(id, pos);
            }
        }
        Some(id)
    }

    /// Silence voices switched off by `group`, except those of `note`.
    fn stop_group(&mut self, c: u16, group: u32, note: Option<PoolId>, pos: u32) {
        for i in 0..self.voices.ids().len() {
            let id = self.voices.ids()[i];
            let Some(voice) = self.voices.get(id) else { continue };
            if voice.channel != c || voice.off_by != group || voice.state == VoiceState::FadingOut {
                continue;
            }
            if note.is_some() && voice.note == note {
                continue;
            }
            match voice.off_mode {
                OffMode::Fast => self.voices.kill(id, pos),
                OffMode::Normal => self.voices.release(id, pos),
            }
        }
    }

    fn note_off(&mut self, chan: &mut EngineChannel, c: u16, pos: u32, key: u8, velocity: u8, generated: bool) {
        let k = key as usize;
        chan.state.pressed[k] = false;

        if !generated && Self::has_handler(chan, HandlerKind::Release) {
            let note = self.held_note(c, key);
            let info = CallbackInfo {
                handler: HandlerKind::Release,
                event: note.map_or(0, |n| ScriptId::Note(n).raw()),
                note,
                key,
                velocity,
                cc: 0,
            };
            if self.run_handler(chan, c, pos, info) {
                return;
            }
        }

        let st = &mut chan.state;
        let trig = if st.sustain {
            st.deferred_release[k] = true;
            Trigger::RELEASE_KEY
        } else {
            self.release_key(c, key, pos);
            Trigger::RELEASE_KEY | Trigger::RELEASE
        };
        self.release_triggers(st, c, key, trig, pos);
    }

    /// Newest unreleased key-started note of `key`.
    fn held_note(&self, c: u16, key: u8) -> Option<PoolId> {
        self.notes
            .iter()
            .filter(|(_, n)| n.channel == c && n.host_key == key && !n.released && !n.by_script)
            .max_by_key(|(_, n)| n.trigger_time)
            .map(|(id, _)| id)
    }

    /// Release every key-started note of `key` on channel `c`.
    fn release_key(&mut self, c: u16, key: u8, pos: u32) {
        for i in 0..self.notes.capacity() {
            let Some(id) = self.notes.id_at(i) else { continue };
            if self.notes.get(id).is_some_and(|n| n.channel == c && n.host_key == key && !n.released && !n.by_script) {
                self.release_note(id, pos);
            }
        }
    }

    /// Release a note, its voices and the notes it spawned to live with it.
    pub(crate) fn release_note(&mut self, id: PoolId, pos: u32) {
        let Some(note) = self.notes.get_mut(id) else { return };
        if note.released {
            return;
        }
        note.released = true;
        let voices = note.voices.clone();
        for v in voices {
            if self.voices.get(v).is_some_and(|voice| !voice.one_shot) {
                self.voices.release(v, pos);
            }
        }
        for i in 0..self.notes.capacity() {
            let Some(child) = self.notes.id_at(i) else { continue };
            if self.notes.get(child).is_some_and(|n| n.parent == Some(id)) {
                self.release_note(child, pos);
            }
        }
    }

    /// Fast-kill every voice of a note.
    pub(crate) fn kill_note(&mut self, id: PoolId, pos: u32) {
        let Some(note) = self.notes.get_mut(id) else { return };
        note.released = true;
        note.launched = true;
        let voices = note.voices.clone();
        for v in voices {
            self.voices.kill(v, pos);
        }
    }

    /// Start release-trigger regions of `key`, attenuated by how long the
    /// key was held.
    fn release_triggers(&mut self, st: &mut ChannelState, c: u16, key: u8, trig: Trigger, pos: u32) {
        let Some(inst) = st.instrument.clone() else { return };
        let k = key as usize;
        let velocity = st.key_velocity[k];
        let held = self.now.saturating_sub(st.key_on_time[k]) as f32 / self.config.sample_rate as f32;

        let mut matches = RegionMatches::new();
        {
            let mut q = Query::note(st.last_midi_channel + 1, key, velocity, &st.cc, &st.pressed, trig);
            q.bend = st.pitch_bend;
            q.rand = self.rng.gen();
            q.polyaft = st.key_pressure[k];
            q.last_sw_key = st.last_sw_key;
            q.prev_sw_key = st.prev_sw_key;
            if let Some(matcher) = st.matcher.as_deref() {
                matcher.note_regions(&q, &inst.regions, &mut st.seq_counters, &mut matches);
            }
        }
        for &index in &matches {
            let rt_decay = inst.regions[index as usize].rt_decay;
            let attenuation = libm::expf(-core::f32::consts::LN_10 / 20.0 * rt_decay * held);
            self.start_voice(st, c, &inst, index, None, key, velocity, VoiceKind::ReleaseTrigger, pos, attenuation);
        }
    }

    /// Key release deferred by the sustain pedal.
    fn release_deferred(&mut self, st: &mut ChannelState, c: u16, key: u8, pos: u32) {
        let k = key as usize;
        if st.pressed[k] || !st.deferred_release[k] {
            return;
        }
        st.deferred_release[k] = false;
        self.release_key(c, key, pos);
        self.release_triggers(st, c, key, Trigger::RELEASE, pos);
    }

    // === Controllers ===

    fn control_change(&mut self, chan: &mut EngineChannel, c: u16, id: PoolId, pos: u32, cc: u8, value: u8, generated: bool) {
        let cc = cc.min(127);
        let prev = chan.state.cc[cc as usize];
        chan.state.cc[cc as usize] = value;

        if !generated && Self::has_handler(chan, HandlerKind::Controller) {
            let info = CallbackInfo {
                handler: HandlerKind::Controller,
                event: ScriptId::Event(id).raw(),
                note: None,
                key: 0,
                velocity: 0,
                cc: cc as u16,
            };
            if self.run_handler(chan, c, pos, info) {
                chan.state.cc[cc as usize] = prev;
                return;
            }
        }

        let st = &mut chan.state;
        Self::push_voice_event(st, pos, VoiceEventKind::Controller { cc: cc as u16, value });
        match cc {
            CC_VOLUME => st.midi_volume = self.volume_curve.get(value),
            CC_SUSTAIN => {
                let down = value >= 64;
                if st.sustain && !down {
                    self.pedal_up(st, c, pos);
                }
                st.sustain = down;
            }
            CC_ALL_SOUND_OFF => self.kill_channel(c, pos),
            CC_RESET_CONTROLLERS => {
                if st.sustain {
                    self.pedal_up(st, c, pos);
                }
                st.reset_controllers();
            }
            CC_ALL_NOTES_OFF => self.release_channel(c, pos),
            _ => {}
        }
        if st.trigger_ccs[cc as usize] {
            self.cc_triggers(st, c, cc, pos);
        }
    }

    /// Queue releases for keys the pedal was holding.
    fn pedal_up(&mut self, st: &mut ChannelState, c: u16, pos: u32) {
        for key in 0..128u8 {
            let k = key as usize;
            if !st.deferred_release[k] || st.pressed[k] {
                continue;
            }
            let event = Event::new(EventKind::ReleaseKey { key }).at(pos).on_channel(c).generated();
            if self.enqueue(event, pos).is_none() {
                self.release_deferred(st, c, key, pos);
            }
        }
    }

    /// Start CC-triggered regions whose `on_locc`/`on_hicc` range holds the
    /// new value of controller `cc`. Every value inside the range triggers.
    fn cc_triggers(&mut self, st: &mut ChannelState, c: u16, cc: u8, pos: u32) {
        let Some(inst) = st.instrument.clone() else { return };
        let mut matches = RegionMatches::new();
        {
            let mut q = Query::note(
                st.last_midi_channel + 1,
                CC_TRIGGER_KEY,
                CC_TRIGGER_VELOCITY,
                &st.cc,
                &st.pressed,
                Trigger::ATTACK | Trigger::FIRST,
            );
            q.bend = st.pitch_bend;
            q.rand = self.rng.gen();
            q.last_sw_key = st.last_sw_key;
            q.prev_sw_key = st.prev_sw_key;
            if let Some(matcher) = st.matcher.as_deref() {
                matcher.cc_regions(cc, &q, &inst.regions, &mut st.seq_counters, &mut matches);
            }
        }
        if matches.is_empty() {
            return;
        }
        let Some(id) = self.notes.allocate() else {
            warn!(channel = c, cc, "note pool exhausted");
            return;
        };
        if let Some(note) = self.notes.get_mut(id) {
            *note = Note::new(CC_TRIGGER_KEY, CC_TRIGGER_VELOCITY, c, self.now);
            note.launched = true;
            note.released = true;
        }
        for &index in &matches {
            self.start_voice(
                st,
                c,
                &inst,
                index,
                Some(id),
                CC_TRIGGER_KEY,
                CC_TRIGGER_VELOCITY,
                VoiceKind::ControllerTriggered,
                pos,
                1.0,
            );
        }
    }

    fn kill_channel(&mut self, c: u16, pos: u32) {
        for i in 0..self.voices.ids().len() {
            let id = self.voices.ids()[i];
            if self.voices.get(id).is_some_and(|v| v.channel == c) {
                self.voices.kill(id, pos);
            }
        }
    }

    fn release_channel(&mut self, c: u16, pos: u32) {
        for i in 0..self.notes.capacity() {
            let Some(id) = self.notes.id_at(i) else { continue };
            if self.notes.get(id).is_some_and(|n| n.channel == c) {
                self.release_note(id, pos);
            }
        }
    }

    /// Apply a parameter change to a note and its running voices.
    pub(crate) fn note_param(&mut self, id: PoolId, param: SynthParam, value: f32, relative: bool) {
        let Some(note) = self.notes.get_mut(id) else { return };
        note.overrides.apply(param, value, relative);
        let (overrides, voices) = (note.overrides, note.voices.clone());
        for v in voices {
            if let Some(voice) = self.voices.get_mut(v) {
                voice.apply_note_param(param, &overrides);
            }
        }
    }

    // === System exclusive ===

    /// GM master volume and GS reset. Returns the channels to reset, if any.
    fn sysex(&mut self, data: &SysexData, port: u8, port_listed: bool) -> Option<u8> {
        match data.as_slice() {
            [0xF0, 0x7F, _, 0x04, 0x01, lsb, msb, 0xF7] => {
                let volume = ((*msb as u16) << 7 | *lsb as u16) as f32 / 16383.0;
                match self.config.master_volume_sysex_scope {
                    SysexScope::Global => self.master_volume = volume,
                    SysexScope::PerPort if port_listed => {
                        if let Some(v) = self.port_volume.get_mut(port as usize) {
                            *v = volume;
                        }
                    }
                    SysexScope::PerPort => debug!(port, "master volume from unlisted port"),
                }
                debug!(volume, port, "master volume");
                None
            }
            [0xF0, 0x41, _, 0x42, 0x12, 0x40, 0x00, 0x7F, 0x00, 0x41, 0xF7] => {
                debug!(port, "GS reset");
                Some(port)
            }
            _ => {
                debug!(len = data.len(), "ignoring sysex");
                None
            }
        }
    }

    /// Drop everything scheduled for channel `c`.
    fn forget_channel(&mut self, c: u16) {
        let Core { scheduler, events, .. } = self;
        scheduler.retain(|_, id| {
            let ours = events.get(id).is_some_and(|e| e.channel == Some(c));
            if ours {
                events.free(id);
            }
            !ours
        });
        for i in 0..self.voices.ids().len() {
            let id = self.voices.ids()[i];
            if self.voices.get(id).is_some_and(|v| v.channel == c) {
                if let Some(v) = self.voices.get_mut(id) {
                    v.state = VoiceState::Free;
                }
            }
        }
        let Core { voices, notes, .. } = self;
        voices.reap_finished(|_, _| {});
        for i in 0..notes.capacity() {
            let Some(id) = notes.id_at(i) else { continue };
            if notes.get(id).is_some_and(|n| n.channel == c) {
                notes.free(id);
            }
        }
    }
}

/// A sampler engine: a set of channels rendered into one stereo output.
pub struct Engine {
    core: Core,
    channels: Vec<EngineChannel>,
    #[cfg(feature = "std")]
    ports: Option<Arc<crate::midi_input::MidiPortList>>,
}

impl Engine {
    pub fn new(config: EngineConfig, format: Format) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::Config)?;
        Ok(Self {
            core: Core::new(config, format),
            channels: Vec::new(),
            #[cfg(feature = "std")]
            ports: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn format(&self) -> Format {
        self.core.format
    }

    pub fn sample_rate(&self) -> u32 {
        self.core.config.sample_rate
    }

    /// Engine time in frames.
    pub fn time(&self) -> SchedTime {
        self.core.fragment_start
    }

    pub fn master_volume(&self) -> f32 {
        self.core.master_volume
    }

    pub fn active_voices(&self) -> usize {
        self.core.voices.active_count()
    }

    pub fn active_notes(&self) -> usize {
        self.core.notes.len()
    }

    /// Restart the random source, for reproducible renders.
    pub fn reseed(&mut self, seed: u64) {
        self.core.rng = StdRng::seed_from_u64(seed);
    }

    /// Ports whose sysex master volume applies with per-port scope.
    #[cfg(feature = "std")]
    pub fn set_port_list(&mut self, ports: Arc<crate::midi_input::MidiPortList>) {
        self.ports = Some(ports);
    }

    /// Add a channel with no instrument. Allocates.
    pub fn add_channel(&mut self) -> u16 {
        self.channels.push(EngineChannel::new(self.core.config.max_events));
        (self.channels.len() - 1) as u16
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, c: u16) -> Option<&EngineChannel> {
        self.channels.get(c as usize)
    }

    pub fn channel_mut(&mut self, c: u16) -> Result<&mut EngineChannel, EngineError> {
        self.channels.get_mut(c as usize).ok_or(EngineError::InvalidChannel(c))
    }

    /// Create the lock-free input queue of channel `c` and return its
    /// sending end. Events pushed there are imported at the next fragment.
    pub fn open_input(&mut self, c: u16) -> Result<EventSender, EngineError> {
        Ok(self.channel_mut(c)?.open_input(INPUT_QUEUE_LEN))
    }

    /// Swap the instrument of channel `c`. Its voices, notes and pending
    /// script callbacks are dropped and the init handler runs. Returns the
    /// previous instrument so it is released by the caller.
    pub fn load_instrument(
        &mut self,
        c: u16,
        prepared: PreparedInstrument,
    ) -> Result<Option<Arc<Instrument>>, EngineError> {
        let chan = self.channels.get_mut(c as usize).ok_or(EngineError::InvalidChannel(c))?;
        self.core.forget_channel(c);
        let old = chan.install(prepared);
        tracing::info!(
            channel = c,
            instrument = chan.state.instrument.as_ref().map_or("", |i| i.name.as_str()),
            script = chan.script.is_some(),
            "instrument loaded"
        );
        self.core.now = self.core.fragment_start;
        self.core.fragment_frames = 0;
        let info = CallbackInfo { handler: HandlerKind::Init, ..CallbackInfo::default() };
        self.core.run_handler(chan, c, 0, info);
        Ok(old)
    }

    /// Hand an event to the next fragment. Events without a channel are
    /// routed by MIDI channel. Returns false if the input buffer is full.
    pub fn send(&mut self, event: Event) -> bool {
        if self.core.pending.len() == self.core.pending.capacity() {
            return false;
        }
        self.core.pending.push(event);
        true
    }

    /// Silence everything and forget all notes and scheduled events.
    pub fn reset(&mut self) {
        let core = &mut self.core;
        core.voices.clear();
        core.notes.clear();
        core.scheduler.clear();
        core.queue.clear();
        core.events.clear();
        core.pending.clear();
        for chan in &mut self.channels {
            chan.state.reset_controllers();
            chan.state.pressed = [false; 128];
            if let Some(script) = chan.script.as_mut() {
                script.abort_all();
            }
        }
    }

    /// Render `out_l.len()` frames, in fragments of at most
    /// `max_fragment_frames`.
    pub fn render(&mut self, out_l: &mut [f32], out_r: &mut [f32]) {
        let frames = out_l.len().min(out_r.len());
        let step = self.core.config.max_fragment_frames;
        let mut at = 0;
        while at < frames {
            let n = (frames - at).min(step);
            let (l, r) = (&mut out_l[at..at + n], &mut out_r[at..at + n]);
            #[cfg(feature = "alloc_check")]
            assert_no_alloc::assert_no_alloc(|| self.render_fragment(l, r));
            #[cfg(not(feature = "alloc_check"))]
            self.render_fragment(l, r);
            at += n;
        }
    }

    fn render_fragment(&mut self, out_l: &mut [f32], out_r: &mut [f32]) {
        out_l.fill(0.0);
        out_r.fill(0.0);
        let frames = out_l.len() as u32;
        self.core.fragment_frames = frames;
        self.core.now = self.core.fragment_start;

        self.import_events(frames);
        self.process_events();
        self.render_voices(out_l, out_r);
        self.collect_garbage();

        self.core.queue.clear();
        for chan in &mut self.channels {
            chan.state.voice_events.clear();
        }
        self.core.fragment_start += frames as SchedTime;
    }

    fn import_events(&mut self, frames: u32) {
        let last = frames.saturating_sub(1);
        for i in 0..self.core.pending.len() {
            let event = self.core.pending[i].clone();
            self.route(event, last);
        }
        self.core.pending.clear();

        for (c, chan) in self.channels.iter_mut().enumerate() {
            let Some(rx) = chan.input.as_mut() else { continue };
            while let Some(event) = rx.try_pop() {
                let pos = event.fragment_pos.min(last);
                self.core.enqueue(event.on_channel(c as u16), pos);
            }
        }
    }

    fn route(&mut self, event: Event, last: u32) {
        let pos = event.fragment_pos.min(last);
        if event.channel.is_some() || matches!(event.kind, EventKind::Sysex { .. }) {
            self.core.enqueue(event, pos);
            return;
        }
        let Some(midi_channel) = event.midi_channel() else {
            debug!(kind = ?event.kind, "event without channel dropped");
            return;
        };
        for c in 0..self.channels.len() {
            if self.channels[c].state.listens_to(midi_channel) {
                self.core.enqueue(event.clone().on_channel(c as u16), pos);
            }
        }
    }

    fn process_events(&mut self) {
        loop {
            self.core.pull_due();
            let Some(q) = self.core.queue.next() else { break };
            self.dispatch(q);
        }
    }

    fn dispatch(&mut self, q: QueuedEvent) {
        // Cancelled entries were freed and are skipped.
        let Some(event) = self.core.events.get(q.id).cloned() else { return };
        self.core.events.free(q.id);
        self.core.now = self.core.time_at(q.pos);
        let pos = q.pos;

        if let EventKind::Sysex { data, port } = &event.kind {
            self.process_sysex(data, *port, pos);
            return;
        }
        let Some(c) = event.channel else { return };
        let Some(chan) = self.channels.get_mut(c as usize) else { return };
        let core = &mut self.core;
        let generated = event.generated;
        match event.kind {
            EventKind::NoteOn { key, .. } | EventKind::NoteOff { key, .. } if key > 127 => {
                debug!(key, "key out of range");
            }
            EventKind::NoteOn { key, velocity: 0, .. } => core.note_off(chan, c, pos, key, 64, generated),
            EventKind::NoteOn { key, velocity, midi_channel } => {
                core.note_on(chan, c, pos, key, velocity.min(127), midi_channel, generated)
            }
            EventKind::NoteOff { key, velocity, .. } => core.note_off(chan, c, pos, key, velocity, generated),
            EventKind::ControlChange { controller, value, .. } => {
                core.control_change(chan, c, q.id, pos, controller, value.min(127), generated)
            }
            EventKind::ChannelPressure { value, .. } => {
                chan.state.cc[CTRL_CHANNEL_PRESSURE as usize] = value;
                Core::push_voice_event(
                    &mut chan.state,
                    pos,
                    VoiceEventKind::Controller { cc: CTRL_CHANNEL_PRESSURE, value },
                );
            }
            EventKind::NotePressure { key, value, .. } => {
                if let Some(p) = chan.state.key_pressure.get_mut(key as usize) {
                    *p = value;
                }
            }
            EventKind::PitchBend { value, .. } => {
                let value = value.clamp(-8192, 8191);
                chan.state.pitch_bend = value;
                chan.state.cc[CTRL_PITCH_BEND as usize] = ((value as i32 + 8192) >> 7) as u8;
                Core::push_voice_event(&mut chan.state, pos, VoiceEventKind::PitchBend(value));
            }
            EventKind::Sysex { .. } => {}
            EventKind::PlayNote { note } => {
                if let Some(id) = PoolId::from_raw(note) {
                    core.launch_note(&mut chan.state, c, id, pos);
                }
            }
            EventKind::StopNote { note, .. } => {
                if let Some(id) = PoolId::from_raw(note) {
                    core.release_note(id, pos);
                }
            }
            EventKind::KillNote { note } => {
                if let Some(id) = PoolId::from_raw(note) {
                    core.kill_note(id, pos);
                }
            }
            EventKind::NoteSynthParam { note, param, value, relative } => {
                if let Some(id) = PoolId::from_raw(note) {
                    core.note_param(id, param, value, relative);
                }
            }
            EventKind::ScriptCallback { callback } => core.resume_callback(chan, c, pos, callback),
            EventKind::ReleaseKey { key } => {
                if key <= 127 {
                    core.release_deferred(&mut chan.state, c, key, pos);
                }
            }
        }
    }

    fn process_sysex(&mut self, data: &SysexData, port: u8, pos: u32) {
        #[cfg(feature = "std")]
        let listed = self.ports.as_ref().map_or(true, |p| p.is_connected(port));
        #[cfg(not(feature = "std"))]
        let listed = true;
        let Some(port) = self.core.sysex(data, port, listed) else { return };
        for c in 0..self.channels.len() {
            let chan = &mut self.channels[c];
            if chan.state.port != port {
                continue;
            }
            self.core.kill_channel(c as u16, pos);
            chan.state.reset_controllers();
        }
    }

    fn render_voices(&mut self, out_l: &mut [f32], out_r: &mut [f32]) {
        let Engine { core, channels, .. } = self;
        let Core { voices, scratch, pan_curve, master_volume, port_volume, .. } = core;
        for i in 0..voices.ids().len() {
            let id = voices.ids()[i];
            let Some(voice) = voices.get_mut(id) else { continue };
            let Some(st) = channels.get(voice.channel as usize).map(|c| &c.state) else { continue };
            let Some(inst) = st.instrument.as_deref() else { continue };
            let port_gain = port_volume.get(st.port as usize).copied().unwrap_or(1.0);
            let ctx = RenderContext {
                curves: &inst.curves,
                events: &st.voice_events,
                pan_curve: &*pan_curve,
                midi_volume: st.midi_volume * st.volume * *master_volume * port_gain,
                midi_pan: st.cc[CC_PAN as usize],
            };
            let mut streams = RamStreams::new(&inst.samples);
            voice.render(&mut streams, &ctx, scratch, out_l, out_r);
        }
    }

    #[cfg(test)]
    pub(crate) fn voice_keys(&self) -> Vec<u8> {
        self.core.voices.ids().iter().filter_map(|&id| self.core.voices.get(id)).map(|v| v.key).collect()
    }

    /// Reclaim finished voices, then notes with no voices left that no key
    /// holds and no script callback refers to.
    fn collect_garbage(&mut self) {
        let Core { voices, notes, .. } = &mut self.core;
        voices.reap_finished(|id, voice| {
            if let Some(note) = voice.note.and_then(|n| notes.get_mut(n)) {
                note.voices.retain(|v| *v != id);
            }
        });

        for i in 0..self.core.notes.capacity() {
            let Some(id) = self.core.notes.id_at(i) else { continue };
            let Some(note) = self.core.notes.get(id) else { continue };
            if !note.launched || note.voices.iter().any(|&v| self.core.voices.get(v).is_some()) {
                continue;
            }
            let chan = self.channels.get(note.channel as usize);
            let held = !note.released
                && !note.by_script
                && chan.is_some_and(|c| c.state.pressed[note.host_key as usize & 127]);
            let referenced = chan.and_then(|c| c.script.as_ref()).is_some_and(|s| s.references_note(id));
            if !held && !referenced {
                self.core.notes.free(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kz_ir::{Region, Sample, SampleData};

    fn instrument(regions: Vec<Region>) -> Arc<Instrument> {
        let mut inst = Instrument::new("test");
        let mut sample = Sample::new("tone");
        sample.data = SampleData::MonoF32(vec![0.5; 44100]);
        sample.sample_rate = 44100;
        let key = inst.samples.insert(sample);
        for mut r in regions {
            r.sample = Some(key);
            inst.regions.push(r);
        }
        Arc::new(inst)
    }

    fn engine_with(regions: Vec<Region>) -> Engine {
        let mut engine = Engine::new(EngineConfig::default(), Format::Sfz).unwrap();
        let c = engine.add_channel();
        let prepared = PreparedInstrument::new(instrument(regions), Format::Sfz, engine.config()).unwrap();
        engine.load_instrument(c, prepared).unwrap();
        engine
    }

    fn note_on(key: u8, velocity: u8) -> Event {
        Event::new(EventKind::NoteOn { key, velocity, midi_channel: 0 })
    }

    fn note_off(key: u8) -> Event {
        Event::new(EventKind::NoteOff { key, velocity: 64, midi_channel: 0 })
    }

    fn cc(controller: u8, value: u8) -> Event {
        Event::new(EventKind::ControlChange { controller, value, midi_channel: 0 })
    }

    fn run(engine: &mut Engine, frames: usize) -> f32 {
        let mut l = vec![0.0; frames];
        let mut r = vec![0.0; frames];
        engine.render(&mut l, &mut r);
        l.iter().chain(r.iter()).fold(0.0f32, |m, s| m.max(s.abs()))
    }

    #[test]
    fn note_on_starts_a_voice_and_note_off_ends_it() {
        let mut region = Region::default();
        region.ampeg.release = 0.01;
        let mut engine = engine_with(vec![region]);
        engine.send(note_on(60, 100));
        assert!(run(&mut engine, 512) > 0.0);
        assert_eq!(engine.active_voices(), 1);
        assert_eq!(engine.active_notes(), 1);

        engine.send(note_off(60));
        for _ in 0..10 {
            run(&mut engine, 512);
        }
        assert_eq!(engine.active_voices(), 0);
        assert_eq!(engine.active_notes(), 0);
    }

    #[test]
    fn unmatched_key_plays_nothing() {
        let mut engine = engine_with(vec![Region { lokey: 0, hikey: 10, ..Region::default() }]);
        engine.send(note_on(60, 100));
        assert_eq!(run(&mut engine, 256), 0.0);
        assert_eq!(engine.active_voices(), 0);
    }

    #[test]
    fn sustain_pedal_defers_release() {
        let mut region = Region::default();
        region.ampeg.release = 0.001;
        let mut engine = engine_with(vec![region]);
        engine.send(cc(64, 127));
        engine.send(note_on(60, 100));
        run(&mut engine, 256);
        engine.send(note_off(60));
        for _ in 0..4 {
            run(&mut engine, 512);
        }
        assert_eq!(engine.active_voices(), 1);
        assert!(engine.channel(0).unwrap().state().sustain_pedal());

        engine.send(cc(64, 0));
        for _ in 0..4 {
            run(&mut engine, 512);
        }
        assert_eq!(engine.active_voices(), 0);
    }

    #[test]
    fn release_trigger_fires_on_note_off() {
        let attack = Region::default();
        let release = Region { trigger: Trigger::RELEASE, ..Region::default() };
        let mut engine = engine_with(vec![attack, release]);
        engine.send(note_on(60, 100));
        run(&mut engine, 256);
        assert_eq!(engine.active_voices(), 1);
        engine.send(note_off(60));
        run(&mut engine, 256);
        assert!(engine
            .core
            .voices
            .ids()
            .iter()
            .any(|&id| engine.core.voices.get(id).is_some_and(|v| v.kind == VoiceKind::ReleaseTrigger)));
    }

    #[test]
    fn cc_triggered_region_fires_on_every_value_in_range() {
        let mut region = Region { lokey: -1, hikey: -1, ..Region::default() };
        region.on_locc[20] = 64;
        region.on_hicc[20] = 127;
        let mut engine = engine_with(vec![region]);
        engine.send(cc(20, 10));
        run(&mut engine, 128);
        assert_eq!(engine.active_voices(), 0);
        engine.send(cc(20, 100));
        run(&mut engine, 128);
        assert_eq!(engine.active_voices(), 1);
        // A move within the range starts another note.
        engine.send(cc(20, 110));
        run(&mut engine, 128);
        assert_eq!(engine.active_voices(), 2);
        assert_eq!(engine.active_notes(), 2);
        // Leaving the range starts nothing.
        engine.send(cc(20, 30));
        run(&mut engine, 128);
        assert_eq!(engine.active_voices(), 2);
    }

    #[test]
    fn gm_master_volume_sysex() {
        let mut engine = engine_with(vec![Region::default()]);
        let mut data = SysexData::new();
        data.extend_from_slice(&[0xF0, 0x7F, 0x7F, 0x04, 0x01, 0x00, 0x20, 0xF7]).unwrap();
        engine.send(Event::new(EventKind::Sysex { data, port: 0 }));
        run(&mut engine, 64);
        assert!((engine.master_volume() - (0x20 << 7) as f32 / 16383.0).abs() < 1e-6);
    }

    #[test]
    fn gs_reset_kills_voices_and_controllers() {
        let mut engine = engine_with(vec![Region::default()]);
        engine.send(cc(7, 20));
        engine.send(note_on(60, 100));
        run(&mut engine, 128);
        let mut data = SysexData::new();
        data.extend_from_slice(&[0xF0, 0x41, 0x10, 0x42, 0x12, 0x40, 0x00, 0x7F, 0x00, 0x41, 0xF7]).unwrap();
        engine.send(Event::new(EventKind::Sysex { data, port: 0 }));
        for _ in 0..8 {
            run(&mut engine, 512);
        }
        assert_eq!(engine.active_voices(), 0);
        assert_eq!(engine.channel(0).unwrap().state().controller(7), 100);
    }

    #[test]
    fn voice_pool_exhaustion_is_silent() {
        let config = EngineConfig { max_voices: 2, voice_stealing: false, ..EngineConfig::default() };
        let mut engine = Engine::new(config, Format::Sfz).unwrap();
        let c = engine.add_channel();
        let prepared = PreparedInstrument::new(instrument(vec![Region::default()]), Format::Sfz, engine.config()).unwrap();
        engine.load_instrument(c, prepared).unwrap();
        for key in 60..64 {
            engine.send(note_on(key, 100));
        }
        run(&mut engine, 128);
        assert_eq!(engine.active_voices(), 2);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = EngineConfig { subfragment_frames: 0, ..EngineConfig::default() };
        assert!(matches!(Engine::new(config, Format::Sfz), Err(EngineError::Config(_))));
    }

    #[test]
    fn unknown_channel_is_an_error() {
        let mut engine = Engine::new(EngineConfig::default(), Format::Sfz).unwrap();
        assert!(matches!(engine.open_input(3), Err(EngineError::InvalidChannel(3))));
    }

    #[test]
    fn input_queue_events_are_imported() {
        use ringbuf::traits::Producer;
        let mut engine = engine_with(vec![Region::default()]);
        let mut tx = engine.open_input(0).unwrap();
        assert!(tx.try_push(note_on(60, 100).at(10)).is_ok());
        run(&mut engine, 128);
        assert_eq!(engine.active_voices(), 1);
    }
}
