//! Engine side of the script built-ins.
//!
//! A parameter change on a note created in the current scheduling instant
//! writes the note's overrides, so its voices start with the new value.
//! Later changes travel as `NoteSynthParam` events in event order.

use kz_ir::{Event, EventKind, SynthParam, CTRL_CHANNEL_PRESSURE, CTRL_PITCH_BEND, CTRL_TABLE_SIZE};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::engine::Core;
use crate::engine_channel::ChannelState;
use crate::note::{FadeCurve, Note};
use crate::pool::PoolId;
use crate::scheduler::{frames_to_micros, micros_to_frames};
use crate::script::builtins::{
    Builtin, BuiltinArray, BuiltinVar, EVENT_PAR_0, EVENT_PAR_NOTE, EVENT_PAR_TUNE, EVENT_PAR_VELOCITY,
    EVENT_PAR_VOLUME, EVENT_STATUS_INACTIVE, EVENT_STATUS_NOTE_QUEUE, PARAM_MAX,
};
use crate::script::{CallbackInfo, HandlerKind, Resume, ScriptHost, ScriptId};

/// Scripts running on one channel, bound to the engine for one run.
pub(crate) struct Bridge<'a> {
    core: &'a mut Core,
    state: &'a mut ChannelState,
    channel: u16,
    /// Fragment position of the event being handled.
    pos: u32,
}

fn arg(args: &[i64], i: usize, default: i64) -> i64 {
    args.get(i).copied().unwrap_or(default)
}

fn normalized(value: i64) -> f32 {
    value as f32 / PARAM_MAX as f32
}

fn micros_to_secs(us: i64) -> f32 {
    us.max(0) as f32 / 1_000_000.0
}

impl<'a> Bridge<'a> {
    pub(crate) fn new(core: &'a mut Core, state: &'a mut ChannelState, channel: u16, pos: u32) -> Self {
        Self { core, state, channel, pos }
    }

    /// Live note behind a script ID. A note that already ended is noted at
    /// debug level; anything that is not a note ID warns.
    fn note_arg(&self, f: Builtin, value: i64) -> Option<PoolId> {
        match ScriptId::from_raw(value) {
            Some(ScriptId::Note(id)) if self.core.notes.is_live(id) => Some(id),
            Some(ScriptId::Note(_)) => {
                debug!(function = f.name(), value, "note already ended");
                None
            }
            _ => {
                warn!(function = f.name(), value, "argument is not a note ID");
                None
            }
        }
    }

    fn queue(&mut self, kind: EventKind) -> Option<PoolId> {
        let event = Event::new(kind).at(self.pos).on_channel(self.channel).generated();
        self.core.enqueue(event, self.pos)
    }

    /// Change a note parameter now if the note is new, else in event order.
    fn synth_param(&mut self, note: PoolId, param: SynthParam, value: f32, relative: bool) {
        let now = self.core.now;
        let Some(n) = self.core.notes.get_mut(note) else { return };
        if n.is_new(now) {
            n.overrides.apply(param, value, relative);
        } else {
            self.queue(EventKind::NoteSynthParam { note: note.raw(), param, value, relative });
        }
    }

    fn change(&mut self, f: Builtin, args: &[i64], param: SynthParam, value: f32) -> i64 {
        let Some(note) = self.note_arg(f, args[0]) else { return 0 };
        self.synth_param(note, param, value, arg(args, 2, 0) != 0);
        0
    }

    fn change_curve(&mut self, f: Builtin, args: &[i64], param: SynthParam) -> i64 {
        let Some(note) = self.note_arg(f, args[0]) else { return 0 };
        let Some(curve) = FadeCurve::from_script(args[1]) else {
            warn!(function = f.name(), curve = args[1], "unknown curve");
            return 0;
        };
        let value = match curve {
            FadeCurve::Linear => 0.0,
            FadeCurve::EaseInEaseOut => 1.0,
        };
        self.synth_param(note, param, value, false);
        0
    }

    fn play_note(&mut self, info: &CallbackInfo, args: &[i64]) -> i64 {
        let key = args[0];
        let velocity = arg(args, 1, 127);
        let mut offset = arg(args, 2, -1);
        let mut duration = arg(args, 3, 0);
        if !(0..=127).contains(&key) || !(0..=127).contains(&velocity) {
            warn!(key, velocity, "play_note: note or velocity out of range");
            return 0;
        }
        if offset < -1 {
            warn!(offset, "play_note: sample offset below -1 ignored");
            offset = -1;
        }
        if duration < -1 {
            warn!(duration, "play_note: duration below -1 ignored");
            duration = 0;
        }
        let mut parent = None;
        if duration == -1 {
            if info.handler == HandlerKind::Note {
                parent = info.note.filter(|&n| self.core.notes.is_live(n));
                if parent.is_none() {
                    // Parent is gone already; the new note would never end.
                    return 0;
                }
            } else {
                warn!("play_note: duration -1 is only valid in a note handler");
                duration = 0;
            }
        }

        let Some(id) = self.core.notes.allocate() else {
            warn!(key, "play_note: note pool exhausted");
            return 0;
        };
        let now = self.core.now;
        if let Some(note) = self.core.notes.get_mut(id) {
            *note = Note::new(key as u8, velocity as u8, self.channel, now);
            note.by_script = true;
            note.parent = parent;
            note.overrides.sample_offset = offset;
            note.legato = self.state.any_key_down_except(key as u8);
        }
        if self.queue(EventKind::PlayNote { note: id.raw() }).is_none() {
            self.core.notes.free(id);
            return 0;
        }
        if duration > 0 {
            let event = Event::new(EventKind::StopNote { note: id.raw(), velocity: 127 })
                .on_channel(self.channel)
                .generated();
            self.core.schedule_after(event, duration as u64);
        }
        ScriptId::Note(id).raw() as i64
    }

    fn note_off(&mut self, args: &[i64]) -> i64 {
        let Some(note) = self.note_arg(Builtin::NoteOff, args[0]) else { return 0 };
        let velocity = arg(args, 1, 127).clamp(0, 127) as u8;
        self.queue(EventKind::StopNote { note: note.raw(), velocity });
        0
    }

    fn ignore(&mut self, f: Builtin, info: &CallbackInfo, args: &[i64]) -> i64 {
        let Some(&target) = args.first() else {
            self.state.ignore_current = true;
            return 0;
        };
        if target == info.event as i64 {
            self.state.ignore_current = true;
            return 0;
        }
        match ScriptId::from_raw(target) {
            Some(ScriptId::Note(id)) => match self.core.notes.get_mut(id) {
                Some(note) if !note.launched => {
                    note.launched = true;
                    note.released = true;
                }
                Some(_) => {}
                None => warn!(function = f.name(), target, "unknown note ID"),
            },
            Some(ScriptId::Event(id)) => {
                if self.core.events.is_live(id) {
                    self.core.cancel(id);
                }
            }
            None => warn!(function = f.name(), target, "invalid ID"),
        }
        0
    }

    fn set_controller(&mut self, args: &[i64]) -> i64 {
        let (cc, value) = (args[0], args[1]);
        let midi_channel = self.state.last_midi_channel;
        let kind = match cc {
            0..=127 if (0..=127).contains(&value) => {
                EventKind::ControlChange { controller: cc as u8, value: value as u8, midi_channel }
            }
            c if c == CTRL_CHANNEL_PRESSURE as i64 && (0..=127).contains(&value) => {
                EventKind::ChannelPressure { value: value as u8, midi_channel }
            }
            c if c == CTRL_PITCH_BEND as i64 && (-8192..=8191).contains(&value) => {
                EventKind::PitchBend { value: value as i16, midi_channel }
            }
            _ => {
                warn!(cc, value, "set_controller: controller or value out of range");
                return 0;
            }
        };
        self.queue(kind).map_or(0, |id| ScriptId::Event(id).raw() as i64)
    }

    fn fade(&mut self, f: Builtin, args: &[i64]) -> i64 {
        let Some(id) = self.note_arg(f, args[0]) else { return 0 };
        let time = micros_to_secs(args[1]);
        let stop = arg(args, 2, 1) != 0;
        let Some(note) = self.core.notes.get_mut(id) else { return 0 };
        if !note.launched {
            match f {
                Builtin::FadeIn => note.fade_in = Some(time),
                _ => note.fade_out = Some((time, stop)),
            }
            return 0;
        }
        let voices = note.voices.clone();
        for v in voices {
            if let Some(voice) = self.core.voices.get_mut(v) {
                match f {
                    Builtin::FadeIn => voice.fade_in(time),
                    _ => voice.fade_out(time, stop),
                }
            }
        }
        0
    }

    fn get_event_par(&mut self, args: &[i64]) -> i64 {
        let Some(id) = self.note_arg(Builtin::GetEventPar, args[0]) else { return 0 };
        let Some(note) = self.core.notes.get(id) else { return 0 };
        match args[1] {
            EVENT_PAR_NOTE => note.key as i64,
            EVENT_PAR_VELOCITY => note.velocity as i64,
            EVENT_PAR_VOLUME => (20.0 * libm::log10f(note.overrides.volume.max(1e-9)) * 1000.0) as i64,
            EVENT_PAR_TUNE => (1200.0 * libm::log2f(note.overrides.pitch.max(1e-9)) * 1000.0) as i64,
            p @ EVENT_PAR_0..=1027 => note.user_par[(p - EVENT_PAR_0) as usize],
            p => {
                warn!(par = p, "get_event_par: unknown parameter");
                0
            }
        }
    }

    fn set_event_par(&mut self, args: &[i64]) -> i64 {
        let Some(id) = self.note_arg(Builtin::SetEventPar, args[0]) else { return 0 };
        let now = self.core.now;
        let Some(note) = self.core.notes.get_mut(id) else { return 0 };
        let (par, value) = (args[1], args[2]);
        match par {
            EVENT_PAR_NOTE | EVENT_PAR_VELOCITY if !note.is_new(now) => {
                warn!(par, "set_event_par: note already started");
            }
            EVENT_PAR_NOTE | EVENT_PAR_VELOCITY if !(0..=127).contains(&value) => {
                warn!(par, value, "set_event_par: value out of range");
            }
            EVENT_PAR_NOTE => note.key = value as u8,
            EVENT_PAR_VELOCITY => note.velocity = value as u8,
            EVENT_PAR_VOLUME | EVENT_PAR_TUNE => warn!(par, "set_event_par: parameter is read-only"),
            p @ EVENT_PAR_0..=1027 => note.user_par[(p - EVENT_PAR_0) as usize] = value,
            p => warn!(par = p, "set_event_par: unknown parameter"),
        }
        0
    }

    /// `change_note`, `change_velo` and `change_play_pos`: only before the
    /// note's voices start.
    fn retarget(&mut self, f: Builtin, args: &[i64]) -> i64 {
        let Some(id) = self.note_arg(f, args[0]) else { return 0 };
        let now = self.core.now;
        let Some(note) = self.core.notes.get_mut(id) else { return 0 };
        if !note.is_new(now) {
            warn!(function = f.name(), "note already started");
            return 0;
        }
        let value = args[1];
        match f {
            Builtin::ChangeNote | Builtin::ChangeVelo if !(0..=127).contains(&value) => {
                warn!(function = f.name(), value, "value out of range");
            }
            Builtin::ChangeNote => note.key = value as u8,
            Builtin::ChangeVelo => note.velocity = value as u8,
            _ => note.overrides.sample_offset = value.max(0),
        }
        0
    }

    fn event_status(&self, args: &[i64]) -> i64 {
        let live = match ScriptId::from_raw(args[0]) {
            Some(ScriptId::Note(id)) => self.core.notes.is_live(id),
            Some(ScriptId::Event(id)) => self.core.events.is_live(id),
            None => false,
        };
        if live {
            EVENT_STATUS_NOTE_QUEUE
        } else {
            EVENT_STATUS_INACTIVE
        }
    }

    fn current_note<'n>(&'n self, info: &CallbackInfo) -> Option<&'n Note> {
        info.note.and_then(|id| self.core.notes.get(id))
    }
}

impl ScriptHost for Bridge<'_> {
    fn call(&mut self, info: &CallbackInfo, f: Builtin, args: &[i64]) -> i64 {
        use Builtin::*;
        match f {
            PlayNote => self.play_note(info, args),
            NoteOff => self.note_off(args),
            IgnoreEvent | IgnoreController => self.ignore(f, info, args),
            SetController => self.set_controller(args),
            ChangeVol => {
                let ratio = libm::powf(10.0, args[1] as f32 / 1000.0 / 20.0);
                self.change(f, args, SynthParam::Volume, ratio)
            }
            ChangeTune => {
                let ratio = libm::powf(2.0, args[1] as f32 / 1000.0 / 1200.0);
                self.change(f, args, SynthParam::Pitch, ratio)
            }
            ChangePan => {
                let pan = (args[1] as f32 / 1000.0).clamp(-1.0, 1.0);
                self.change(f, args, SynthParam::Pan, pan)
            }
            ChangeCutoff => self.change(f, args, SynthParam::Cutoff, normalized(args[1])),
            ChangeReso => self.change(f, args, SynthParam::Resonance, normalized(args[1])),
            ChangeAttack => self.change(f, args, SynthParam::Attack, normalized(args[1])),
            ChangeDecay => self.change(f, args, SynthParam::Decay, normalized(args[1])),
            ChangeSustain => self.change(f, args, SynthParam::Sustain, normalized(args[1])),
            ChangeRelease => self.change(f, args, SynthParam::Release, normalized(args[1])),
            ChangeAmpLfoDepth => self.change(f, args, SynthParam::AmpLfoDepth, normalized(args[1])),
            ChangeAmpLfoFreq => self.change(f, args, SynthParam::AmpLfoFreq, normalized(args[1])),
            ChangePitchLfoDepth => self.change(f, args, SynthParam::PitchLfoDepth, normalized(args[1])),
            ChangePitchLfoFreq => self.change(f, args, SynthParam::PitchLfoFreq, normalized(args[1])),
            ChangeCutoffLfoDepth => self.change(f, args, SynthParam::CutoffLfoDepth, normalized(args[1])),
            ChangeCutoffLfoFreq => self.change(f, args, SynthParam::CutoffLfoFreq, normalized(args[1])),
            ChangeVolTime => self.change(f, args, SynthParam::VolumeTime, micros_to_secs(args[1])),
            ChangeTuneTime => self.change(f, args, SynthParam::PitchTime, micros_to_secs(args[1])),
            ChangePanTime => self.change(f, args, SynthParam::PanTime, micros_to_secs(args[1])),
            ChangeVolCurve => self.change_curve(f, args, SynthParam::VolumeCurve),
            ChangeTuneCurve => self.change_curve(f, args, SynthParam::PitchCurve),
            ChangePanCurve => self.change_curve(f, args, SynthParam::PanCurve),
            FadeIn | FadeOut => self.fade(f, args),
            GetEventPar => self.get_event_par(args),
            SetEventPar => self.set_event_par(args),
            ChangeNote | ChangeVelo | ChangePlayPos => self.retarget(f, args),
            EventStatus => self.event_status(args),
            Wait | StopWait | Abort | Fork | Exit | CallbackStatus | Abs | Min | Max | Random | Message | Inc
            | Dec => 0,
        }
    }

    fn variable(&mut self, info: &CallbackInfo, var: BuiltinVar) -> i64 {
        match var {
            BuiltinVar::EventId => info.event as i64,
            BuiltinVar::EventNote => self.current_note(info).map_or(info.key, |n| n.key) as i64,
            BuiltinVar::EventVelocity => self.current_note(info).map_or(info.velocity, |n| n.velocity) as i64,
            BuiltinVar::CcNum => info.cc as i64,
            BuiltinVar::EngineUptime => {
                (frames_to_micros(self.core.now, self.core.config.sample_rate) / 1000) as i64
            }
            // Answered by the runtime itself.
            BuiltinVar::CallbackId => 0,
        }
    }

    fn array(&mut self, array: BuiltinArray, index: i64) -> i64 {
        let Ok(i) = usize::try_from(index) else { return 0 };
        match array {
            BuiltinArray::Cc if i < CTRL_TABLE_SIZE => self.state.cc[i] as i64,
            BuiltinArray::KeyDown if i < 128 => self.state.pressed[i] as i64,
            _ => 0,
        }
    }

    fn poly_vars(&mut self, note: PoolId) -> Option<&mut [i64]> {
        self.core.notes.get_mut(note).map(|n| &mut n.poly_vars[..])
    }

    fn random(&mut self, lo: i64, hi: i64) -> i64 {
        if lo > hi {
            return lo;
        }
        self.core.rng.gen_range(lo..=hi)
    }

    fn message(&mut self, text: &str) {
        info!(channel = self.channel, "{text}");
    }

    fn schedule_resume(&mut self, callback: PoolId, when: Resume) -> Option<u32> {
        let event = Event::new(EventKind::ScriptCallback { callback: callback.raw() })
            .on_channel(self.channel)
            .generated();
        let id = match when {
            Resume::After(us) => {
                let time = self.core.now + micros_to_frames(us, self.core.config.sample_rate);
                self.core.schedule(event, time)?
            }
            Resume::NextFragment => {
                let time = self.core.time_at(self.core.fragment_frames);
                self.core.schedule(event, time)?
            }
        };
        Some(id.raw())
    }

    fn cancel_resume(&mut self, token: u32) {
        if let Some(id) = PoolId::from_raw(token) {
            self.core.cancel(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::engine_channel::PreparedInstrument;
    use crate::format::Format;
    use alloc::sync::Arc;
    use kz_ir::{Instrument, Region, Sample, SampleData};

    fn engine(script: &str) -> Engine {
        let mut inst = Instrument::new("scripted");
        let mut sample = Sample::new("tone");
        sample.data = SampleData::MonoF32(vec![0.25; 48000]);
        let key = inst.samples.insert(sample);
        inst.regions.push(Region { sample: Some(key), ..Region::default() });
        inst.script = Some(script.into());
        let mut engine = Engine::new(EngineConfig::default(), Format::Sfz).unwrap();
        let c = engine.add_channel();
        let prepared = PreparedInstrument::new(Arc::new(inst), Format::Sfz, engine.config()).unwrap();
        engine.load_instrument(c, prepared).unwrap();
        engine
    }

    fn play(engine: &mut Engine, key: u8) {
        engine.send(Event::new(EventKind::NoteOn { key, velocity: 100, midi_channel: 0 }));
    }

    fn run(engine: &mut Engine, frames: usize) {
        let mut l = vec![0.0; frames];
        let mut r = vec![0.0; frames];
        engine.render(&mut l, &mut r);
    }

    #[test]
    fn play_note_adds_a_layer() {
        let mut engine = engine("on note\n  play_note($EVENT_NOTE + 12, 100)\nend on\n");
        play(&mut engine, 60);
        run(&mut engine, 256);
        assert_eq!(engine.active_voices(), 2);
        assert_eq!(engine.active_notes(), 2);
    }

    #[test]
    fn ignore_event_suppresses_the_note() {
        let mut engine = engine("on note\n  ignore_event()\nend on\n");
        play(&mut engine, 60);
        run(&mut engine, 256);
        assert_eq!(engine.active_voices(), 0);
    }

    #[test]
    fn change_note_retargets_before_launch() {
        let mut engine = engine("on note\n  change_note($EVENT_ID, 72)\nend on\n");
        play(&mut engine, 60);
        run(&mut engine, 64);
        assert_eq!(engine.voice_keys(), vec![72]);
    }

    #[test]
    fn timed_play_note_stops_itself() {
        let mut engine = engine("on note\n  ignore_event()\n  play_note(64, 100, -1, 10000)\nend on\n");
        play(&mut engine, 60);
        run(&mut engine, 256);
        assert_eq!(engine.active_voices(), 1);
        for _ in 0..40 {
            run(&mut engine, 512);
        }
        assert_eq!(engine.active_voices(), 0);
    }

    #[test]
    fn wait_resumes_in_a_later_fragment() {
        let mut engine = engine("on note\n  ignore_event()\n  wait(20000)\n  play_note(64)\nend on\n");
        play(&mut engine, 60);
        run(&mut engine, 256);
        assert_eq!(engine.active_voices(), 0);
        for _ in 0..4 {
            run(&mut engine, 512);
        }
        assert_eq!(engine.active_voices(), 1);
    }

    #[test]
    fn ignore_controller_keeps_old_value() {
        let mut engine = engine("on controller\n  if ($CC_NUM = 1)\n    ignore_controller()\n  end if\nend on\n");
        engine.send(Event::new(EventKind::ControlChange { controller: 1, value: 99, midi_channel: 0 }));
        engine.send(Event::new(EventKind::ControlChange { controller: 2, value: 99, midi_channel: 0 }));
        run(&mut engine, 64);
        let st = engine.channel(0).unwrap().state();
        assert_eq!((st.controller(1), st.controller(2)), (0, 99));
    }

    #[test]
    fn ended_note_id_is_a_noop() {
        let mut engine = engine(
            "on init\n  declare $id\nend on\n\
             on note\n  $id := play_note(64, 100, 0, 1000)\n  wait(200000)\n  note_off($id)\n  change_vol($id, -6000)\nend on\n",
        );
        play(&mut engine, 60);
        run(&mut engine, 64);
        assert_eq!(engine.active_voices(), 2);
        for _ in 0..40 {
            run(&mut engine, 512);
        }
        // The layered note ended on its own; the key's own note is untouched.
        assert_eq!(engine.voice_keys(), vec![60]);
    }

    #[test]
    fn bad_note_id_is_a_noop() {
        let mut engine = engine("on note\n  change_vol(12345, -6000)\n  note_off(1)\nend on\n");
        play(&mut engine, 60);
        run(&mut engine, 64);
        assert_eq!(engine.active_voices(), 1);
    }
}
