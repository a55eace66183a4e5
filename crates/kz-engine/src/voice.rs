//! Voice: one sample-playback unit bound to a region and a note.
//!
//! A voice renders in sub-blocks. Once per sub-block its unit rack advances
//! one step and yields volume, pitch, pan, cutoff and resonance; within the
//! sub-block samples are resampled with linear interpolation, filtered and
//! mixed with a gain ramp towards the new values.

use kz_ir::{
    Curve, LoopMode, OffMode, Region, Sample, SampleKey, SynthParam, CTRL_PITCH_BEND, CTRL_TABLE_SIZE,
};

use crate::filter::VoiceFilter;
use crate::note::{NoteFade, NoteOverrides};
use crate::pool::PoolId;
use crate::stream::DiskStreams;
use crate::tables::PanCurve;
use crate::units::{cc_influence, cents_to_ratio, db_to_ratio, Rack, TriggerContext};

/// Playback speed is capped at `2^MAX_PITCH` times the original.
pub const MAX_PITCH: u32 = 4;
const MAX_SPEED: f64 = (1 << MAX_PITCH) as f64;

/// Largest sub-block a voice renders at once.
pub const MAX_SUBFRAGMENT: usize = 64;

/// Source frames read per window: one sub-block at full speed plus the
/// interpolation neighbour.
const WINDOW: usize = MAX_SUBFRAGMENT * (1 << MAX_PITCH) + 2;

/// Voice lifecycle state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VoiceState {
    /// Slot taken, not triggered yet.
    Allocated,
    /// Triggered; waiting for its first sub-block.
    Triggered,
    /// Playing before its release.
    Sustaining,
    /// Release stage entered.
    Releasing,
    /// Being silenced within the fast-kill bound.
    FadingOut,
    /// Finished; the slot can be reclaimed.
    #[default]
    Free,
}

/// Why a voice was started.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VoiceKind {
    #[default]
    Normal,
    /// Started by a note-off.
    ReleaseTrigger,
    /// Started by a controller value inside an `on_locc`/`on_hicc` range.
    ControllerTriggered,
}

/// Controller-side changes a voice follows while it renders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoiceEventKind {
    Controller { cc: u16, value: u8 },
    /// Pitch wheel, -8192..=8191.
    PitchBend(i16),
}

/// A channel event at a frame offset within the fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VoiceEvent {
    pub pos: u32,
    pub kind: VoiceEventKind,
}

/// Engine timing constants every voice needs.
#[derive(Clone, Copy, Debug)]
pub struct VoiceTiming {
    pub sample_rate: f32,
    /// Frames per sub-block.
    pub sub_frames: usize,
    /// Fade-out from full level, in seconds.
    pub fade_time: f32,
    pub min_release: f32,
    pub eg_bottom: f32,
    /// Longest fast-kill, in sub-blocks.
    pub kill_steps: i32,
}

impl VoiceTiming {
    pub fn sub_rate(&self) -> f32 {
        self.sample_rate / self.sub_frames as f32
    }
}

/// Everything a voice reads once, when it starts.
pub struct VoiceSetup<'a> {
    pub region: &'a Region,
    pub region_index: u32,
    pub sample_key: SampleKey,
    pub sample: &'a Sample,
    pub curves: &'a [Curve],
    pub cc: &'a [u8; CTRL_TABLE_SIZE],
    pub key: u8,
    pub velocity: u8,
    pub bend: i16,
    pub note: Option<PoolId>,
    pub channel: u16,
    pub kind: VoiceKind,
    /// Frame offset of the trigger within the current fragment.
    pub fragment_pos: u32,
    pub overrides: &'a NoteOverrides,
    /// Release trigger attenuation; 1.0 for other voices.
    pub attenuation: f32,
    /// Uniform random numbers in 0..1: units, amplitude, pitch, offset.
    pub random: [f32; 4],
    pub timing: &'a VoiceTiming,
}

/// What a voice reads every fragment.
pub struct RenderContext<'a> {
    pub curves: &'a [Curve],
    /// Channel events of this fragment, ordered by position.
    pub events: &'a [VoiceEvent],
    pub pan_curve: &'a PanCurve,
    /// Channel volume gain (CC 7).
    pub midi_volume: f32,
    /// Channel pan 0..=127 (CC 10).
    pub midi_pan: u8,
}

/// Working buffers shared by all voices of an engine.
pub struct VoiceScratch {
    src_l: [f32; WINDOW],
    src_r: [f32; WINDOW],
    out_l: [f32; MAX_SUBFRAGMENT],
    out_r: [f32; MAX_SUBFRAGMENT],
}

impl Default for VoiceScratch {
    fn default() -> Self {
        Self {
            src_l: [0.0; WINDOW],
            src_r: [0.0; WINDOW],
            out_l: [0.0; MAX_SUBFRAGMENT],
            out_r: [0.0; MAX_SUBFRAGMENT],
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct SampleLoop {
    start: u32,
    /// One past the last looped frame.
    end: u32,
    /// Remaining wraps; `None` loops forever.
    cycles_left: Option<u32>,
}

/// A single voice producing audio from a region's sample.
#[derive(Clone, Debug, Default)]
pub struct Voice {
    /// Voice lifecycle state.
    pub state: VoiceState,
    pub kind: VoiceKind,
    /// Owning note.
    pub note: Option<PoolId>,
    /// Engine channel the voice belongs to.
    pub channel: u16,
    /// Index of the region in the instrument.
    pub region: u32,
    pub key: u8,
    pub velocity: u8,
    pub group: u32,
    pub off_by: u32,
    pub off_mode: OffMode,
    /// Ignores note-off.
    pub one_shot: bool,

    rack: Rack,
    filter: VoiceFilter,
    filter_on: bool,
    cutoff_base: f32,
    resonance_base: f32,
    nyquist_cap: f32,

    sample: Option<SampleKey>,
    /// Position in source frames.
    pos: f64,
    /// Source rate over engine rate.
    rate_ratio: f32,
    /// Trigger-time pitch in cents.
    pitch_cents: f32,
    bend_cents: f32,
    bend_up: f32,
    bend_down: f32,
    sample_end: u32,
    sample_loop: Option<SampleLoop>,
    sustain_loop: bool,
    released: bool,

    /// Static linear gain from the region.
    gain: f32,
    pan: f32,
    width: f32,
    vol_fade: NoteFade,
    pitch_fade: NoteFade,
    pan_fade: NoteFade,
    note_cutoff: f32,
    note_resonance: f32,
    last_gain: Option<(f32, f32)>,
    stop_on_silence: bool,

    /// Frames to skip at the start of the first fragment.
    start_delay: u32,
    pending_release: Option<u32>,
    pending_kill: Option<u32>,
    timing: Option<VoiceTiming>,
}

/// Velocity attenuation with the default quadratic velocity curve.
fn velocity_attenuation(amp_veltrack: f32, velocity: u8) -> f32 {
    let curve = (velocity as f32 * velocity as f32) / (127.0 * 127.0);
    let mut offset = -amp_veltrack;
    if offset <= 0.0 {
        offset += 100.0;
    }
    (offset + amp_veltrack * curve) / 100.0
}

/// Pitch wheel deflection in cents.
fn bend_cents(bend: i16, up: f32, down: f32) -> f32 {
    if bend >= 0 {
        bend as f32 / 8191.0 * up
    } else {
        bend as f32 / 8192.0 * -down
    }
}

impl Voice {
    /// Start the voice. Returns false if it would be silent from the start.
    pub fn trigger(&mut self, s: &VoiceSetup<'_>) -> bool {
        let r = s.region;
        let t = s.timing;
        *self = Voice { rack: core::mem::take(&mut self.rack), ..Voice::default() };
        self.state = VoiceState::Triggered;
        self.kind = s.kind;
        self.note = s.note;
        self.channel = s.channel;
        self.region = s.region_index;
        self.key = s.key;
        self.velocity = s.velocity;
        self.group = r.group;
        self.off_by = r.off_by;
        self.off_mode = r.off_mode;
        self.one_shot = r.loop_mode == LoopMode::OneShot;
        self.timing = Some(*t);

        let [rand_units, rand_amp, rand_pitch, rand_offset] = s.random;
        let key = s.key as f32;

        self.gain = db_to_ratio(r.volume)
            * r.amplitude / 100.0
            * velocity_attenuation(r.amp_veltrack, s.velocity)
            * db_to_ratio(r.amp_keytrack * (key - r.amp_keycenter as f32))
            * db_to_ratio(r.amp_random * rand_amp)
            * s.attenuation;
        if self.gain <= 0.0 {
            self.state = VoiceState::Free;
            return false;
        }

        let ctx = TriggerContext {
            region: r,
            curves: s.curves,
            cc: s.cc,
            key: s.key,
            velocity: s.velocity,
            sample_rate: t.sample_rate,
            sub_rate: t.sub_rate(),
            fade_time: t.fade_time,
            min_release: t.min_release,
            eg_bottom: t.eg_bottom,
            random: rand_units,
            overrides: s.overrides.units,
        };
        self.rack.trigger(&ctx);

        let keycenter = if r.pitch_keycenter < 0 { key } else { r.pitch_keycenter as f32 };
        self.pitch_cents = (r.transpose * 100 + r.tune) as f32
            + (key - keycenter) * r.pitch_keytrack as f32
            + (2.0 * rand_pitch - 1.0) * r.pitch_random as f32;
        self.bend_up = r.bend_up as f32;
        self.bend_down = r.bend_down as f32;
        self.bend_cents = bend_cents(s.bend, self.bend_up, self.bend_down);
        self.rate_ratio = s.sample.sample_rate as f32 / t.sample_rate;

        self.filter_on = r.cutoff.is_some();
        if let Some(cutoff) = r.cutoff {
            let cents = s.velocity as f32 / 127.0 * r.fil_veltrack as f32
                + (key - r.fil_keycenter as f32) * r.fil_keytrack as f32
                + rand_units * r.fil_random as f32;
            self.cutoff_base = cutoff * cents_to_ratio(cents);
            self.resonance_base = r.resonance;
            self.nyquist_cap = 0.49 * t.sample_rate;
            self.filter.reset(r.fil_type, t.sample_rate);
        }

        let len = s.sample.len() as u32;
        self.sample = Some(s.sample_key);
        self.sample_end = if r.end > 0 { (r.end + 1).min(len) } else { len };
        let start = if s.overrides.sample_offset >= 0 {
            (s.overrides.sample_offset as f64 * s.sample.sample_rate as f64 / 1e6) as u32
        } else {
            let base = r.offset as f32
                + rand_offset * r.offset_random as f32
                + cc_influence(&r.offset_oncc, s.cc);
            base.max(0.0) as u32
        };
        self.pos = start.min(self.sample_end) as f64;
        if r.has_loop(s.sample) {
            let end = (r.loop_end(s.sample) + 1).min(self.sample_end);
            let start = r.loop_start(s.sample);
            if end > start {
                let count = r.loop_count();
                self.sample_loop = Some(SampleLoop {
                    start,
                    end,
                    cycles_left: (count > 0).then_some(count),
                });
            }
        }
        self.sustain_loop = r.loop_mode == LoopMode::Sustain;

        self.pan = r.pan + r.position;
        self.width = r.width / 100.0;
        let o = s.overrides;
        self.vol_fade = NoteFade::new(o.volume, o.volume_time, o.volume_curve);
        self.pitch_fade = NoteFade::new(o.pitch, o.pitch_time, o.pitch_curve);
        self.pan_fade = NoteFade::new(o.pan, o.pan_time, o.pan_curve);
        self.note_cutoff = o.cutoff;
        self.note_resonance = o.resonance;

        self.start_delay = s.fragment_pos;
        true
    }

    /// True while the voice occupies its slot.
    pub fn is_active(&self) -> bool {
        self.state != VoiceState::Free
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Current position in source frames.
    pub fn position(&self) -> f64 {
        self.pos
    }

    pub fn rack(&self) -> &Rack {
        &self.rack
    }

    /// Enter the release stage at frame `pos` of the current fragment.
    pub fn release(&mut self, pos: u32) {
        if self.released || self.state == VoiceState::FadingOut {
            return;
        }
        self.pending_release = Some(self.pending_release.map_or(pos, |p| p.min(pos)));
    }

    /// Fade out within the fast-kill bound from frame `pos` on.
    pub fn kill(&mut self, pos: u32) {
        self.pending_kill = Some(self.pending_kill.map_or(pos, |p| p.min(pos)));
    }

    /// Fade out within `steps` sub-blocks, starting now.
    pub fn fade_out_within(&mut self, steps: i32) {
        self.rack.enter_fade_out_within(steps.max(1));
        self.state = VoiceState::FadingOut;
    }

    /// Follow a changed override of the owning note.
    pub fn apply_note_param(&mut self, param: SynthParam, o: &NoteOverrides) {
        let Some(timing) = self.timing else {
            return;
        };
        let rate = timing.sub_rate();
        match param {
            SynthParam::Volume => self.vol_fade.fade_to(o.volume, o.volume_time, rate),
            SynthParam::VolumeTime => self.vol_fade.default_time = o.volume_time,
            SynthParam::VolumeCurve => self.vol_fade.set_curve(o.volume_curve),
            SynthParam::Pitch => self.pitch_fade.fade_to(o.pitch, o.pitch_time, rate),
            SynthParam::PitchTime => self.pitch_fade.default_time = o.pitch_time,
            SynthParam::PitchCurve => self.pitch_fade.set_curve(o.pitch_curve),
            SynthParam::Pan => self.pan_fade.fade_to(o.pan, o.pan_time, rate),
            SynthParam::PanTime => self.pan_fade.default_time = o.pan_time,
            SynthParam::PanCurve => self.pan_fade.set_curve(o.pan_curve),
            SynthParam::Cutoff => self.note_cutoff = o.cutoff,
            SynthParam::Resonance => self.note_resonance = o.resonance,
            _ => self.rack.set_overrides(o.units),
        }
    }

    /// Fade the note volume from silence to its override value.
    pub fn fade_in(&mut self, time: f32) {
        let Some(timing) = self.timing else {
            return;
        };
        let target = self.vol_fade.target();
        self.vol_fade.set(0.0);
        self.vol_fade.fade_to(target, time, timing.sub_rate());
    }

    /// Fade the note volume to silence over `time` seconds; with `stop` the
    /// voice ends once silent.
    pub fn fade_out(&mut self, time: f32, stop: bool) {
        if let Some(timing) = self.timing {
            self.vol_fade.fade_to(0.0, time, timing.sub_rate());
            self.stop_on_silence |= stop;
        }
    }

    /// True once a volume fade reached silence.
    pub fn faded_to_silence(&self) -> bool {
        self.vol_fade.target() == 0.0 && !self.vol_fade.is_fading()
    }

    fn process_event(&mut self, kind: VoiceEventKind, curves: &[Curve]) {
        match kind {
            VoiceEventKind::Controller { cc, value } => self.rack.process_cc(cc, value, curves),
            VoiceEventKind::PitchBend(value) => {
                self.bend_cents = bend_cents(value, self.bend_up, self.bend_down);
                let scaled = ((value as i32 + 8192) * 127 / 16383).clamp(0, 127) as u8;
                self.rack.process_cc(CTRL_PITCH_BEND, scaled, curves);
            }
        }
    }

    /// Apply channel events and pending release/kill before frame `end`.
    fn apply_until(&mut self, ctx: &RenderContext<'_>, cursor: &mut usize, end: u32) {
        while let Some(ev) = ctx.events.get(*cursor) {
            if ev.pos >= end {
                break;
            }
            self.process_event(ev.kind, ctx.curves);
            *cursor += 1;
        }
        if self.pending_release.is_some_and(|p| p < end) {
            self.pending_release = None;
            self.released = true;
            self.rack.enter_release();
            if self.state != VoiceState::FadingOut {
                self.state = VoiceState::Releasing;
            }
        }
        if self.pending_kill.is_some_and(|p| p < end) {
            self.pending_kill = None;
            let steps = self.timing.map_or(1, |t| t.kill_steps);
            self.fade_out_within(steps);
        }
    }

    /// Render one fragment, adding into `out_l`/`out_r`.
    pub fn render(
        &mut self,
        streams: &mut dyn DiskStreams,
        ctx: &RenderContext<'_>,
        scratch: &mut VoiceScratch,
        out_l: &mut [f32],
        out_r: &mut [f32],
    ) {
        let Some(timing) = self.timing else {
            self.state = VoiceState::Free;
            return;
        };
        if !self.is_active() {
            return;
        }
        let frames = out_l.len().min(out_r.len());
        let sub = timing.sub_frames.clamp(1, MAX_SUBFRAGMENT);

        let mut pos = (core::mem::take(&mut self.start_delay) as usize).min(frames);
        // Events before the trigger are already part of the trigger state.
        let mut cursor = ctx.events.partition_point(|e| (e.pos as usize) < pos);

        while pos < frames {
            if self.rack.endpoint_mut().delayed() {
                let skipped = self.rack.endpoint_mut().consume_delay((frames - pos) as u32);
                pos += skipped as usize;
                self.apply_until(ctx, &mut cursor, pos as u32);
                if !self.rack.active() {
                    self.state = VoiceState::Free;
                    return;
                }
                continue;
            }

            let end = (pos + sub).min(frames);
            self.apply_until(ctx, &mut cursor, end as u32);
            self.rack.increment(ctx.curves);
            if !self.rack.active() {
                self.state = VoiceState::Free;
                return;
            }
            if self.state == VoiceState::Triggered {
                self.state = VoiceState::Sustaining;
            }

            let n = end - pos;
            let speed = (cents_to_ratio(self.pitch_cents + self.bend_cents)
                * self.rack.pitch()
                * self.pitch_fade.render()
                * self.rate_ratio) as f64;
            let rendered = self.fill(streams, scratch, n, speed.clamp(0.0, MAX_SPEED));
            let (buf_l, buf_r) = (&mut scratch.out_l[..n], &mut scratch.out_r[..n]);
            buf_l[rendered..].fill(0.0);
            buf_r[rendered..].fill(0.0);

            if self.width != 1.0 {
                for (l, r) in buf_l.iter_mut().zip(buf_r.iter_mut()) {
                    let mid = (*l + *r) * 0.5;
                    let side = (*l - *r) * 0.5 * self.width;
                    *l = mid + side;
                    *r = mid - side;
                }
            }
            if self.filter_on {
                let cutoff = (self.cutoff_base * self.rack.cutoff() * self.note_cutoff).min(self.nyquist_cap);
                let resonance = (self.resonance_base + self.rack.resonance()) * self.note_resonance;
                self.filter.set_params(cutoff, resonance);
                self.filter.process(buf_l, buf_r);
            }
            self.rack.eq_mut().process(buf_l, buf_r);

            let fade = self.vol_fade.render();
            if self.stop_on_silence && fade == 0.0 && !self.vol_fade.is_fading() {
                self.state = VoiceState::Free;
                return;
            }
            let volume = self.gain * self.rack.volume() * fade * ctx.midi_volume;
            let pan = (ctx.midi_pan as f32 + (self.pan + self.rack.pan(ctx.curves)) * 0.64).clamp(0.0, 128.0);
            let (pl, pr) = ctx.pan_curve.gains(pan as u8);
            let (nl, nr) = ctx.pan_curve.gains_norm(self.pan_fade.render());
            let target = (volume * pl * nl, volume * pr * nr);
            let (start_l, start_r) = self.last_gain.unwrap_or(target);
            let step = 1.0 / n as f32;
            for (i, (o, x)) in out_l[pos..end].iter_mut().zip(buf_l.iter()).enumerate() {
                let g = start_l + (target.0 - start_l) * step * (i + 1) as f32;
                *o += x * g;
            }
            for (i, (o, x)) in out_r[pos..end].iter_mut().zip(buf_r.iter()).enumerate() {
                let g = start_r + (target.1 - start_r) * step * (i + 1) as f32;
                *o += x * g;
            }
            self.last_gain = Some(target);

            if rendered < n {
                self.state = VoiceState::Free;
                return;
            }
            pos = end;
        }
        // Events after the last sub-block boundary still change state.
        self.apply_until(ctx, &mut cursor, u32::MAX);
    }

    fn loop_enabled(&self) -> bool {
        match self.sample_loop {
            Some(l) => l.cycles_left != Some(0) && !(self.sustain_loop && self.released),
            None => false,
        }
    }

    /// Resample `n` frames into the scratch output; returns frames produced
    /// before the sample ended.
    fn fill(&mut self, streams: &mut dyn DiskStreams, scratch: &mut VoiceScratch, n: usize, speed: f64) -> usize {
        let Some(key) = self.sample else {
            return 0;
        };
        let mut done = 0;
        while done < n {
            let looping = self.loop_enabled();
            let boundary = match self.sample_loop {
                Some(l) if looping => l.end,
                _ => self.sample_end,
            } as f64;
            if self.pos >= boundary {
                match self.sample_loop.as_mut() {
                    Some(l) if looping => {
                        self.pos -= (l.end - l.start) as f64;
                        if let Some(c) = l.cycles_left.as_mut() {
                            *c -= 1;
                        }
                        continue;
                    }
                    _ => break,
                }
            }
            if speed <= 0.0 {
                scratch.out_l[done..n].fill(0.0);
                scratch.out_r[done..n].fill(0.0);
                return n;
            }

            let until_boundary = libm::ceil((boundary - self.pos) / speed) as usize;
            let mut count = (n - done).min(until_boundary.max(1));
            let fit = ((WINDOW - 2) as f64 / speed) as usize;
            count = count.min(fit.max(1));
            let first = self.pos as u32;
            let span = (((self.pos + speed * count as f64) as u32 - first) as usize + 2).min(WINDOW);

            let (src_l, src_r) = (&mut scratch.src_l[..span], &mut scratch.src_r[..span]);
            src_l.fill(0.0);
            src_r.fill(0.0);
            // An underrun plays silence but keeps time.
            if streams.ensure_buffered(key, first, span as u32) {
                streams.read_frames(key, first, src_l, src_r);
            }
            for i in 0..count {
                let p = self.pos - first as f64;
                let idx = (p as usize).min(span - 2);
                let frac = (p - idx as f64) as f32;
                scratch.out_l[done + i] = src_l[idx] + (src_l[idx + 1] - src_l[idx]) * frac;
                scratch.out_r[done + i] = src_r[idx] + (src_r[idx + 1] - src_r[idx]) * frac;
                self.pos += speed;
            }
            done += count;
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::RamStreams;
    use kz_ir::{Instrument, SampleData};

    const TIMING: VoiceTiming = VoiceTiming {
        sample_rate: 32000.0,
        sub_frames: 32,
        fade_time: 0.0025,
        min_release: 0.0025,
        eg_bottom: 0.001,
        kill_steps: 4,
    };

    fn instrument(data: Vec<f32>, region: Region) -> (Instrument, SampleKey) {
        let mut inst = Instrument::new("t");
        let mut sample = Sample::new("s");
        sample.data = SampleData::MonoF32(data);
        sample.sample_rate = 32000;
        let key = inst.samples.insert(sample);
        inst.regions.push(Region { sample: Some(key), ..region });
        (inst, key)
    }

    fn start(voice: &mut Voice, inst: &Instrument, key: SampleKey, overrides: &NoteOverrides) -> bool {
        let cc = [0u8; CTRL_TABLE_SIZE];
        let setup = VoiceSetup {
            region: &inst.regions[0],
            region_index: 0,
            sample_key: key,
            sample: &inst.samples[key],
            curves: &inst.curves,
            cc: &cc,
            key: 60,
            velocity: 127,
            bend: 0,
            note: None,
            channel: 0,
            kind: VoiceKind::Normal,
            fragment_pos: 0,
            overrides,
            attenuation: 1.0,
            random: [0.0; 4],
            timing: &TIMING,
        };
        voice.trigger(&setup)
    }

    fn render(voice: &mut Voice, inst: &Instrument, frames: usize) -> (Vec<f32>, Vec<f32>) {
        render_with(voice, inst, frames, &[])
    }

    fn render_with(voice: &mut Voice, inst: &Instrument, frames: usize, events: &[VoiceEvent]) -> (Vec<f32>, Vec<f32>) {
        let pan_curve = PanCurve::new();
        let ctx = RenderContext { curves: &inst.curves, events, pan_curve: &pan_curve, midi_volume: 1.0, midi_pan: 64 };
        let mut scratch = VoiceScratch::default();
        let mut streams = RamStreams::new(&inst.samples);
        let mut l = vec![0.0; frames];
        let mut r = vec![0.0; frames];
        voice.render(&mut streams, &ctx, &mut scratch, &mut l, &mut r);
        (l, r)
    }

    #[test]
    fn velocity_curve_is_quadratic() {
        assert_eq!(velocity_attenuation(100.0, 127), 1.0);
        assert!((velocity_attenuation(100.0, 64) - 0.254).abs() < 0.001);
        assert_eq!(velocity_attenuation(0.0, 1), 1.0);
        // Negative tracking inverts the response.
        assert_eq!(velocity_attenuation(-100.0, 0), 1.0);
    }

    #[test]
    fn bend_uses_separate_ranges() {
        assert_eq!(bend_cents(8191, 200.0, -200.0), 200.0);
        assert_eq!(bend_cents(-8192, 200.0, -1200.0), -1200.0);
        assert_eq!(bend_cents(0, 200.0, -200.0), 0.0);
    }

    #[test]
    fn plays_sample_at_unity_and_stops_at_end() {
        let (inst, key) = instrument(vec![0.5; 100], Region::default());
        let mut voice = Voice::default();
        assert!(start(&mut voice, &inst, key, &NoteOverrides::default()));
        let (l, r) = render(&mut voice, &inst, 64);
        assert!(voice.is_active());
        // Center pan gain is just under unity.
        assert!((l[10] - 0.5).abs() < 0.01);
        assert_eq!(l[10], r[10]);
        let (l, _) = render(&mut voice, &inst, 64);
        assert!(l[40].abs() < 1e-6);
        assert!(!voice.is_active());
    }

    #[test]
    fn silent_region_does_not_start() {
        let region = Region { amplitude: 0.0, ..Region::default() };
        let (inst, key) = instrument(vec![0.5; 100], region);
        let mut voice = Voice::default();
        assert!(!start(&mut voice, &inst, key, &NoteOverrides::default()));
        assert!(!voice.is_active());
    }

    #[test]
    fn continuous_loop_keeps_playing() {
        let region = Region {
            loop_mode: LoopMode::Continuous,
            loop_start: Some(10),
            loop_end: Some(19),
            ..Region::default()
        };
        let (inst, key) = instrument(vec![0.25; 40], region);
        let mut voice = Voice::default();
        start(&mut voice, &inst, key, &NoteOverrides::default());
        for _ in 0..10 {
            render(&mut voice, &inst, 64);
        }
        assert!(voice.is_active());
        assert!(voice.position() >= 10.0 && voice.position() < 20.0);
    }

    #[test]
    fn loop_count_limits_cycles() {
        let region = Region {
            loop_mode: LoopMode::Continuous,
            loop_start: Some(0),
            loop_end: Some(9),
            count: Some(2),
            ..Region::default()
        };
        let (inst, key) = instrument(vec![0.25; 20], region);
        let mut voice = Voice::default();
        start(&mut voice, &inst, key, &NoteOverrides::default());
        // Two wraps, then on to the end: 10 + 10 + 20 frames.
        render(&mut voice, &inst, 32);
        assert!(voice.is_active());
        render(&mut voice, &inst, 32);
        assert!(!voice.is_active());
    }

    #[test]
    fn pitch_is_capped() {
        let region = Region { transpose: 96, ..Region::default() };
        let (inst, key) = instrument(vec![0.25; 10_000], region);
        let mut voice = Voice::default();
        start(&mut voice, &inst, key, &NoteOverrides::default());
        render(&mut voice, &inst, 32);
        assert!((voice.position() - 32.0 * 16.0).abs() < 1e-6);
    }

    #[test]
    fn octave_up_doubles_speed() {
        let region = Region { pitch_keycenter: 48, ..Region::default() };
        let (inst, key) = instrument(vec![0.25; 1000], region);
        let mut voice = Voice::default();
        start(&mut voice, &inst, key, &NoteOverrides::default());
        render(&mut voice, &inst, 32);
        assert!((voice.position() - 64.0).abs() < 1e-3);
    }

    #[test]
    fn release_ends_voice() {
        let mut region = Region::default();
        region.ampeg.release = 0.01;
        let (inst, key) = instrument(vec![0.25; 100_000], region);
        let mut voice = Voice::default();
        start(&mut voice, &inst, key, &NoteOverrides::default());
        render(&mut voice, &inst, 256);
        voice.release(0);
        render(&mut voice, &inst, 256);
        assert_eq!(voice.state, VoiceState::Releasing);
        for _ in 0..4 {
            render(&mut voice, &inst, 256);
        }
        assert!(!voice.is_active());
    }

    #[test]
    fn kill_silences_within_bound() {
        let mut region = Region::default();
        region.ampeg.release = 10.0;
        let (inst, key) = instrument(vec![0.25; 100_000], region);
        let mut voice = Voice::default();
        start(&mut voice, &inst, key, &NoteOverrides::default());
        render(&mut voice, &inst, 64);
        voice.kill(0);
        // Four sub-blocks of fade, then the voice ends on the next step.
        render(&mut voice, &inst, 32 * 6);
        assert!(!voice.is_active());
    }

    #[test]
    fn release_in_start_delay_ends_voice_silently() {
        let region = Region { delay: 1.0, ..Region::default() };
        let (inst, key) = instrument(vec![0.25; 100], region);
        let mut voice = Voice::default();
        start(&mut voice, &inst, key, &NoteOverrides::default());
        voice.release(10);
        let (l, _) = render(&mut voice, &inst, 64);
        assert!(l.iter().all(|&x| x == 0.0));
        assert!(!voice.is_active());
    }

    #[test]
    fn controller_events_reach_units() {
        let mut region = Region::default();
        region.volume_oncc.push(kz_ir::CcBinding::new(7, -200.0));
        let (inst, key) = instrument(vec![0.5; 10_000], region);
        let mut voice = Voice::default();
        start(&mut voice, &inst, key, &NoteOverrides::default());
        let events = [VoiceEvent { pos: 0, kind: VoiceEventKind::Controller { cc: 7, value: 127 } }];
        let (l, _) = render_with(&mut voice, &inst, 64, &events);
        assert!(l[63].abs() < 1e-6);
    }

    #[test]
    fn fade_out_with_stop_ends_voice() {
        let (inst, key) = instrument(vec![0.5; 100_000], Region::default());
        let mut voice = Voice::default();
        start(&mut voice, &inst, key, &NoteOverrides::default());
        render(&mut voice, &inst, 64);
        // 10 ms at 1000 steps per second.
        voice.fade_out(0.01, true);
        render(&mut voice, &inst, 32 * 9);
        assert!(voice.is_active());
        render(&mut voice, &inst, 64);
        assert!(!voice.is_active());
    }

    #[test]
    fn note_volume_override_scales_output() {
        let (inst, key) = instrument(vec![0.5; 1000], Region::default());
        let overrides = NoteOverrides { volume: 0.5, ..NoteOverrides::default() };
        let mut voice = Voice::default();
        start(&mut voice, &inst, key, &overrides);
        let (l, _) = render(&mut voice, &inst, 64);
        assert!((l[40] - 0.25).abs() < 0.01);
    }
}
