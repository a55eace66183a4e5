//! Mapping of SFZ opcodes onto region definitions.
//!
//! Header-level directives (`sample`, `default_path`, `#define`, ...) are
//! handled by the parser; everything that lands on a [`Region`] or one of
//! its envelopes and LFOs is decoded here.

use kz_ir::modulation::binding_mut;
use kz_ir::{
    AdsrDefinition, CcList, EgDefinition, FilterType, LfoDefinition, LfoV1Definition, LfoWave,
    LoopMode, OffMode, Region, SwVel, Trigger, XfCcRange, XfCurve, CTRL_CHANNEL_PRESSURE,
    CTRL_TABLE_SIZE,
};
use tracing::warn;

use crate::sfz_format::parse_key;
use crate::FormatError;

/// Flex envelopes and LFOs beyond this index are ignored.
const MAX_FLEX_INDEX: usize = 32;
const MAX_EG_NODES: usize = 64;

/// Scalar decoding with the position and key offsets of the opcode being
/// applied.
pub(crate) struct Scalars<'a> {
    pub file: &'a str,
    pub line: u32,
    pub note_offset: i32,
    pub octave_offset: i32,
}

impl Scalars<'_> {
    pub fn error(&self, message: String) -> FormatError {
        FormatError::Parse { file: self.file.into(), line: self.line, message }
    }

    /// Leading integer of `v`; trailing garbage is ignored.
    pub fn int(&self, v: &str) -> Result<i32, FormatError> {
        let v = v.trim();
        let end = v
            .char_indices()
            .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
            .map_or(v.len(), |(i, _)| i);
        v[..end].parse().map_err(|_| self.error(format!("expected an integer, got `{v}`")))
    }

    /// Leading number of `v`; trailing garbage is ignored.
    pub fn float(&self, v: &str) -> Result<f32, FormatError> {
        let v = v.trim();
        if let Ok(x) = v.parse() {
            return Ok(x);
        }
        let end = v
            .char_indices()
            .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || (i == 0 && (c == '-' || c == '+'))))
            .map_or(v.len(), |(i, _)| i);
        v[..end].parse().map_err(|_| self.error(format!("expected a number, got `{v}`")))
    }

    /// A MIDI key as a number or note name, shifted by the `<control>`
    /// offsets. `-1` passes through unshifted.
    pub fn note(&self, v: &str) -> Result<i16, FormatError> {
        let key = parse_key(v).ok_or_else(|| self.error(format!("not a note: `{}`", v.trim())))?;
        if key == -1 {
            return Ok(-1);
        }
        Ok((key + self.note_offset + 12 * self.octave_offset).clamp(-1, 127) as i16)
    }

    fn u7(&self, v: &str) -> Result<u8, FormatError> {
        Ok(self.int(v)?.clamp(0, 127) as u8)
    }

    fn unsigned(&self, v: &str) -> Result<u32, FormatError> {
        Ok(self.int(v)?.max(0) as u32)
    }
}

/// Clamp `val` into `min..=max`, warning when it was out of range.
fn check(key: &str, min: f32, max: f32, val: f32) -> f32 {
    if val < min || val > max {
        warn!(opcode = key, value = val, min, max, "opcode value out of range, clamped");
    }
    val.clamp(min, max)
}

/// Split a leading decimal index off `s`: `"12_time"` is `(12, "_time")`.
fn split_index(s: &str) -> Option<(usize, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    Some((s[..end].parse().ok()?, &s[end..]))
}

fn trigger(value: &str) -> Option<Trigger> {
    Some(match value {
        "attack" => Trigger::ATTACK,
        "release" => Trigger::RELEASE,
        "first" => Trigger::FIRST,
        "legato" => Trigger::LEGATO,
        "release_key" => Trigger::RELEASE_KEY,
        _ => return None,
    })
}

fn xf_curve(value: &str) -> Option<XfCurve> {
    match value {
        "gain" => Some(XfCurve::Gain),
        "power" => Some(XfCurve::Power),
        _ => None,
    }
}

fn filter_type(value: &str) -> Option<FilterType> {
    Some(match value {
        "lpf_1p" => FilterType::Lpf1p,
        "hpf_1p" => FilterType::Hpf1p,
        "lpf_2p" => FilterType::Lpf2p,
        "hpf_2p" => FilterType::Hpf2p,
        "bpf_2p" => FilterType::Bpf2p,
        "brf_2p" => FilterType::Brf2p,
        _ => return None,
    })
}

fn loop_mode(value: &str) -> Option<LoopMode> {
    Some(match value {
        "no_loop" => LoopMode::NoLoop,
        "one_shot" => LoopMode::OneShot,
        "loop_continuous" => LoopMode::Continuous,
        "loop_sustain" => LoopMode::Sustain,
        _ => return None,
    })
}

/// Apply `key=value` to `r`. Returns `Ok(false)` for opcodes this loader
/// does not know.
pub(crate) fn apply(r: &mut Region, key: &str, value: &str, s: &Scalars) -> Result<bool, FormatError> {
    let v = value;
    match key {
        // === Input controls ===
        "lochan" => r.lochan = s.int(v)?.clamp(1, 16) as u8,
        "hichan" => r.hichan = s.int(v)?.clamp(1, 16) as u8,
        "lokey" => r.lokey = s.note(v)?,
        "hikey" => r.hikey = s.note(v)?,
        "key" => {
            let k = s.note(v)?;
            r.lokey = k;
            r.hikey = k;
            r.pitch_keycenter = k;
        }
        "lovel" => r.lovel = s.u7(v)?,
        "hivel" => r.hivel = s.u7(v)?,
        "lobend" => r.lobend = s.int(v)?.clamp(-8192, 8192) as i16,
        "hibend" => r.hibend = s.int(v)?.clamp(-8192, 8192) as i16,
        "lobpm" => r.lobpm = s.float(v)?,
        "hibpm" => r.hibpm = s.float(v)?,
        "lochanaft" => r.lochanaft = s.u7(v)?,
        "hichanaft" => r.hichanaft = s.u7(v)?,
        "lopolyaft" => r.lopolyaft = s.u7(v)?,
        "hipolyaft" => r.hipolyaft = s.u7(v)?,
        "loprog" => r.loprog = s.u7(v)?,
        "hiprog" => r.hiprog = s.u7(v)?,
        "lorand" => r.lorand = s.float(v)?,
        "hirand" => r.hirand = s.float(v)?,
        "lotimer" => r.lotimer = s.float(v)?,
        "hitimer" => r.hitimer = s.float(v)?,
        "seq_length" => r.seq_length = s.unsigned(v)?.max(1),
        "seq_position" => r.seq_position = s.unsigned(v)?.max(1),
        "sw_lokey" => r.sw_lokey = s.note(v)?,
        "sw_hikey" => r.sw_hikey = s.note(v)?,
        "sw_last" => r.sw_last = s.note(v)?,
        "sw_down" => r.sw_down = s.note(v)?,
        "sw_up" => r.sw_up = s.note(v)?,
        "sw_previous" => r.sw_previous = s.note(v)?,
        "sw_vel" => match v {
            "current" => r.sw_vel = SwVel::Current,
            "previous" => r.sw_vel = SwVel::Previous,
            _ => warn!(value = v, "unknown sw_vel value"),
        },
        "trigger" => match trigger(v) {
            Some(t) => r.trigger = t,
            None => warn!(value = v, "unknown trigger value"),
        },
        "group" => r.group = s.unsigned(v)?,
        "off_by" | "offby" => r.off_by = s.unsigned(v)?,
        "off_mode" | "offmode" => match v {
            "fast" => r.off_mode = OffMode::Fast,
            "normal" => r.off_mode = OffMode::Normal,
            _ => warn!(value = v, "unknown off_mode value"),
        },

        // === Sample player ===
        "count" => {
            r.count = Some(s.unsigned(v)?);
            r.loop_mode = LoopMode::OneShot;
        }
        "delay" => r.delay = s.float(v)?,
        "delay_random" => r.delay_random = s.float(v)?,
        "delay_samples" => r.delay_samples = s.unsigned(v)?,
        "end" => r.end = s.unsigned(v)?,
        "offset" => r.offset = s.unsigned(v)?,
        "offset_random" => r.offset_random = s.unsigned(v)?,
        "loop_mode" | "loopmode" => match loop_mode(v) {
            Some(m) => r.loop_mode = m,
            None => warn!(value = v, "unknown loop_mode value"),
        },
        "loop_start" | "loopstart" => r.loop_start = Some(s.unsigned(v)?),
        "loop_end" | "loopend" => r.loop_end = Some(s.unsigned(v)?),

        // === Amplifier ===
        "volume" => r.volume = s.float(v)?,
        "amplitude" => r.amplitude = s.float(v)?,
        "pan" => r.pan = s.float(v)?,
        "width" => r.width = s.float(v)?,
        "position" => r.position = s.float(v)?,
        "amp_keytrack" => r.amp_keytrack = s.float(v)?,
        "amp_keycenter" => r.amp_keycenter = s.note(v)?.max(0) as u8,
        "amp_veltrack" => r.amp_veltrack = s.float(v)?,
        "amp_random" => r.amp_random = s.float(v)?,
        "rt_decay" | "rtdecay" => r.rt_decay = s.float(v)?,
        "xfin_lokey" => r.xfin_lokey = s.note(v)?.max(0) as u8,
        "xfin_hikey" => r.xfin_hikey = s.note(v)?.max(0) as u8,
        "xfout_lokey" => r.xfout_lokey = s.note(v)?.max(0) as u8,
        "xfout_hikey" => r.xfout_hikey = s.note(v)?.max(0) as u8,
        "xfin_lovel" => r.xfin_lovel = s.u7(v)?,
        "xfin_hivel" => r.xfin_hivel = s.u7(v)?,
        "xfout_lovel" => r.xfout_lovel = s.u7(v)?,
        "xfout_hivel" => r.xfout_hivel = s.u7(v)?,
        "xf_keycurve" | "xf_velcurve" | "xf_cccurve" => match xf_curve(v) {
            Some(c) if key == "xf_keycurve" => r.xf_keycurve = c,
            Some(c) if key == "xf_velcurve" => r.xf_velcurve = c,
            Some(c) => r.xf_cccurve = c,
            None => warn!(opcode = key, value = v, "unknown cross-fade curve"),
        },

        // === Pitch ===
        "transpose" => r.transpose = s.int(v)?,
        "tune" => r.tune = s.int(v)?,
        "pitch_keycenter" => r.pitch_keycenter = s.note(v)?,
        "pitch_keytrack" => r.pitch_keytrack = s.int(v)?,
        "pitch_veltrack" => r.pitch_veltrack = s.int(v)?,
        "pitch_random" => r.pitch_random = s.int(v)?,
        "bend_up" | "bendup" => r.bend_up = s.int(v)?,
        "bend_down" | "benddown" => r.bend_down = s.int(v)?,

        // === Filter ===
        "fil_type" | "filtype" => match filter_type(v) {
            Some(t) => r.fil_type = t,
            None => warn!(value = v, "unsupported filter type"),
        },
        "cutoff" => r.cutoff = Some(s.float(v)?),
        "cutoff_chanaft" => {
            let depth = check(key, -9600.0, 9600.0, s.int(v)? as f32);
            binding_mut(&mut r.cutoff_oncc, CTRL_CHANNEL_PRESSURE).influence = depth;
        }
        "resonance" => r.resonance = s.float(v)?,
        "fil_keytrack" => r.fil_keytrack = s.int(v)?,
        "fil_keycenter" => r.fil_keycenter = s.note(v)?.max(0) as u8,
        "fil_veltrack" => r.fil_veltrack = s.int(v)?,
        "fil_random" => r.fil_random = s.int(v)?,

        _ => return apply_family(r, key, v, s),
    }
    Ok(true)
}

/// Opcodes with an index or a family prefix: equalizer bands, v1 and v2
/// envelopes and LFOs, and controller bindings.
fn apply_family(r: &mut Region, key: &str, v: &str, s: &Scalars) -> Result<bool, FormatError> {
    if let Some((band, field)) = key.strip_prefix("eq").and_then(split_index) {
        if let Some(band) = band.checked_sub(1).and_then(|b| r.eq.get_mut(b)) {
            let slot = match field {
                "_freq" => Some(&mut band.freq),
                "_bw" => Some(&mut band.bw),
                "_gain" => Some(&mut band.gain),
                "_vel2freq" => Some(&mut band.vel2freq),
                "_vel2gain" => Some(&mut band.vel2gain),
                _ => None,
            };
            if let Some(slot) = slot {
                *slot = s.float(v)?;
                return Ok(true);
            }
        }
    }

    for (prefix, adsr) in [("ampeg_", &mut r.ampeg), ("fileg_", &mut r.fileg), ("pitcheg_", &mut r.pitcheg)] {
        if let Some(field) = key.strip_prefix(prefix) {
            if let Some(slot) = adsr_field(adsr, field) {
                *slot = match (prefix, field) {
                    (_, "depth") => check(key, -12000.0, 12000.0, s.int(v)? as f32),
                    (_, "vel2delay") if prefix != "ampeg_" => check(key, -100.0, 100.0, s.float(v)?),
                    _ => s.float(v)?,
                };
                return Ok(true);
            }
        }
    }

    for (prefix, lfo) in [("amplfo_", &mut r.amplfo), ("fillfo_", &mut r.fillfo), ("pitchlfo_", &mut r.pitchlfo)] {
        if let Some(field) = key.strip_prefix(prefix) {
            if apply_lfo_v1(lfo, key, field, v, s)? {
                return Ok(true);
            }
            break;
        }
    }

    if let Some((index, rest)) = key.strip_prefix("eg").and_then(split_index) {
        if index >= MAX_FLEX_INDEX {
            warn!(opcode = key, "flex envelope index too high, ignored");
            return Ok(true);
        }
        if r.egs.len() <= index {
            r.egs.resize_with(index + 1, EgDefinition::default);
        }
        return apply_eg(&mut r.egs[index], key, rest, v, s);
    }

    if let Some((index, rest)) = key.strip_prefix("lfo").and_then(split_index) {
        if index >= MAX_FLEX_INDEX {
            warn!(opcode = key, "flex LFO index too high, ignored");
            return Ok(true);
        }
        if r.lfos.len() <= index {
            r.lfos.resize_with(index + 1, LfoDefinition::default);
        }
        return apply_lfo(&mut r.lfos[index], key, rest, v, s);
    }

    apply_cc(r, key, v, s)
}

fn apply_lfo_v1(lfo: &mut LfoV1Definition, key: &str, field: &str, v: &str, s: &Scalars) -> Result<bool, FormatError> {
    match field {
        "delay" => lfo.delay = s.float(v)?,
        "fade" => lfo.fade = s.float(v)?,
        "freq" => lfo.freq = s.float(v)?,
        "depth" => lfo.depth = s.float(v)?,
        "freqchanaft" => {
            binding_mut(&mut lfo.freq_oncc, CTRL_CHANNEL_PRESSURE).influence = check(key, -200.0, 200.0, s.float(v)?)
        }
        "depthchanaft" => binding_mut(&mut lfo.depth_oncc, CTRL_CHANNEL_PRESSURE).influence = s.float(v)?,
        _ => return Ok(false),
    }
    Ok(true)
}

fn adsr_field<'a>(eg: &'a mut AdsrDefinition, field: &str) -> Option<&'a mut f32> {
    Some(match field {
        "delay" => &mut eg.delay,
        "start" => &mut eg.start,
        "attack" => &mut eg.attack,
        "hold" => &mut eg.hold,
        "decay" => &mut eg.decay,
        "sustain" => &mut eg.sustain,
        "release" => &mut eg.release,
        "depth" => &mut eg.depth,
        "vel2delay" => &mut eg.vel2delay,
        "vel2attack" => &mut eg.vel2attack,
        "vel2hold" => &mut eg.vel2hold,
        "vel2decay" => &mut eg.vel2decay,
        "vel2sustain" => &mut eg.vel2sustain,
        "vel2release" => &mut eg.vel2release,
        "vel2depth" => &mut eg.vel2depth,
        _ => return None,
    })
}

fn adsr_cc<'a>(eg: &'a mut AdsrDefinition, field: &str) -> Option<(&'a mut CcList, f32, f32)> {
    Some(match field {
        "delay" => (&mut eg.delay_oncc, -100.0, 100.0),
        "start" => (&mut eg.start_oncc, -100.0, 100.0),
        "attack" => (&mut eg.attack_oncc, -100.0, 100.0),
        "hold" => (&mut eg.hold_oncc, -100.0, 100.0),
        "decay" => (&mut eg.decay_oncc, -100.0, 100.0),
        "sustain" => (&mut eg.sustain_oncc, -100.0, 100.0),
        "release" => (&mut eg.release_oncc, -100.0, 100.0),
        "depth" => (&mut eg.depth_oncc, -12000.0, 12000.0),
        _ => return None,
    })
}

fn lfo_v1_cc<'a>(lfo: &'a mut LfoV1Definition, field: &str, depth_range: f32) -> Option<(&'a mut CcList, f32, f32)> {
    Some(match field {
        "delay" => (&mut lfo.delay_oncc, 0.0, 100.0),
        "fade" => (&mut lfo.fade_oncc, 0.0, 100.0),
        "freq" => (&mut lfo.freq_oncc, -200.0, 200.0),
        "depth" => (&mut lfo.depth_oncc, -depth_range, depth_range),
        _ => return None,
    })
}

fn apply_eg(eg: &mut EgDefinition, key: &str, rest: &str, v: &str, s: &Scalars) -> Result<bool, FormatError> {
    for (name, min, max) in [("_time", 0.0, 100.0), ("_level", 0.0, 1.0)] {
        if let Some((node, tail)) = rest.strip_prefix(name).and_then(split_index) {
            if node >= MAX_EG_NODES {
                warn!(opcode = key, "envelope node index too high, ignored");
                return Ok(true);
            }
            if eg.nodes.len() <= node {
                eg.nodes.resize_with(node + 1, Default::default);
            }
            let n = &mut eg.nodes[node];
            let (value, list) = if name == "_time" { (&mut n.time, &mut n.time_oncc) } else { (&mut n.level, &mut n.level_oncc) };
            if tail.is_empty() {
                *value = check(key, min, max, s.float(v)?);
            } else if let Some(cc) = tail.strip_prefix("_oncc").and_then(|c| c.parse::<u16>().ok()) {
                set_binding(list, cc, CcField::Influence, check(key, min, max, s.float(v)?), key);
            } else {
                return Ok(false);
            }
            return Ok(true);
        }
    }
    if let Some((node, "")) = rest.strip_prefix("_shape").and_then(split_index) {
        if node < MAX_EG_NODES {
            if eg.nodes.len() <= node {
                eg.nodes.resize_with(node + 1, Default::default);
            }
            eg.nodes[node].shape = s.float(v)?;
        }
        return Ok(true);
    }
    match rest {
        "_sustain" => eg.sustain = s.int(v)?.max(0) as usize,
        "_amplitude" => eg.amplitude = s.float(v)?,
        "_volume" => eg.volume = check(key, -144.0, 6.0, s.float(v)?),
        "_cutoff" => eg.cutoff = s.float(v)?,
        "_pitch" => eg.pitch = check(key, -9600.0, 9600.0, s.int(v)? as f32),
        "_resonance" => eg.resonance = check(key, 0.0, 40.0, s.float(v)?),
        "_pan" => eg.pan = check(key, -100.0, 100.0, s.float(v)?),
        "_pan_curve" => eg.pan_curve = check(key, 0.0, 30000.0, s.int(v)? as f32) as i16,
        _ => {
            let Some((dest, cc)) = rest.strip_prefix('_').and_then(|t| t.split_once("_oncc")) else {
                return Ok(false);
            };
            let Ok(cc) = cc.parse::<u16>() else { return Ok(false) };
            let (list, min, max) = match dest {
                "amplitude" => (&mut eg.amplitude_oncc, 0.0, 100.0),
                "volume" => (&mut eg.volume_oncc, -144.0, 6.0),
                "cutoff" => (&mut eg.cutoff_oncc, -9600.0, 9600.0),
                "pitch" => (&mut eg.pitch_oncc, -9600.0, 9600.0),
                "resonance" => (&mut eg.resonance_oncc, 0.0, 40.0),
                "pan" => (&mut eg.pan_oncc, -100.0, 100.0),
                _ => return Ok(false),
            };
            set_binding(list, cc, CcField::Influence, check(key, min, max, s.float(v)?), key);
        }
    }
    Ok(true)
}

fn apply_lfo(lfo: &mut LfoDefinition, key: &str, rest: &str, v: &str, s: &Scalars) -> Result<bool, FormatError> {
    match rest {
        "_freq" => lfo.freq = check(key, 0.0, 20.0, s.float(v)?),
        "_wave" => lfo.wave = LfoWave::from_index(s.int(v)?),
        "_delay" => lfo.delay = check(key, 0.0, 100.0, s.float(v)?),
        "_fade" => lfo.fade = check(key, 0.0, 100.0, s.float(v)?),
        // Degrees in the file, fractions of a cycle in the model.
        "_phase" => lfo.phase = check(key, 0.0, 360.0, s.float(v)?) / 360.0,
        "_volume" => lfo.volume = check(key, -144.0, 6.0, s.float(v)?),
        "_pitch" => lfo.pitch = check(key, -9600.0, 9600.0, s.int(v)? as f32),
        "_cutoff" => lfo.cutoff = check(key, -9600.0, 9600.0, s.int(v)? as f32),
        "_resonance" => lfo.resonance = check(key, 0.0, 40.0, s.float(v)?),
        "_pan" => lfo.pan = check(key, -100.0, 100.0, s.float(v)?),
        _ => {
            let Some(tail) = rest.strip_prefix('_') else { return Ok(false) };
            let (dest, field, cc) = if let Some((d, cc)) = tail.split_once("_oncc") {
                (d, CcField::Influence, cc)
            } else if let Some((d, cc)) = tail.split_once("_smoothcc") {
                (d, CcField::Smooth, cc)
            } else if let Some((d, cc)) = tail.split_once("_stepcc") {
                (d, CcField::Step, cc)
            } else {
                return Ok(false);
            };
            let Ok(cc) = cc.parse::<u16>() else { return Ok(false) };
            let (list, min, max) = match dest {
                "freq" => (&mut lfo.freq_oncc, 0.0, 20.0),
                "phase" => (&mut lfo.phase_oncc, 0.0, 360.0),
                "delay" => (&mut lfo.delay_oncc, 0.0, 100.0),
                "fade" => (&mut lfo.fade_oncc, 0.0, 100.0),
                "volume" => (&mut lfo.volume_oncc, -144.0, 6.0),
                "pitch" => (&mut lfo.pitch_oncc, -9600.0, 9600.0),
                "cutoff" => (&mut lfo.cutoff_oncc, -9600.0, 9600.0),
                "resonance" => (&mut lfo.resonance_oncc, 0.0, 40.0),
                "pan" => (&mut lfo.pan_oncc, -100.0, 100.0),
                _ => return Ok(false),
            };
            let mut value = s.float(v)?;
            if field == CcField::Influence {
                value = check(key, min, max, value);
                if dest == "phase" {
                    value /= 360.0;
                }
            }
            set_binding(list, cc, field, value, key);
        }
    }
    Ok(true)
}

/// Which part of a controller binding an opcode sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CcField {
    Influence,
    Curve,
    Smooth,
    Step,
}

fn set_binding(list: &mut CcList, cc: u16, field: CcField, value: f32, key: &str) {
    if cc as usize >= CTRL_TABLE_SIZE {
        warn!(opcode = key, cc, "invalid controller number");
        return;
    }
    let b = binding_mut(list, cc);
    match field {
        CcField::Influence => b.influence = value,
        CcField::Curve => b.curve = value.clamp(0.0, 30000.0) as i16,
        CcField::Smooth => b.smooth = value.max(0.0),
        CcField::Step => b.step = value.abs(),
    }
}

fn xf_range(list: &mut Vec<XfCcRange>, cc: u16, default: u8) -> &mut XfCcRange {
    let idx = match list.iter().position(|x| x.cc == cc) {
        Some(idx) => idx,
        None => {
            list.push(XfCcRange { cc, lo: default, hi: default });
            list.len() - 1
        }
    };
    &mut list[idx]
}

/// Controller opcodes: `<name>ccN`, `<name>_onccN` and the `_curve`,
/// `_smooth` and `_step` modifiers.
fn apply_cc(r: &mut Region, key: &str, v: &str, s: &Scalars) -> Result<bool, FormatError> {
    let Some(at) = key.find("cc") else { return Ok(false) };
    let mut name = &key[..at];
    if name.len() > 3 {
        name = name.strip_suffix("_on").unwrap_or(name);
    }
    let Ok(cc) = key[at + 2..].parse::<u16>() else {
        return Err(s.error(format!("invalid controller number in `{key}`")));
    };
    if cc as usize >= CTRL_TABLE_SIZE {
        warn!(opcode = key, cc, "invalid controller number");
        return Ok(true);
    }
    let cc7 = cc.min(127) as usize;

    match name {
        "lo" => r.locc[cc7] = s.u7(v)?,
        "hi" => r.hicc[cc7] = s.u7(v)?,
        "on_lo" => r.on_locc[cc7] = s.int(v)?.clamp(-1, 127) as i16,
        "on_hi" => r.on_hicc[cc7] = s.int(v)?.clamp(-1, 127) as i16,
        "xfin_lo" => xf_range(&mut r.xfin_cc, cc, 0).lo = s.u7(v)?,
        "xfin_hi" => xf_range(&mut r.xfin_cc, cc, 0).hi = s.u7(v)?,
        "xfout_lo" => xf_range(&mut r.xfout_cc, cc, 127).lo = s.u7(v)?,
        "xfout_hi" => xf_range(&mut r.xfout_cc, cc, 127).hi = s.u7(v)?,
        _ => {
            let (base, field) = if let Some(b) = name.strip_suffix("_curve") {
                (b, CcField::Curve)
            } else if let Some(b) = name.strip_suffix("_smooth") {
                (b, CcField::Smooth)
            } else if let Some(b) = name.strip_suffix("_step") {
                (b, CcField::Step)
            } else {
                (name.strip_suffix('_').unwrap_or(name), CcField::Influence)
            };
            let Some((list, min, max)) = cc_target(r, base) else { return Ok(false) };
            let mut value = s.float(v)?;
            if field == CcField::Influence {
                value = check(key, min, max, value);
            }
            set_binding(list, cc, field, value, key);
        }
    }
    Ok(true)
}

/// The binding list a controller opcode named `base` modulates, with the
/// allowed influence range.
fn cc_target<'a>(r: &'a mut Region, base: &str) -> Option<(&'a mut CcList, f32, f32)> {
    const ANY: f32 = f32::MAX;
    Some(match base {
        "delay" => (&mut r.delay_oncc, -ANY, ANY),
        "delay_samples" => (&mut r.delay_samples_oncc, -ANY, ANY),
        "offset" => (&mut r.offset_oncc, -ANY, ANY),
        "volume" | "gain" => (&mut r.volume_oncc, -144.0, 100.0),
        "amplitude" => (&mut r.amplitude_oncc, -ANY, ANY),
        "pan" => (&mut r.pan_oncc, -200.0, 200.0),
        "pitch" => (&mut r.pitch_oncc, -9600.0, 9600.0),
        "cutoff" => (&mut r.cutoff_oncc, -9600.0, 9600.0),
        "resonance" => (&mut r.resonance_oncc, 0.0, 40.0),
        "eq1_freq" | "eq2_freq" | "eq3_freq" | "eq1_bw" | "eq2_bw" | "eq3_bw" | "eq1_gain" | "eq2_gain"
        | "eq3_gain" => {
            let band = &mut r.eq[(base.as_bytes()[2] - b'1') as usize];
            match &base[4..] {
                "freq" => (&mut band.freq_oncc, -ANY, ANY),
                "bw" => (&mut band.bw_oncc, -ANY, ANY),
                _ => (&mut band.gain_oncc, -ANY, ANY),
            }
        }
        _ => {
            if let Some(field) = base.strip_prefix("ampeg_") {
                return adsr_cc(&mut r.ampeg, field);
            }
            if let Some(field) = base.strip_prefix("fileg_") {
                return adsr_cc(&mut r.fileg, field);
            }
            if let Some(field) = base.strip_prefix("pitcheg_") {
                return adsr_cc(&mut r.pitcheg, field);
            }
            if let Some(field) = base.strip_prefix("amplfo_") {
                return lfo_v1_cc(&mut r.amplfo, field, 10.0);
            }
            if let Some(field) = base.strip_prefix("fillfo_") {
                return lfo_v1_cc(&mut r.fillfo, field, 1200.0);
            }
            if let Some(field) = base.strip_prefix("pitchlfo_") {
                return lfo_v1_cc(&mut r.pitchlfo, field, 1200.0);
            }
            return None;
        }
    })
}
