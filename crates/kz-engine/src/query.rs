//! Region queries: what the engine knows about a trigger at the moment it
//! happens, and the per-region checks the lookup table cannot index.

use kz_ir::{Region, Trigger, CTRL_CHANNEL_PRESSURE, CTRL_TABLE_SIZE};

use crate::lookup_table::LookupTable;

/// Trigger context for region matching.
#[derive(Clone, Copy, Debug)]
pub struct Query<'a> {
    /// MIDI channel, 1..=16.
    pub chan: u8,
    pub key: u8,
    pub vel: u8,
    /// Pitch wheel, -8192..=8191.
    pub bend: i16,
    pub bpm: f32,
    pub chanaft: u8,
    pub polyaft: u8,
    pub prog: u8,
    /// Uniform random number in 0..1 drawn once per trigger.
    pub rand: f32,
    /// Seconds since the previous note-on; the engine does not track it and passes 0.
    pub timer: f32,
    /// Controller values of the channel.
    pub cc: &'a [u8; CTRL_TABLE_SIZE],
    /// Keys currently held down.
    pub sw: &'a [bool; 128],
    /// Most recent key-switch key, -1 if none.
    pub last_sw_key: i16,
    /// Key-switch key before the most recent one, -1 if none.
    pub prev_sw_key: i16,
    pub trig: Trigger,
}

impl<'a> Query<'a> {
    /// A note trigger with neutral values for everything not given.
    pub fn note(
        chan: u8,
        key: u8,
        vel: u8,
        cc: &'a [u8; CTRL_TABLE_SIZE],
        sw: &'a [bool; 128],
        trig: Trigger,
    ) -> Self {
        Self {
            chan,
            key,
            vel,
            bend: 0,
            bpm: 0.0,
            chanaft: cc[CTRL_CHANNEL_PRESSURE as usize],
            polyaft: 0,
            prog: 0,
            rand: 0.0,
            timer: 0.0,
            cc,
            sw,
            last_sw_key: -1,
            prev_sw_key: -1,
            trig,
        }
    }

    /// Iterate over matching regions of a lookup table bucket.
    ///
    /// `seq_counters` holds one round-robin counter per instrument region;
    /// every region that passes all other checks advances its counter,
    /// whether or not its sequence position is the current one.
    pub fn matches<'r>(
        &'r self,
        table: &'r LookupTable,
        regions: &'r [Region],
        seq_counters: &'r mut [u32],
    ) -> Matches<'r> {
        Matches { query: self, bucket: table.query(self), regions, seq_counters, pos: 0 }
    }
}

/// Iterator over region indices matching a query.
pub struct Matches<'r> {
    query: &'r Query<'r>,
    bucket: &'r [u32],
    regions: &'r [Region],
    seq_counters: &'r mut [u32],
    pos: usize,
}

impl Iterator for Matches<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        while let Some(&index) = self.bucket.get(self.pos) {
            self.pos += 1;
            let (Some(region), Some(counter)) =
                (self.regions.get(index as usize), self.seq_counters.get_mut(index as usize))
            else {
                continue;
            };
            if on_key(region, self.query, counter) {
                return Some(index);
            }
        }
        None
    }
}

/// Checks not covered by the lookup table, in order; the sequence counter
/// is checked last so only otherwise matching regions advance it.
pub fn on_key(region: &Region, q: &Query<'_>, seq_counter: &mut u32) -> bool {
    if !passes_ranges(region, q) {
        return false;
    }
    let triggered = *seq_counter == region.seq_position;
    let len = region.seq_length.max(1);
    *seq_counter = (*seq_counter % len) + 1;
    triggered
}

fn passes_ranges(r: &Region, q: &Query<'_>) -> bool {
    let sw = |key: i16| key >= 0 && q.sw.get(key as usize).copied().unwrap_or(false);

    let sw_last_ok = r.sw_last == -1
        || (r.sw_last >= r.sw_lokey && r.sw_last <= r.sw_hikey && q.last_sw_key == r.sw_last);
    let sw_down_ok = r.sw_down == -1
        || (r.sw_down >= r.sw_lokey && (r.sw_hikey == -1 || r.sw_down <= r.sw_hikey) && sw(r.sw_down));
    let sw_up_ok = r.sw_up == -1
        || !(r.sw_up >= r.sw_lokey && (r.sw_hikey == -1 || r.sw_up <= r.sw_hikey))
        || !sw(r.sw_up);

    q.bend >= r.lobend
        && q.bend <= r.hibend
        && q.bpm >= r.lobpm
        && q.bpm < r.hibpm
        && q.rand >= r.lorand
        && q.rand < r.hirand
        && q.timer >= r.lotimer
        && q.timer <= r.hitimer
        && sw_last_ok
        && sw_down_ok
        && sw_up_ok
        && r.trigger.intersects(q.trig)
}

/// Reference matcher used to validate the lookup table: checks every
/// region including the dimensional bounds, without touching counters.
pub fn matches_linear(region: &Region, q: &Query<'_>, trigger_cc: Option<u8>) -> bool {
    let hikey = if region.hikey < 0 { 127 } else { region.hikey };
    let key_ok = match trigger_cc {
        None => region.lokey >= 0 && (q.key as i16) >= region.lokey && (q.key as i16) <= hikey,
        Some(cc) => region.is_cc_triggered(cc),
    };
    let sw_prev_ok = region.sw_previous == -1 || region.sw_previous == q.prev_sw_key;
    let ccs_ok = (0..128usize).all(|c| {
        let mut lo = region.locc[c] as i16;
        let mut hi = region.hicc[c] as i16;
        if trigger_cc == Some(c as u8) {
            lo = lo.max(region.on_locc[c]);
            hi = hi.min(region.on_hicc[c]);
        }
        let v = q.cc[c] as i16;
        v >= lo && v <= hi
    });
    key_ok
        && sw_prev_ok
        && ccs_ok
        && (region.lochan..=region.hichan).contains(&q.chan)
        && (region.lovel..=region.hivel).contains(&q.vel)
        && (region.lochanaft..=region.hichanaft).contains(&q.chanaft)
        && (region.lopolyaft..=region.hipolyaft).contains(&q.polyaft)
        && (region.loprog..=region.hiprog).contains(&q.prog)
        && passes_ranges(region, q)
}
